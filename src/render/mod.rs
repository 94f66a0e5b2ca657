//! Scene rendering contract
//!
//! The scheduler owns exactly one [`SceneRenderer`] and lends it to each
//! output in turn. Renderers come in two flavours: accelerated ones redraw the
//! whole target every frame, software ones only repaint what they are told to.

pub mod raster;
pub mod scene;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{Buffer, Format, FormatSet};
use crate::shared::{Point, Rect, Region, Size, Transform};

pub use raster::{RasterRenderer, composite_layer};
pub use scene::{ItemId, Scene};

/// How a renderer treats its targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderPath {
    /// Full redraw each frame; damage only feeds the display hint
    Accelerated,
    /// Partial repaint; stale areas are backfilled from the previous buffer
    Software,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("renderer initialization failed: {0}")]
    Init(String),
    #[error("cannot render into {0}")]
    UnsupportedFormat(Format),
    #[error("target is {target} but the viewport expects {expected}")]
    SizeMismatch { target: Size, expected: Size },
}

pub trait SceneRenderer {
    /// Prepare the graphics context. Failure is fatal for the compositor.
    fn initialize(&mut self) -> Result<(), RenderError> {
        Ok(())
    }

    fn path(&self) -> RenderPath;

    /// Formats the renderer can draw into
    fn formats(&self) -> FormatSet;

    /// Flush pending scene changes; returns the changed area in scene coordinates.
    /// Called once per render cycle and shared by every output.
    fn poll_scene_changes(&mut self) -> Region;

    /// Draw the scene as seen through `viewport` into `target`.
    ///
    /// Software renderers only touch `repaint`; accelerated ones may ignore it.
    /// Returns the area actually written, `None` if nothing was drawn.
    fn render_into(
        &mut self,
        target: &mut Buffer,
        viewport: &Viewport,
        repaint: &Region,
    ) -> Result<Option<Region>, RenderError>;
}

/// Placement of one output over the shared scene
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    /// Scene position of the output's top-left corner
    pub origin: Point,
    /// Buffer size in pixels
    pub size: Size,
    pub scale: f64,
    pub transform: Transform,
    pub visible: bool,
}

impl Viewport {
    pub fn new(size: Size, scale: f64, transform: Transform) -> Self {
        Self {
            origin: Point::default(),
            size,
            scale: if scale > 0.0 { scale } else { 1.0 },
            transform,
            visible: true,
        }
    }

    pub fn with_origin(mut self, origin: Point) -> Self {
        self.origin = origin;
        self
    }

    /// Show the same scene area as `primary`, fitted into `size`
    pub fn mirror_of(primary: &Viewport, size: Size, transform: Transform) -> Self {
        let content = transform.transform_size(size);
        let logical = primary.logical_size();
        let scale = if logical.is_empty() {
            1.0
        } else {
            (content.width as f64 / logical.width as f64)
                .min(content.height as f64 / logical.height as f64)
        };
        Self::new(size, scale, transform).with_origin(primary.origin)
    }

    /// Untransformed content size in pixels
    fn content_size(&self) -> Size {
        self.transform.transform_size(self.size)
    }

    /// Size in scene units
    pub fn logical_size(&self) -> Size {
        let content = self.content_size();
        Size::new(
            (content.width as f64 / self.scale).ceil() as u32,
            (content.height as f64 / self.scale).ceil() as u32,
        )
    }

    /// Scene area covered by this output
    pub fn scene_rect(&self) -> Rect {
        let logical = self.logical_size();
        Rect::new(self.origin.x, self.origin.y, logical.width, logical.height)
    }

    pub fn buffer_rect(&self) -> Rect {
        Rect::from_size(self.size)
    }

    /// Map a scene rectangle into buffer pixels; `None` if off-screen
    pub fn map_rect(&self, rect: &Rect) -> Option<Rect> {
        let visible = rect.intersection(&self.scene_rect())?;
        let scale = self.scale;
        let edge = |value: i64, origin: i32, round: fn(f64) -> f64| {
            round((value - origin as i64) as f64 * scale) as i64
        };
        let scaled = Rect::from_edges(
            edge(visible.x as i64, self.origin.x, f64::floor),
            edge(visible.y as i64, self.origin.y, f64::floor),
            edge(visible.right(), self.origin.x, f64::ceil),
            edge(visible.bottom(), self.origin.y, f64::ceil),
        );
        let content = self.content_size();
        let clipped = scaled.intersection(&Rect::from_size(content))?;
        Some(self.transform.transform_rect_in(clipped, content))
    }

    /// Buffer position of a scene point; may lie outside the buffer
    pub fn map_point(&self, point: Point) -> Point {
        let x = ((point.x as i64 - self.origin.x as i64) as f64 * self.scale).floor() as i64;
        let y = ((point.y as i64 - self.origin.y as i64) as f64 * self.scale).floor() as i64;
        let unit = Rect::from_edges(x, y, x + 1, y + 1);
        self.transform.transform_rect_in(unit, self.content_size()).loc()
    }

    pub fn map_region(&self, region: &Region) -> Region {
        Region::from_rects(region.rects().iter().filter_map(|rect| self.map_rect(rect)))
    }
}
