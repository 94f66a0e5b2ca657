//! CPU rasterizer for [`Scene`]
//!
//! Used both as the software path and, with `RenderPath::Accelerated`, as a
//! stand-in for a GPU renderer that redraws the whole target every frame.

use tracing::trace;

use super::scene::Scene;
use super::{RenderError, RenderPath, SceneRenderer, Viewport};
use crate::backend::{Buffer, FormatSet, Fourcc, Modifier, blend_over};
use crate::shared::{Point, Rect, Region};

const DRAWABLE: [Fourcc; 2] = [Fourcc::Xrgb8888, Fourcc::Argb8888];

#[derive(Debug)]
pub struct RasterRenderer {
    scene: Scene,
    path: RenderPath,
}

impl RasterRenderer {
    pub fn new(scene: Scene, path: RenderPath) -> Self {
        Self { scene, path }
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    fn paint_rect(&self, target: &mut Buffer, viewport: &Viewport, clip: &Rect) {
        target.fill_rect(clip, self.scene.background() | 0xff00_0000);
        for item in self.scene.items_in_order() {
            let Some(mapped) = viewport.map_rect(&item.rect) else {
                continue;
            };
            if let Some(area) = mapped.intersection(clip) {
                target.blend_rect(&area, item.color);
            }
        }
    }
}

impl SceneRenderer for RasterRenderer {
    fn path(&self) -> RenderPath {
        self.path
    }

    fn formats(&self) -> FormatSet {
        let mut modifiers = vec![Modifier::LINEAR, Modifier::INVALID];
        if self.path == RenderPath::Accelerated {
            modifiers.push(Modifier::X_TILED);
        }
        FormatSet::with_modifiers(&DRAWABLE, &modifiers)
    }

    fn poll_scene_changes(&mut self) -> Region {
        self.scene.take_damage()
    }

    fn render_into(
        &mut self,
        target: &mut Buffer,
        viewport: &Viewport,
        repaint: &Region,
    ) -> Result<Option<Region>, RenderError> {
        let format = target.format();
        if !DRAWABLE.contains(&format.code) {
            return Err(RenderError::UnsupportedFormat(format));
        }
        if target.size() != viewport.size {
            return Err(RenderError::SizeMismatch {
                target: target.size(),
                expected: viewport.size,
            });
        }

        let clip = match self.path {
            RenderPath::Accelerated => Region::from_rect(target.bounds()),
            RenderPath::Software => repaint.intersect_rect(&target.bounds()),
        };
        if clip.is_empty() {
            return Ok(None);
        }

        for rect in clip.rects() {
            self.paint_rect(target, viewport, rect);
        }
        trace!("Rendered {} rects into {}", clip.rects().len(), target.id());
        Ok(Some(clip))
    }
}

/// Blend `source` into `target` with its top-left corner at `at`.
/// Returns the touched area of `target`.
pub fn composite_layer(target: &mut Buffer, source: &Buffer, at: Point) -> Option<Rect> {
    let size = source.size();
    let area = Rect::new(at.x, at.y, size.width, size.height).intersection(&target.bounds())?;
    let opaque = !source.format().code.has_alpha();
    let target_width = target.size().width as usize;

    for row in area.y..area.bottom() as i32 {
        let src_y = (row - at.y) as u32;
        let dst_start = row as usize * target_width + area.x as usize;
        let dst = &mut target.pixels_mut()[dst_start..dst_start + area.width as usize];
        for (offset, pixel) in dst.iter_mut().enumerate() {
            let src_x = (area.x - at.x) as u32 + offset as u32;
            let Some(value) = source.pixel(src_x, src_y) else {
                continue;
            };
            *pixel = if opaque {
                value | 0xff00_0000
            } else {
                blend_over(value, *pixel)
            };
        }
    }
    Some(area)
}
