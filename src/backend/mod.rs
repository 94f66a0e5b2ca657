//! Backend contracts
//!
//! The compositor core never talks to hardware directly. Outputs are driven
//! through [`OutputBackend`] and buffers come from an [`Allocator`]; the
//! [`headless`] module provides in-memory implementations of both.

pub mod headless;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

use crate::compositor::layer::LayerId;
use crate::shared::{Point, Rect, Region, Size, Transform};

/// Pixel format code (little-endian DRM naming)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Fourcc {
    Argb8888,
    Xrgb8888,
    Abgr8888,
    Xbgr8888,
}

impl Fourcc {
    pub fn has_alpha(&self) -> bool {
        matches!(self, Fourcc::Argb8888 | Fourcc::Abgr8888)
    }

    pub const fn bytes_per_pixel(&self) -> u32 {
        4
    }
}

impl fmt::Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Fourcc::Argb8888 => "ARGB8888",
            Fourcc::Xrgb8888 => "XRGB8888",
            Fourcc::Abgr8888 => "ABGR8888",
            Fourcc::Xbgr8888 => "XBGR8888",
        };
        f.write_str(name)
    }
}

/// Buffer layout modifier (tiling / compression)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Modifier(pub u64);

impl Modifier {
    pub const LINEAR: Modifier = Modifier(0);
    /// Intel X-tiling
    pub const X_TILED: Modifier = Modifier((0x01 << 56) | 1);
    /// Implicit modifier: layout is negotiated out of band by the driver
    pub const INVALID: Modifier = Modifier(0x00ff_ffff_ffff_ffff);

    pub fn is_implicit(&self) -> bool {
        *self == Modifier::INVALID
    }
}

impl fmt::Display for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Modifier::LINEAR => f.write_str("linear"),
            Modifier::INVALID => f.write_str("implicit"),
            Modifier(value) => write!(f, "{value:#018x}"),
        }
    }
}

/// Format code qualified by a modifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Format {
    pub code: Fourcc,
    pub modifier: Modifier,
}

impl Format {
    pub const fn new(code: Fourcc, modifier: Modifier) -> Self {
        Self { code, modifier }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.code, self.modifier)
    }
}

/// Set of supported formats, ordered for deterministic negotiation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatSet(BTreeSet<Format>);

impl FormatSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every code in `codes` with every modifier in `modifiers`
    pub fn with_modifiers(codes: &[Fourcc], modifiers: &[Modifier]) -> Self {
        codes
            .iter()
            .flat_map(|code| modifiers.iter().map(move |modifier| Format::new(*code, *modifier)))
            .collect()
    }

    pub fn insert(&mut self, format: Format) -> bool {
        self.0.insert(format)
    }

    pub fn contains(&self, format: &Format) -> bool {
        self.0.contains(format)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn supports(&self, code: Fourcc) -> bool {
        self.0.iter().any(|format| format.code == code)
    }

    pub fn modifiers_for(&self, code: Fourcc) -> Vec<Modifier> {
        self.0
            .iter()
            .filter(|format| format.code == code)
            .map(|format| format.modifier)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Format> {
        self.0.iter()
    }
}

impl FromIterator<Format> for FormatSet {
    fn from_iter<I: IntoIterator<Item = Format>>(iter: I) -> Self {
        FormatSet(iter.into_iter().collect())
    }
}

/// Hardware plane class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneKind {
    Primary,
    Cursor,
    Overlay,
}

impl fmt::Display for PlaneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlaneKind::Primary => "primary",
            PlaneKind::Cursor => "cursor",
            PlaneKind::Overlay => "overlay",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// A presentable pixel surface, one 32-bit word per pixel
pub struct Buffer {
    id: BufferId,
    size: Size,
    format: Format,
    pixels: Vec<u32>,
}

impl Buffer {
    pub fn new(id: BufferId, size: Size, format: Format) -> Self {
        Self {
            id,
            size,
            format,
            pixels: vec![0; size.area() as usize],
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn stride(&self) -> u32 {
        self.size.width * self.format.code.bytes_per_pixel()
    }

    pub fn bounds(&self) -> Rect {
        Rect::from_size(self.size)
    }

    pub fn pixels(&self) -> &[u32] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u32] {
        &mut self.pixels
    }

    /// Raw bytes as scanned out
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.pixels)
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.size.width || y >= self.size.height {
            return None;
        }
        self.pixels.get((y * self.size.width + x) as usize).copied()
    }

    /// Fill `rect` (clipped to the buffer) with a solid color
    pub fn fill_rect(&mut self, rect: &Rect, color: u32) {
        let Some(clip) = rect.intersection(&self.bounds()) else {
            return;
        };
        let width = self.size.width as usize;
        for row in clip.y as usize..clip.bottom() as usize {
            let start = row * width + clip.x as usize;
            self.pixels[start..start + clip.width as usize].fill(color);
        }
    }

    /// Source-over blend of an ARGB color into `rect`
    pub fn blend_rect(&mut self, rect: &Rect, color: u32) {
        let alpha = color >> 24;
        if alpha == 0xff {
            self.fill_rect(rect, color);
            return;
        }
        if alpha == 0 {
            return;
        }
        let Some(clip) = rect.intersection(&self.bounds()) else {
            return;
        };
        let width = self.size.width as usize;
        for row in clip.y as usize..clip.bottom() as usize {
            let start = row * width + clip.x as usize;
            for pixel in &mut self.pixels[start..start + clip.width as usize] {
                *pixel = blend_over(color, *pixel);
            }
        }
    }

    /// Copy `rect` from a buffer of identical size
    pub fn copy_rect_from(&mut self, source: &Buffer, rect: &Rect) -> bool {
        if source.size != self.size {
            return false;
        }
        let Some(clip) = rect.intersection(&self.bounds()) else {
            return true;
        };
        let width = self.size.width as usize;
        for row in clip.y as usize..clip.bottom() as usize {
            let start = row * width + clip.x as usize;
            let end = start + clip.width as usize;
            self.pixels[start..end].copy_from_slice(&source.pixels[start..end]);
        }
        true
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("format", &self.format)
            .finish()
    }
}

/// Source-over for premultiplied-free ARGB words
pub fn blend_over(source: u32, dest: u32) -> u32 {
    let alpha = source >> 24;
    let inv = 255 - alpha;
    let channel = |shift: u32| {
        let s = (source >> shift) & 0xff;
        let d = (dest >> shift) & 0xff;
        ((s * alpha + d * inv + 127) / 255) & 0xff
    };
    let out_alpha = (alpha + ((dest >> 24) * inv + 127) / 255).min(255);
    (out_alpha << 24) | (channel(16) << 16) | (channel(8) << 8) | channel(0)
}

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("unsupported buffer size {0}")]
    InvalidSize(Size),
    #[error("none of the modifiers {0:?} can be allocated")]
    UnsupportedModifiers(Vec<Modifier>),
    #[error("allocator is out of buffers")]
    Exhausted,
}

/// Creates buffers for swapchains
pub trait Allocator {
    /// Allocate a buffer using one of `modifiers` (in order of preference)
    fn create_buffer(
        &self,
        size: Size,
        code: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Buffer, AllocError>;
}

/// Display mode of an output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode {
    pub size: Size,
    /// Refresh rate in mHz
    pub refresh: u32,
}

impl Mode {
    pub const fn new(size: Size, refresh: u32) -> Self {
        Self { size, refresh }
    }

    pub fn frame_interval(&self) -> std::time::Duration {
        let refresh = self.refresh.max(1) as u64;
        std::time::Duration::from_micros(1_000_000_000 / refresh)
    }
}

/// One layer placed on a hardware plane
#[derive(Debug)]
pub struct PlaneState<'a> {
    pub layer: LayerId,
    pub kind: PlaneKind,
    pub buffer: &'a Buffer,
    pub position: Point,
}

/// Borrowed view of a state to test or commit
#[derive(Debug, Default)]
pub struct OutputState<'a> {
    /// New primary buffer; `None` keeps the current one
    pub buffer: Option<&'a Buffer>,
    pub damage: Option<&'a Region>,
    pub scale: Option<f64>,
    pub transform: Option<Transform>,
    /// Layer planes; `None` leaves the current planes untouched
    pub planes: Option<&'a [PlaneState<'a>]>,
}

#[derive(Debug, Clone, Error)]
pub enum CommitError {
    #[error("format {format} rejected by the {plane} plane")]
    UnsupportedFormat { format: Format, plane: PlaneKind },
    #[error("no free {0} plane")]
    NoPlane(PlaneKind),
    #[error("buffer size {buffer} does not match mode {mode}")]
    SizeMismatch { buffer: Size, mode: Size },
    #[error("output is disabled")]
    Disabled,
    #[error("backend failure: {0}")]
    Backend(String),
}

/// A display sink as seen by the compositor core
pub trait OutputBackend {
    fn name(&self) -> &str;

    fn mode(&self) -> Mode;

    fn scale(&self) -> f64 {
        1.0
    }

    fn transform(&self) -> Transform {
        Transform::Normal
    }

    fn is_enabled(&self) -> bool {
        true
    }

    /// Formats valid for a plane; an empty set means no constraint
    fn plane_formats(&self, plane: PlaneKind) -> FormatSet;

    /// Validate a state without presenting it
    fn test_commit(&self, state: &OutputState<'_>) -> Result<(), CommitError>;

    /// Present a state
    fn commit(&mut self, state: &OutputState<'_>) -> Result<(), CommitError>;
}
