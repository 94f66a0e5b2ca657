//! Geometry shared by the scheduler, the renderers and the backends
//!
//! All rectangles are integer pixel rectangles. Scene coordinates and output
//! buffer coordinates use the same types; `Viewport` converts between them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pixel size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Pixel position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Rectangle (position and size)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Rectangle anchored at the origin
    pub const fn from_size(size: Size) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    /// Build from edge coordinates; inverted edges give an empty rectangle
    pub fn from_edges(left: i64, top: i64, right: i64, bottom: i64) -> Self {
        let clamp = |v: i64| v.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        let width = (right - left).clamp(0, u32::MAX as i64) as u32;
        let height = (bottom - top).clamp(0, u32::MAX as i64) as u32;
        Self::new(clamp(left), clamp(top), width, height)
    }

    pub fn loc(&self) -> Point {
        Point::new(self.x, self.y)
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn translate(&self, dx: i32, dy: i32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    pub fn contains_point(&self, point: Point) -> bool {
        let (px, py) = (point.x as i64, point.y as i64);
        px >= self.x as i64 && py >= self.y as i64 && px < self.right() && py < self.bottom()
    }

    /// True if `other` lies completely inside `self`
    pub fn contains_rect(&self, other: &Rect) -> bool {
        if other.is_empty() {
            return true;
        }
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let left = (self.x as i64).max(other.x as i64);
        let top = (self.y as i64).max(other.y as i64);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if left >= right || top >= bottom {
            return None;
        }
        Some(Rect::from_edges(left, top, right, bottom))
    }

    pub fn overlaps(&self, other: &Rect) -> bool {
        self.intersection(other).is_some()
    }

    /// Smallest rectangle containing both
    pub fn bounding(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Rect::from_edges(
            (self.x as i64).min(other.x as i64),
            (self.y as i64).min(other.y as i64),
            self.right().max(other.right()),
            self.bottom().max(other.bottom()),
        )
    }

    /// Parts of `self` not covered by `other` (at most four disjoint bands)
    pub fn subtract(&self, other: &Rect) -> Vec<Rect> {
        let Some(hole) = self.intersection(other) else {
            return if self.is_empty() { Vec::new() } else { vec![*self] };
        };

        let mut parts = Vec::with_capacity(4);
        let top = Rect::from_edges(self.x as i64, self.y as i64, self.right(), hole.y as i64);
        let bottom = Rect::from_edges(self.x as i64, hole.bottom(), self.right(), self.bottom());
        let left = Rect::from_edges(self.x as i64, hole.y as i64, hole.x as i64, hole.bottom());
        let right = Rect::from_edges(hole.right(), hole.y as i64, self.right(), hole.bottom());
        for part in [top, bottom, left, right] {
            if !part.is_empty() {
                parts.push(part);
            }
        }
        parts
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// Output transform (rotation is clockwise)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transform {
    #[default]
    Normal,
    Rotate90,
    Rotate180,
    Rotate270,
    Flipped,
    Flipped90,
    Flipped180,
    Flipped270,
}

impl Transform {
    /// Whether width and height trade places
    pub fn swaps_axes(&self) -> bool {
        matches!(
            self,
            Transform::Rotate90 | Transform::Rotate270 | Transform::Flipped90 | Transform::Flipped270
        )
    }

    pub fn transform_size(&self, size: Size) -> Size {
        if self.swaps_axes() {
            Size::new(size.height, size.width)
        } else {
            size
        }
    }

    /// Map `rect` living in an untransformed `area` into the transformed area
    pub fn transform_rect_in(&self, rect: Rect, area: Size) -> Rect {
        let (x, y) = (rect.x as i64, rect.y as i64);
        let (w, h) = (rect.width as i64, rect.height as i64);
        let (aw, ah) = (area.width as i64, area.height as i64);
        let (nx, ny) = match self {
            Transform::Normal => (x, y),
            Transform::Rotate90 => (ah - y - h, x),
            Transform::Rotate180 => (aw - x - w, ah - y - h),
            Transform::Rotate270 => (y, aw - x - w),
            Transform::Flipped => (aw - x - w, y),
            Transform::Flipped90 => (ah - y - h, aw - x - w),
            Transform::Flipped180 => (x, ah - y - h),
            Transform::Flipped270 => (y, x),
        };
        let size = self.transform_size(rect.size());
        Rect::from_edges(nx, ny, nx + size.width as i64, ny + size.height as i64)
    }
}
