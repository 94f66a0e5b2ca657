//! Damage regions
//!
//! A `Region` is a set of disjoint rectangles. Disjointness keeps area math and
//! equality simple; once a region grows past `MAX_RECTS` it collapses into its
//! bounding box, which over-reports damage but never loses any.

use super::geometry::{Point, Rect};

/// Rectangle count above which a region is simplified to its bounding box
pub const MAX_RECTS: usize = 32;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    rects: Vec<Rect>,
}

impl Region {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rect(rect: Rect) -> Self {
        let mut region = Self::new();
        region.add_rect(rect);
        region
    }

    pub fn from_rects(rects: impl IntoIterator<Item = Rect>) -> Self {
        let mut region = Self::new();
        for rect in rects {
            region.add_rect(rect);
        }
        region
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    pub fn area(&self) -> u64 {
        self.rects.iter().map(Rect::area).sum()
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    pub fn bounding_box(&self) -> Option<Rect> {
        self.rects.iter().copied().reduce(|acc, rect| acc.bounding(&rect))
    }

    /// Add the part of `rect` not yet covered
    pub fn add_rect(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        if self.rects.iter().any(|existing| existing.contains_rect(&rect)) {
            return;
        }
        self.rects.retain(|existing| !rect.contains_rect(existing));

        let mut fresh = vec![rect];
        for existing in &self.rects {
            fresh = fresh.iter().flat_map(|part| part.subtract(existing)).collect();
            if fresh.is_empty() {
                return;
            }
        }
        self.rects.extend(fresh);

        if self.rects.len() > MAX_RECTS {
            if let Some(bounds) = self.bounding_box() {
                self.rects = vec![bounds];
            }
        }
    }

    pub fn union(&mut self, other: &Region) {
        for rect in &other.rects {
            self.add_rect(*rect);
        }
    }

    /// Remove `rect` from the region
    pub fn subtract_rect(&mut self, rect: &Rect) {
        if rect.is_empty() {
            return;
        }
        self.rects = self.rects.iter().flat_map(|part| part.subtract(rect)).collect();
    }

    pub fn subtract(&self, other: &Region) -> Region {
        let mut result = self.clone();
        for rect in &other.rects {
            result.subtract_rect(rect);
            if result.is_empty() {
                break;
            }
        }
        result
    }

    /// Clip to `bounds`
    pub fn intersect_rect(&self, bounds: &Rect) -> Region {
        Region {
            rects: self.rects.iter().filter_map(|rect| rect.intersection(bounds)).collect(),
        }
    }

    pub fn contains_rect(&self, rect: &Rect) -> bool {
        let mut rest = Region::from_rect(*rect);
        for existing in &self.rects {
            rest.subtract_rect(existing);
            if rest.is_empty() {
                return true;
            }
        }
        rest.is_empty()
    }

    /// True if every pixel of `other` is inside `self`
    pub fn covers(&self, other: &Region) -> bool {
        other.rects.iter().all(|rect| self.contains_rect(rect))
    }

    pub fn contains_point(&self, point: Point) -> bool {
        self.rects.iter().any(|rect| rect.contains_point(point))
    }

    pub fn translate(&self, dx: i32, dy: i32) -> Region {
        Region {
            rects: self.rects.iter().map(|rect| rect.translate(dx, dy)).collect(),
        }
    }
}

impl From<Rect> for Region {
    fn from(rect: Rect) -> Self {
        Region::from_rect(rect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_rect_is_kept_verbatim() {
        let rect = Rect::new(10, 20, 30, 40);
        let region = Region::from_rect(rect);
        assert_eq!(region.rects(), &[rect]);
    }

    #[test]
    fn test_overlapping_rects_stay_disjoint() {
        let mut region = Region::from_rect(Rect::new(0, 0, 10, 10));
        region.add_rect(Rect::new(5, 5, 10, 10));
        assert_eq!(region.area(), 100 + 100 - 25);
        for (i, a) in region.rects().iter().enumerate() {
            for b in &region.rects()[i + 1..] {
                assert!(!a.overlaps(b));
            }
        }
        assert!(!region.contains_rect(&Rect::new(0, 0, 15, 5)));
        assert!(region.contains_rect(&Rect::new(5, 5, 10, 10)));
    }

    #[test]
    fn test_contained_rect_is_ignored() {
        let mut region = Region::from_rect(Rect::new(0, 0, 100, 100));
        region.add_rect(Rect::new(10, 10, 5, 5));
        assert_eq!(region.rects().len(), 1);

        region.add_rect(Rect::new(-10, -10, 200, 200));
        assert_eq!(region.rects(), &[Rect::new(-10, -10, 200, 200)]);
    }

    #[test]
    fn test_subtract_and_covers() {
        let full = Region::from_rect(Rect::new(0, 0, 100, 100));
        let hole = Region::from_rect(Rect::new(40, 40, 20, 20));
        let rest = full.subtract(&hole);
        assert_eq!(rest.area(), 100 * 100 - 20 * 20);
        assert!(!rest.contains_point(Point::new(50, 50)));
        assert!(full.covers(&rest));
        assert!(!rest.covers(&full));

        let mut back = rest.clone();
        back.union(&hole);
        assert!(back.covers(&full));
    }

    #[test]
    fn test_many_rects_collapse_to_bounds() {
        let mut region = Region::new();
        for i in 0..=(MAX_RECTS as i32) {
            region.add_rect(Rect::new(i * 10, 0, 5, 5));
        }
        assert_eq!(region.rects().len(), 1);
        assert!(region.contains_rect(&Rect::new(0, 0, 5, 5)));
    }

    #[test]
    fn test_intersect_clips() {
        let region = Region::from_rects([Rect::new(-10, -10, 20, 20), Rect::new(90, 90, 20, 20)]);
        let clipped = region.intersect_rect(&Rect::new(0, 0, 100, 100));
        assert_eq!(clipped.area(), 100 + 100);
    }
}
