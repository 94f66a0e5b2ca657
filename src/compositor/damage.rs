//! Per-output damage history indexed by buffer age

use std::collections::VecDeque;
use tracing::trace;

use crate::shared::{Rect, Region, Size};

/// Default number of ring slots
pub const DEFAULT_RING_CAPACITY: usize = 4;

/// Damage ring.
///
/// Slot `k` holds all damage added since `k` rotations ago, so slot 0 is the
/// damage of the frame being built. Ages `1..capacity` are tracked; age 0
/// (unknown contents) and anything older fall back to full damage.
#[derive(Debug, Clone)]
pub struct DamageRing {
    bounds: Size,
    slots: VecDeque<Region>,
}

impl DamageRing {
    pub fn new(bounds: Size, capacity: usize) -> Self {
        let capacity = capacity.max(2);
        let full = Region::from_rect(Rect::from_size(bounds));
        Self {
            bounds,
            slots: std::iter::repeat_n(full, capacity).collect(),
        }
    }

    pub fn bounds(&self) -> Size {
        self.bounds
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn full(&self) -> Rect {
        Rect::from_size(self.bounds)
    }

    /// Merge damage into every slot
    pub fn add(&mut self, region: &Region) {
        let clipped = region.intersect_rect(&self.full());
        if clipped.is_empty() {
            return;
        }
        trace!("Damage added: {:?}", clipped.rects());
        for slot in &mut self.slots {
            slot.union(&clipped);
        }
    }

    pub fn add_rect(&mut self, rect: Rect) {
        self.add(&Region::from_rect(rect));
    }

    pub fn add_whole(&mut self) {
        self.add_rect(self.full());
    }

    /// Damage of the frame being built (since the last rotate)
    pub fn frame_damage(&self) -> &Region {
        &self.slots[0]
    }

    /// Everything a buffer of `age` is missing
    pub fn buffer_damage(&self, age: u32) -> Region {
        let age = age as usize;
        if age == 0 || age >= self.slots.len() {
            return Region::from_rect(self.full());
        }
        self.slots[age].clone()
    }

    /// Advance one frame; the oldest history is dropped
    pub fn rotate(&mut self) {
        self.slots.pop_back();
        self.slots.push_front(Region::new());
    }

    /// Track a new output size; a change invalidates all history
    pub fn set_bounds(&mut self, bounds: Size) {
        if bounds == self.bounds {
            return;
        }
        self.bounds = bounds;
        let full = Region::from_rect(self.full());
        for slot in &mut self.slots {
            *slot = full.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settled_ring() -> DamageRing {
        let mut ring = DamageRing::new(Size::new(800, 600), 4);
        for _ in 0..4 {
            ring.rotate();
        }
        ring
    }

    #[test]
    fn test_new_ring_reports_full_damage() {
        let ring = DamageRing::new(Size::new(800, 600), 4);
        let full = Region::from_rect(Rect::new(0, 0, 800, 600));
        for age in 0..6 {
            assert_eq!(ring.buffer_damage(age), full);
        }
    }

    #[test]
    fn test_damage_survives_one_rotation() {
        let mut ring = settled_ring();
        let rect = Rect::new(10, 10, 50, 50);
        ring.add_rect(rect);
        ring.rotate();
        assert!(ring.buffer_damage(1).contains_rect(&rect));
        assert!(ring.frame_damage().is_empty());
    }

    #[test]
    fn test_old_and_unknown_ages_are_full() {
        let ring = settled_ring();
        let full = Region::from_rect(Rect::new(0, 0, 800, 600));
        assert_eq!(ring.buffer_damage(0), full);
        for age in ring.capacity() as u32..ring.capacity() as u32 + 3 {
            assert_eq!(ring.buffer_damage(age), full);
        }
        assert!(ring.buffer_damage(1).is_empty());
    }

    #[test]
    fn test_history_accumulates_by_age() {
        let mut ring = settled_ring();
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(100, 100, 10, 10);
        ring.add_rect(a);
        ring.rotate();
        ring.add_rect(b);
        assert_eq!(ring.frame_damage(), &Region::from_rect(b));
        ring.rotate();

        let age1 = ring.buffer_damage(1);
        assert!(age1.contains_rect(&b));
        assert!(!age1.contains_rect(&a));
        let age2 = ring.buffer_damage(2);
        assert!(age2.contains_rect(&a) && age2.contains_rect(&b));
    }

    #[test]
    fn test_damage_is_clipped_to_bounds() {
        let mut ring = settled_ring();
        ring.add_rect(Rect::new(790, 590, 100, 100));
        assert_eq!(ring.frame_damage().area(), 100);
    }

    #[test]
    fn test_resize_resets_history() {
        let mut ring = settled_ring();
        ring.set_bounds(Size::new(1024, 768));
        let full = Region::from_rect(Rect::new(0, 0, 1024, 768));
        assert_eq!(ring.buffer_damage(1), full);
        assert_eq!(ring.frame_damage(), &full);
    }
}
