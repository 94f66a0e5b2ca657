//! Retained scene of solid rectangles
//!
//! Every mutation records the scene area it touched (old and new bounds), which
//! the renderer hands to the scheduler once per render cycle.

use std::fmt;
use tracing::trace;

use crate::shared::{Point, Rect, Region, Size};

/// Whole addressable scene; used as "everything changed"
pub const SCENE_EXTENT: Rect = Rect::new(-(1 << 24), -(1 << 24), 1 << 25, 1 << 25);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "item#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SceneItem {
    pub id: ItemId,
    pub rect: Rect,
    /// ARGB8888
    pub color: u32,
    pub z: i32,
    pub visible: bool,
}

#[derive(Debug)]
pub struct Scene {
    background: u32,
    /// Kept sorted by z, insertion order within equal z
    items: Vec<SceneItem>,
    next_id: u64,
    damage: Region,
}

impl Scene {
    pub fn new(background: u32) -> Self {
        Self {
            background,
            items: Vec::new(),
            next_id: 1,
            damage: Region::from_rect(SCENE_EXTENT),
        }
    }

    pub fn background(&self) -> u32 {
        self.background
    }

    pub fn set_background(&mut self, color: u32) {
        if self.background != color {
            self.background = color;
            self.damage_all();
        }
    }

    pub fn add_item(&mut self, rect: Rect, color: u32, z: i32) -> ItemId {
        let id = ItemId(self.next_id);
        self.next_id += 1;
        let at = self.items.partition_point(|item| item.z <= z);
        self.items.insert(
            at,
            SceneItem {
                id,
                rect,
                color,
                z,
                visible: true,
            },
        );
        self.damage_rect(rect);
        trace!("Added {} at {}", id, rect);
        id
    }

    pub fn item(&self, id: ItemId) -> Option<&SceneItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Apply `change` to an item, damaging its bounds before and after
    fn update_item(&mut self, id: ItemId, change: impl FnOnce(&mut SceneItem)) -> bool {
        let Some(item) = self.items.iter_mut().find(|item| item.id == id) else {
            return false;
        };
        let before = item.clone();
        change(item);
        if *item == before {
            return true;
        }
        let after = item.rect;
        if before.visible {
            self.damage.add_rect(before.rect);
        }
        self.damage.add_rect(after);
        true
    }

    pub fn move_item(&mut self, id: ItemId, position: Point) -> bool {
        self.update_item(id, |item| {
            item.rect = Rect::new(position.x, position.y, item.rect.width, item.rect.height);
        })
    }

    pub fn resize_item(&mut self, id: ItemId, size: Size) -> bool {
        self.update_item(id, |item| {
            item.rect = Rect::new(item.rect.x, item.rect.y, size.width, size.height);
        })
    }

    pub fn set_color(&mut self, id: ItemId, color: u32) -> bool {
        self.update_item(id, |item| item.color = color)
    }

    pub fn set_visible(&mut self, id: ItemId, visible: bool) -> bool {
        self.update_item(id, |item| item.visible = visible)
    }

    pub fn remove_item(&mut self, id: ItemId) -> bool {
        let Some(index) = self.items.iter().position(|item| item.id == id) else {
            return false;
        };
        let item = self.items.remove(index);
        if item.visible {
            self.damage_rect(item.rect);
        }
        true
    }

    pub fn damage_rect(&mut self, rect: Rect) {
        self.damage.add_rect(rect);
    }

    pub fn damage_all(&mut self) {
        self.damage = Region::from_rect(SCENE_EXTENT);
    }

    pub fn has_damage(&self) -> bool {
        !self.damage.is_empty()
    }

    /// Changed area since the last call
    pub fn take_damage(&mut self) -> Region {
        std::mem::take(&mut self.damage)
    }

    /// Visible items, bottom first
    pub fn items_in_order(&self) -> impl Iterator<Item = &SceneItem> {
        self.items.iter().filter(|item| item.visible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settled(scene: &mut Scene) {
        scene.take_damage();
        assert!(!scene.has_damage());
    }

    #[test]
    fn test_new_scene_is_fully_damaged() {
        let mut scene = Scene::new(0xff000000);
        assert!(scene.take_damage().contains_rect(&Rect::new(0, 0, 4096, 4096)));
        assert!(scene.take_damage().is_empty());
    }

    #[test]
    fn test_move_damages_old_and_new_bounds() {
        let mut scene = Scene::new(0xff000000);
        let id = scene.add_item(Rect::new(0, 0, 10, 10), 0xffff0000, 0);
        settled(&mut scene);

        assert!(scene.move_item(id, Point::new(100, 0)));
        let damage = scene.take_damage();
        assert!(damage.contains_rect(&Rect::new(0, 0, 10, 10)));
        assert!(damage.contains_rect(&Rect::new(100, 0, 10, 10)));
        assert_eq!(damage.area(), 200);
    }

    #[test]
    fn test_noop_change_records_nothing() {
        let mut scene = Scene::new(0xff000000);
        let id = scene.add_item(Rect::new(5, 5, 10, 10), 0xff00ff00, 0);
        settled(&mut scene);
        assert!(scene.set_color(id, 0xff00ff00));
        assert!(!scene.has_damage());
        assert!(!scene.move_item(ItemId(999), Point::new(0, 0)));
    }

    #[test]
    fn test_items_sorted_by_z() {
        let mut scene = Scene::new(0);
        let top = scene.add_item(Rect::new(0, 0, 1, 1), 1, 10);
        let bottom = scene.add_item(Rect::new(0, 0, 1, 1), 2, -1);
        let middle = scene.add_item(Rect::new(0, 0, 1, 1), 3, 0);
        let order: Vec<ItemId> = scene.items_in_order().map(|item| item.id).collect();
        assert_eq!(order, vec![bottom, middle, top]);

        scene.set_visible(middle, false);
        assert_eq!(scene.items_in_order().count(), 2);
        assert_eq!(scene.len(), 3);
    }

    #[test]
    fn test_remove_damages_bounds() {
        let mut scene = Scene::new(0);
        let id = scene.add_item(Rect::new(20, 20, 5, 5), 0xffffffff, 0);
        settled(&mut scene);
        assert!(scene.remove_item(id));
        assert_eq!(scene.take_damage(), Region::from_rect(Rect::new(20, 20, 5, 5)));
        assert!(scene.is_empty());
    }
}
