//! Overlay layers and their routing to mirror outputs
//!
//! A [`Layer`] is the content of one hardware plane (cursor or overlay). The
//! [`LayerRouter`] remembers on which outputs each layer is shown and keeps
//! mirrors in step with their primary output.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::output::OutputId;
use super::swapchain::Slot;
use crate::backend::PlaneKind;
use crate::render::scene::ItemId;
use crate::shared::{Point, Rect, Size};

static NEXT_LAYER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(u64);

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer#{}", self.0)
    }
}

#[derive(Debug)]
struct LayerContent {
    /// Top-left corner in scene coordinates
    position: Point,
    buffer: Option<Rc<Slot>>,
}

#[derive(Debug)]
struct LayerInner {
    id: LayerId,
    kind: PlaneKind,
    size: Size,
    content: RefCell<LayerContent>,
}

/// Shared handle to an overlay layer; clones refer to the same layer
#[derive(Debug, Clone)]
pub struct Layer(Rc<LayerInner>);

impl Layer {
    pub fn new(kind: PlaneKind, size: Size) -> Self {
        let id = LayerId(NEXT_LAYER_ID.fetch_add(1, Ordering::Relaxed));
        Layer(Rc::new(LayerInner {
            id,
            kind,
            size,
            content: RefCell::new(LayerContent {
                position: Point::default(),
                buffer: None,
            }),
        }))
    }

    pub fn id(&self) -> LayerId {
        self.0.id
    }

    pub fn kind(&self) -> PlaneKind {
        self.0.kind
    }

    pub fn size(&self) -> Size {
        self.0.size
    }

    pub fn position(&self) -> Point {
        self.0.content.borrow().position
    }

    pub fn set_position(&self, position: Point) {
        self.0.content.borrow_mut().position = position;
    }

    /// Scene-space rectangle covered by the layer
    pub fn rect(&self) -> Rect {
        let position = self.position();
        Rect::new(position.x, position.y, self.0.size.width, self.0.size.height)
    }

    /// Replace the content. Outputs still showing the previous buffer keep
    /// their reference until their next commit.
    pub fn set_buffer(&self, slot: Slot) {
        self.0.content.borrow_mut().buffer = Some(Rc::new(slot));
    }

    pub fn clear_buffer(&self) {
        self.0.content.borrow_mut().buffer = None;
    }

    pub fn buffer(&self) -> Option<Rc<Slot>> {
        self.0.content.borrow().buffer.clone()
    }
}

impl PartialEq for Layer {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Layer {}

/// Where a routed layer comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerSource {
    pub viewport: OutputId,
    pub item: Option<ItemId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerEvent {
    Attached { layer: LayerId, target: OutputId },
    Detached { layer: LayerId, target: OutputId },
    /// The layer is no longer shown anywhere
    Released(LayerId),
}

#[derive(Debug)]
struct Attachment {
    layer: Layer,
    target: OutputId,
    source: LayerSource,
}

#[derive(Debug, Default)]
pub struct LayerRouter {
    attachments: Vec<Attachment>,
    primary_layers: HashMap<OutputId, Vec<Layer>>,
    /// (primary, mirror) links
    mirrors: Vec<(OutputId, OutputId)>,
}

impl LayerRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Show `layer` on `target`; attaching an existing pair only updates its source
    pub fn attach(&mut self, layer: &Layer, target: OutputId, source: LayerSource) -> Vec<LayerEvent> {
        if let Some(existing) = self
            .attachments
            .iter_mut()
            .find(|a| a.target == target && a.layer == *layer)
        {
            existing.source = source;
            return Vec::new();
        }
        debug!("Attaching {} to {}", layer.id(), target);
        self.attachments.push(Attachment {
            layer: layer.clone(),
            target,
            source,
        });
        vec![LayerEvent::Attached {
            layer: layer.id(),
            target,
        }]
    }

    /// Stop showing `layer` on `target`; releases it when no target remains
    pub fn detach(&mut self, layer: LayerId, target: OutputId) -> Vec<LayerEvent> {
        let before = self.attachments.len();
        self.attachments
            .retain(|a| !(a.target == target && a.layer.id() == layer));
        if self.attachments.len() == before {
            return Vec::new();
        }
        debug!("Detached {} from {}", layer, target);

        let mut events = vec![LayerEvent::Detached { layer, target }];
        if !self.attachments.iter().any(|a| a.layer.id() == layer) {
            debug!("Released {}", layer);
            events.push(LayerEvent::Released(layer));
        }
        events
    }

    pub fn is_attached(&self, layer: LayerId, target: OutputId) -> bool {
        self.attachments
            .iter()
            .any(|a| a.target == target && a.layer.id() == layer)
    }

    pub fn source_of(&self, layer: LayerId, target: OutputId) -> Option<LayerSource> {
        self.attachments
            .iter()
            .find(|a| a.target == target && a.layer.id() == layer)
            .map(|a| a.source)
    }

    /// Layers to present on `target`, in attach order
    pub fn layers_for(&self, target: OutputId) -> Vec<Layer> {
        self.attachments
            .iter()
            .filter(|a| a.target == target)
            .map(|a| a.layer.clone())
            .collect()
    }

    pub fn primary_layers(&self, primary: OutputId) -> &[Layer] {
        self.primary_layers
            .get(&primary)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn mirrors_of(&self, primary: OutputId) -> Vec<OutputId> {
        self.mirrors
            .iter()
            .filter(|(p, _)| *p == primary)
            .map(|(_, m)| *m)
            .collect()
    }

    pub fn primary_of(&self, mirror: OutputId) -> Option<OutputId> {
        self.mirrors.iter().find(|(_, m)| *m == mirror).map(|(p, _)| *p)
    }

    /// Make `mirror` show `primary`'s layers
    pub fn add_mirror(&mut self, primary: OutputId, mirror: OutputId) -> Vec<LayerEvent> {
        if primary == mirror || self.primary_of(mirror).is_some() {
            return Vec::new();
        }
        self.mirrors.push((primary, mirror));

        let source = LayerSource {
            viewport: primary,
            item: None,
        };
        let layers = self.primary_layers(primary).to_vec();
        layers
            .iter()
            .flat_map(|layer| self.attach(layer, mirror, source))
            .collect()
    }

    /// Unlink `mirror` and drop the layers it was replicating
    pub fn remove_mirror(&mut self, mirror: OutputId) -> Vec<LayerEvent> {
        let Some(primary) = self.primary_of(mirror) else {
            return Vec::new();
        };
        self.mirrors.retain(|(_, m)| *m != mirror);

        let replicated: Vec<LayerId> = self
            .attachments
            .iter()
            .filter(|a| a.target == mirror && a.source.viewport == primary)
            .map(|a| a.layer.id())
            .collect();
        replicated
            .into_iter()
            .flat_map(|layer| self.detach(layer, mirror))
            .collect()
    }

    /// Replace the layer set of `primary` and mirror the difference.
    ///
    /// Layers are compared by identity: one that is present in both lists is
    /// left alone even if its content changed. Removed layers are detached from
    /// the mirrors first and from the primary last.
    pub fn set_primary_layers(&mut self, primary: OutputId, layers: Vec<Layer>) -> Vec<LayerEvent> {
        let old = self.primary_layers.remove(&primary).unwrap_or_default();
        let mirrors = self.mirrors_of(primary);
        let mut events = Vec::new();

        for layer in old.iter().filter(|l| !layers.contains(l)) {
            for mirror in &mirrors {
                events.extend(self.detach(layer.id(), *mirror));
            }
            events.extend(self.detach(layer.id(), primary));
        }

        let source = LayerSource {
            viewport: primary,
            item: None,
        };
        for layer in layers.iter().filter(|l| !old.contains(l)) {
            events.extend(self.attach(layer, primary, source));
            for mirror in &mirrors {
                events.extend(self.attach(layer, *mirror, source));
            }
        }

        self.primary_layers.insert(primary, layers);
        events
    }

    /// Forget an output entirely
    pub fn remove_output(&mut self, output: OutputId) -> Vec<LayerEvent> {
        let mut events = self.remove_mirror(output);
        for mirror in self.mirrors_of(output) {
            events.extend(self.remove_mirror(mirror));
        }
        self.primary_layers.remove(&output);

        let remaining: Vec<LayerId> = self
            .attachments
            .iter()
            .filter(|a| a.target == output)
            .map(|a| a.layer.id())
            .collect();
        for layer in remaining {
            events.extend(self.detach(layer, output));
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (OutputId, OutputId, OutputId) {
        (OutputId::next(), OutputId::next(), OutputId::next())
    }

    fn cursor() -> Layer {
        Layer::new(PlaneKind::Cursor, Size::new(64, 64))
    }

    #[test]
    fn test_attach_detach_release() {
        let (a, b, _) = ids();
        let mut router = LayerRouter::new();
        let layer = cursor();
        let source = LayerSource { viewport: a, item: None };

        assert_eq!(router.attach(&layer, a, source).len(), 1);
        assert!(router.attach(&layer, a, source).is_empty());
        router.attach(&layer, b, source);

        let events = router.detach(layer.id(), a);
        assert_eq!(events, vec![LayerEvent::Detached { layer: layer.id(), target: a }]);
        let events = router.detach(layer.id(), b);
        assert_eq!(
            events,
            vec![
                LayerEvent::Detached { layer: layer.id(), target: b },
                LayerEvent::Released(layer.id()),
            ]
        );
        assert!(router.detach(layer.id(), b).is_empty());
    }

    #[test]
    fn test_primary_changes_reach_mirrors() {
        let (primary, mirror, _) = ids();
        let mut router = LayerRouter::new();
        router.add_mirror(primary, mirror);

        let layer = cursor();
        router.set_primary_layers(primary, vec![layer.clone()]);
        assert_eq!(router.layers_for(mirror), vec![layer.clone()]);
        assert_eq!(
            router.source_of(layer.id(), mirror).map(|s| s.viewport),
            Some(primary)
        );

        let events = router.set_primary_layers(primary, Vec::new());
        assert_eq!(
            events,
            vec![
                LayerEvent::Detached { layer: layer.id(), target: mirror },
                LayerEvent::Detached { layer: layer.id(), target: primary },
                LayerEvent::Released(layer.id()),
            ]
        );
        assert!(router.layers_for(mirror).is_empty());
    }

    #[test]
    fn test_same_identity_is_not_reattached() {
        let (primary, mirror, _) = ids();
        let mut router = LayerRouter::new();
        router.add_mirror(primary, mirror);
        let layer = cursor();
        router.set_primary_layers(primary, vec![layer.clone()]);

        layer.set_position(Point::new(40, 40));
        let events = router.set_primary_layers(primary, vec![layer.clone()]);
        assert!(events.is_empty());
    }

    #[test]
    fn test_late_mirror_gets_existing_layers() {
        let (primary, mirror, other) = ids();
        let mut router = LayerRouter::new();
        let a = cursor();
        let b = Layer::new(PlaneKind::Overlay, Size::new(128, 128));
        router.set_primary_layers(primary, vec![a.clone(), b.clone()]);

        let events = router.add_mirror(primary, mirror);
        assert_eq!(events.len(), 2);
        assert_eq!(router.layers_for(mirror), vec![a.clone(), b.clone()]);
        assert!(router.layers_for(other).is_empty());

        router.remove_mirror(mirror);
        assert!(router.layers_for(mirror).is_empty());
        assert_eq!(router.layers_for(primary).len(), 2);
    }

    #[test]
    fn test_mirror_layers_subset_of_primary() {
        let (primary, mirror, _) = ids();
        let mut router = LayerRouter::new();
        router.add_mirror(primary, mirror);
        let layers: Vec<Layer> = (0..4).map(|_| cursor()).collect();

        for keep in [4usize, 2, 3, 0, 1] {
            router.set_primary_layers(primary, layers[..keep].to_vec());
            let current = router.primary_layers(primary).to_vec();
            for layer in router.layers_for(mirror) {
                assert!(current.contains(&layer));
            }
        }
    }

    #[test]
    fn test_remove_output_cleans_links() {
        let (primary, mirror, _) = ids();
        let mut router = LayerRouter::new();
        router.add_mirror(primary, mirror);
        let layer = cursor();
        router.set_primary_layers(primary, vec![layer.clone()]);

        let events = router.remove_output(primary);
        assert!(events.contains(&LayerEvent::Released(layer.id())));
        assert!(router.mirrors_of(primary).is_empty());
        assert!(router.primary_of(mirror).is_none());
    }
}
