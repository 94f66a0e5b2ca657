//! Compositor Module
//!
//! Frame scheduling across outputs: one scene renderer, many displays.
//!
//! Scene changes only mark outputs dirty and wake the event loop; the actual
//! render pass runs later from [`FrameScheduler::render`], so every output of a
//! cycle sees the same scene snapshot.

pub mod damage;
pub mod fps;
pub mod layer;
pub mod output;
pub mod swapchain;

use std::sync::Arc;
use tokio::sync::Notify;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, trace, warn};

use crate::backend::Fourcc;
use crate::error::OutputError;
use crate::render::raster::composite_layer;
use crate::render::{RenderError, SceneRenderer, Viewport};
use crate::shared::Region;
use layer::{Layer, LayerEvent, LayerId, LayerRouter, LayerSource};
use output::{OutputEvent, OutputHelper, OutputId};

/// Emitted after every successful commit of an output, empty ones included
#[derive(Debug, Clone, PartialEq)]
pub struct FrameDone {
    pub output: OutputId,
    /// Number of successful commits on this output so far
    pub sequence: u64,
    /// Damage reported to the display, in buffer coordinates; empty when no
    /// new content was presented
    pub damage: Region,
}

impl FrameDone {
    fn new(helper: &OutputHelper, damage: Region) -> Self {
        let stats = helper.stats();
        Self {
            output: helper.id(),
            sequence: stats.commits + stats.empty_commits,
            damage,
        }
    }
}

pub struct FrameScheduler<R: SceneRenderer> {
    renderer: R,
    preferred_format: Fourcc,
    outputs: Vec<OutputHelper>,
    router: LayerRouter,
    initialized: bool,
    render_pending: bool,
    wake: Arc<Notify>,
    listeners: Vec<UnboundedSender<FrameDone>>,
}

impl<R: SceneRenderer> FrameScheduler<R> {
    pub fn new(renderer: R, preferred_format: Fourcc) -> Self {
        Self {
            renderer,
            preferred_format,
            outputs: Vec::new(),
            router: LayerRouter::new(),
            initialized: false,
            render_pending: false,
            wake: Arc::new(Notify::new()),
            listeners: Vec::new(),
        }
    }

    /// Bring up the renderer. An error here is fatal.
    pub fn initialize(&mut self) -> Result<(), RenderError> {
        self.renderer.initialize()?;
        self.initialized = true;
        info!(
            "Frame scheduler ready ({:?} path, {} outputs)",
            self.renderer.path(),
            self.outputs.len()
        );
        if !self.outputs.is_empty() {
            self.schedule_render();
        }
        Ok(())
    }

    pub fn attach(&mut self, helper: OutputHelper) -> OutputId {
        let id = helper.id();
        debug!("Attaching {} ({})", helper.name(), id);
        self.outputs.push(helper);
        if self.initialized {
            self.schedule_render();
        }
        id
    }

    pub fn detach(&mut self, id: OutputId) -> Option<OutputHelper> {
        let index = self.outputs.iter().position(|helper| helper.id() == id)?;
        let events = self.router.remove_output(id);
        let helper = self.outputs.remove(index);
        info!("Detached {} ({})", helper.name(), id);
        self.apply_layer_events(&events);
        Some(helper)
    }

    pub fn output(&self, id: OutputId) -> Option<&OutputHelper> {
        self.outputs.iter().find(|helper| helper.id() == id)
    }

    pub fn output_mut(&mut self, id: OutputId) -> Option<&mut OutputHelper> {
        self.outputs.iter_mut().find(|helper| helper.id() == id)
    }

    /// Attached outputs in attach order
    pub fn outputs(&self) -> &[OutputHelper] {
        &self.outputs
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.renderer
    }

    pub fn router(&self) -> &LayerRouter {
        &self.router
    }

    /// The scene changed: every output needs a new frame
    pub fn update(&mut self) {
        for helper in &mut self.outputs {
            helper.mark_dirty();
        }
        self.schedule_render();
    }

    /// Ask the event loop for a render pass; never renders synchronously
    pub fn schedule_render(&mut self) {
        if !self.render_pending {
            self.render_pending = true;
            self.wake.notify_one();
        }
    }

    pub fn render_pending(&self) -> bool {
        self.render_pending
    }

    /// Notified whenever a render pass is requested
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub fn handle_output_event(&mut self, id: OutputId, event: OutputEvent) {
        let mode_changed = matches!(event, OutputEvent::ModeChanged { .. });
        let Some(helper) = self.output_mut(id) else {
            debug!("Event for unknown {}: {:?}", id, event);
            return;
        };
        let request = helper.handle(event);
        if mode_changed {
            self.refit_mirrors(id);
        }
        if request.is_some() {
            self.schedule_render();
        }
    }

    /// Receive a [`FrameDone`] for every committed frame
    pub fn subscribe(&mut self) -> UnboundedReceiver<FrameDone> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.push(tx);
        rx
    }

    pub fn attach_layer(&mut self, layer: &Layer, target: OutputId, source: LayerSource) -> Vec<LayerEvent> {
        let events = self.router.attach(layer, target, source);
        self.apply_layer_events(&events);
        events
    }

    pub fn detach_layer(&mut self, layer: LayerId, target: OutputId) -> Vec<LayerEvent> {
        let events = self.router.detach(layer, target);
        self.apply_layer_events(&events);
        events
    }

    /// Replace the layers of `primary`; mirrors follow before the next commit
    pub fn set_primary_layers(&mut self, primary: OutputId, layers: Vec<Layer>) -> Vec<LayerEvent> {
        let events = self.router.set_primary_layers(primary, layers);
        self.apply_layer_events(&events);
        events
    }

    /// Make `mirror` show the scene area and layers of `primary`
    pub fn add_mirror(&mut self, primary: OutputId, mirror: OutputId) -> Vec<LayerEvent> {
        if self.output(primary).is_none() || self.output(mirror).is_none() {
            warn!("Cannot mirror {} on {}: unknown output", primary, mirror);
            return Vec::new();
        }
        let events = self.router.add_mirror(primary, mirror);
        if self.router.primary_of(mirror) == Some(primary) {
            info!("{} now mirrors {}", mirror, primary);
            self.refit_mirrors(primary);
        }
        self.apply_layer_events(&events);
        events
    }

    pub fn remove_mirror(&mut self, mirror: OutputId) -> Vec<LayerEvent> {
        let events = self.router.remove_mirror(mirror);
        if let Some(helper) = self.output_mut(mirror) {
            helper.mark_dirty();
        }
        self.apply_layer_events(&events);
        self.schedule_render();
        events
    }

    /// Fit every mirror of `primary` to its current scene area
    fn refit_mirrors(&mut self, primary: OutputId) {
        let Some(source) = self.output(primary).map(|helper| *helper.viewport()) else {
            return;
        };
        for mirror in self.router.mirrors_of(primary) {
            if let Some(helper) = self.output_mut(mirror) {
                let current = helper.viewport();
                let mut fitted = Viewport::mirror_of(&source, current.size, current.transform);
                fitted.visible = current.visible;
                helper.set_viewport(fitted);
            }
        }
    }

    fn apply_layer_events(&mut self, events: &[LayerEvent]) {
        let mut touched = false;
        for event in events {
            trace!("{:?}", event);
            let target = match event {
                LayerEvent::Attached { target, .. } | LayerEvent::Detached { target, .. } => *target,
                LayerEvent::Released(layer) => {
                    debug!("{} released", layer);
                    continue;
                }
            };
            if let Some(helper) = self.output_mut(target) {
                helper.mark_dirty();
                touched = true;
            }
        }
        if touched {
            self.schedule_render();
        }
    }

    /// Run one render pass over all outputs; returns the number of frames
    /// committed with new content.
    pub fn render(&mut self) -> usize {
        self.render_pending = false;
        if !self
            .outputs
            .iter()
            .any(|helper| helper.is_renderable() && helper.is_visible())
        {
            trace!("No renderable output");
            return 0;
        }

        let scene_damage = self.renderer.poll_scene_changes();
        if !scene_damage.is_empty() {
            for helper in &mut self.outputs {
                let damage = helper.viewport().map_region(&scene_damage);
                if !damage.is_empty() {
                    helper.add_damage(&damage);
                }
            }
        }

        let mut done = Vec::new();
        let mut committed = 0;
        for helper in &mut self.outputs {
            if !helper.is_renderable() || !helper.is_visible() {
                continue;
            }

            if !helper.is_dirty() {
                if helper.needs_frame() {
                    match helper.commit() {
                        Ok(()) => {
                            helper.reset_state(false);
                            done.push(FrameDone::new(helper, Region::new()));
                        }
                        Err(err) => debug!("{}: empty commit failed: {}", helper.name(), err),
                    }
                }
                continue;
            }

            match render_output(helper, &mut self.renderer, &self.router, self.preferred_format) {
                Ok(damage) => {
                    helper.reset_state(true);
                    committed += 1;
                    done.push(FrameDone::new(helper, damage));
                }
                Err(err) => {
                    helper.record_skip();
                    if err.is_transient() {
                        debug!("{}: frame skipped: {}", helper.name(), err);
                    } else {
                        warn!("{}: frame failed: {}", helper.name(), err);
                    }
                }
            }
        }

        for frame in done {
            self.listeners.retain(|tx| tx.send(frame.clone()).is_ok());
        }
        committed
    }
}

/// Render and commit one output. The acquired target goes back to the pool
/// on every error path.
fn render_output<R: SceneRenderer>(
    helper: &mut OutputHelper,
    renderer: &mut R,
    router: &LayerRouter,
    preferred_format: Fourcc,
) -> Result<Region, OutputError> {
    let layers = router.layers_for(helper.id());
    let fallback = helper.assign_layers(&layers);
    helper.damage_fallback_layers(&fallback);

    let slot = helper.acquire_render_target(&renderer.formats(), preferred_format)?;
    let viewport = *helper.viewport();
    {
        let mut target = slot.buffer_mut();
        let repaint = helper.prepare_target(&mut target, slot.age(), renderer.path());
        renderer.render_into(&mut target, &viewport, &repaint)?;

        for layer in &fallback {
            let Some(content) = layer.buffer() else {
                continue;
            };
            let at = viewport.map_point(layer.position());
            composite_layer(&mut target, &content.buffer(), at);
        }
    }

    let damage = helper.damage().frame_damage().clone();
    helper.set_pending_buffer(slot);
    helper.set_damage(damage.clone());
    helper.set_scale(helper.scale());
    helper.set_transform(viewport.transform);
    helper.commit()?;
    Ok(damage)
}
