//! Per-output state machine
//!
//! An [`OutputHelper`] owns everything one display needs between frames: the
//! swapchain, the damage history, the state waiting to be committed and the
//! buffer currently on screen. The scheduler drives it; backends feed it
//! [`OutputEvent`]s.

use bitflags::bitflags;
use std::cell::Ref;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, trace, warn};

use super::damage::{DamageRing, DEFAULT_RING_CAPACITY};
use super::fps::{FpsCounter, FrameStats};
use super::layer::{Layer, LayerId};
use super::swapchain::{negotiate_modifiers, Slot, Swapchain};
use crate::backend::{
    Allocator, Buffer, FormatSet, Fourcc, Mode, Modifier, OutputBackend, OutputState, PlaneKind,
    PlaneState,
};
use crate::config::Config;
use crate::error::OutputError;
use crate::render::{RenderPath, Viewport};
use crate::shared::{Point, Rect, Region, Size, Transform};

static NEXT_OUTPUT_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputId(u32);

impl OutputId {
    pub fn next() -> Self {
        OutputId(NEXT_OUTPUT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "output#{}", self.0)
    }
}

bitflags! {
    /// Scheduling state of an output
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OutputFlags: u8 {
        /// The display granted a frame; cleared by the next successful commit
        const RENDERABLE    = 1 << 0;
        /// Content changed since the last commit
        const CONTENT_DIRTY = 1 << 1;
        /// The display wants a commit even without new content
        const NEEDS_FRAME   = 1 << 2;
    }
}

impl Default for OutputFlags {
    fn default() -> Self {
        Self::RENDERABLE | Self::CONTENT_DIRTY
    }
}

/// Notifications from the backend
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    /// Page flip completed / vblank
    Frame,
    NeedsFrame,
    /// Content damage in buffer coordinates; `None` means everything
    Damage(Option<Region>),
    ModeChanged {
        mode: Mode,
        scale: f64,
        transform: Transform,
    },
    Enabled(bool),
}

/// What the helper asks of its scheduler after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperRequest {
    ScheduleRender,
}

#[derive(Debug, Clone)]
pub struct OutputOptions {
    pub swapchain_slots: usize,
    pub use_modifiers: bool,
    /// Validate each new swapchain with a test commit
    pub test_buffers: bool,
    pub ring_capacity: usize,
    pub max_commit_failures: u32,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            swapchain_slots: 3,
            use_modifiers: true,
            test_buffers: true,
            ring_capacity: DEFAULT_RING_CAPACITY,
            max_commit_failures: 3,
        }
    }
}

impl From<&Config> for OutputOptions {
    fn from(config: &Config) -> Self {
        Self {
            swapchain_slots: config.swapchain.slots,
            use_modifiers: config.swapchain.use_modifiers,
            test_buffers: config.swapchain.test_buffers,
            ring_capacity: config.damage.ring_capacity,
            max_commit_failures: config.scheduler.max_commit_failures,
        }
    }
}

/// State assembled for the next commit
#[derive(Debug, Default)]
pub struct PendingState {
    pub buffer: Option<Slot>,
    pub damage: Option<Region>,
    pub scale: Option<f64>,
    pub transform: Option<Transform>,
    /// Layers to place on planes; `None` keeps the current planes
    pub layers: Option<Vec<Layer>>,
}

impl PendingState {
    pub fn is_empty(&self) -> bool {
        self.buffer.is_none()
            && self.damage.is_none()
            && self.scale.is_none()
            && self.transform.is_none()
            && self.layers.is_none()
    }
}

/// A layer ready to be placed on a plane
struct PlaneInput {
    layer: LayerId,
    kind: PlaneKind,
    position: Point,
    slot: Rc<Slot>,
}

fn plane_inputs(viewport: &Viewport, layers: &[Layer]) -> Vec<PlaneInput> {
    layers
        .iter()
        .filter(|layer| viewport.map_rect(&layer.rect()).is_some())
        .filter_map(|layer| {
            Some(PlaneInput {
                layer: layer.id(),
                kind: layer.kind(),
                position: viewport.map_point(layer.position()),
                slot: layer.buffer()?,
            })
        })
        .collect()
}

/// Borrow everything a backend state refers to and hand it to `f`
fn with_output_state<T>(
    viewport: &Viewport,
    buffer: Option<&Slot>,
    damage: Option<&Region>,
    scale: Option<f64>,
    transform: Option<Transform>,
    layers: Option<&[Layer]>,
    f: impl FnOnce(&OutputState<'_>) -> T,
) -> T {
    let buffer: Option<Ref<'_, Buffer>> = buffer.map(Slot::buffer);
    let inputs = layers.map(|layers| plane_inputs(viewport, layers));
    let guards: Vec<Ref<'_, Buffer>> = inputs
        .iter()
        .flatten()
        .map(|input| input.slot.buffer())
        .collect();
    let planes: Option<Vec<PlaneState<'_>>> = inputs.as_ref().map(|inputs| {
        inputs
            .iter()
            .zip(&guards)
            .map(|(input, guard)| PlaneState {
                layer: input.layer,
                kind: input.kind,
                buffer: &**guard,
                position: input.position,
            })
            .collect()
    });
    let state = OutputState {
        buffer: buffer.as_deref(),
        damage,
        scale,
        transform,
        planes: planes.as_deref(),
    };
    f(&state)
}

pub struct OutputHelper {
    id: OutputId,
    name: String,
    output: Box<dyn OutputBackend>,
    allocator: Rc<dyn Allocator>,
    options: OutputOptions,
    viewport: Viewport,
    /// Scale of the display itself; mirrors keep it while their viewport is fitted
    scale: f64,
    flags: OutputFlags,
    swapchain: Option<Swapchain>,
    /// Skip explicit modifiers on the next negotiation
    force_implicit: bool,
    damage: DamageRing,
    pending: PendingState,
    /// Buffer on screen; held so it is neither reused nor lost for backfill
    front: Option<Slot>,
    /// Layer buffers on screen
    front_layers: Vec<Rc<Slot>>,
    /// Buffer rects of layers composited in software last frame
    fallback_rects: Vec<Rect>,
    commit_failures: u32,
    stats: FrameStats,
    fps: FpsCounter,
}

impl OutputHelper {
    pub fn new(
        output: Box<dyn OutputBackend>,
        allocator: Rc<dyn Allocator>,
        options: OutputOptions,
    ) -> Self {
        let mode = output.mode();
        let name = output.name().to_string();
        let viewport = Viewport::new(mode.size, output.scale(), output.transform());
        let scale = viewport.scale;
        info!("Output {} attached: {} @ {} mHz", name, mode.size, mode.refresh);
        Self {
            id: OutputId::next(),
            damage: DamageRing::new(mode.size, options.ring_capacity),
            stats: FrameStats {
                output: name.clone(),
                ..Default::default()
            },
            name,
            output,
            allocator,
            options,
            viewport,
            scale,
            flags: OutputFlags::default(),
            swapchain: None,
            force_implicit: false,
            pending: PendingState::default(),
            front: None,
            front_layers: Vec::new(),
            fallback_rects: Vec::new(),
            commit_failures: 0,
            fps: FpsCounter::new(),
        }
    }

    pub fn id(&self) -> OutputId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> OutputFlags {
        self.flags
    }

    pub fn is_renderable(&self) -> bool {
        self.flags.contains(OutputFlags::RENDERABLE)
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(OutputFlags::CONTENT_DIRTY)
    }

    pub fn needs_frame(&self) -> bool {
        self.flags.contains(OutputFlags::NEEDS_FRAME)
    }

    pub fn is_visible(&self) -> bool {
        self.viewport.visible && self.output.is_enabled()
    }

    pub fn mode(&self) -> Mode {
        self.output.mode()
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    /// Move the output over the scene. The buffer size always follows the mode.
    pub fn set_viewport(&mut self, viewport: Viewport) {
        let viewport = Viewport {
            size: self.viewport.size,
            ..viewport
        };
        if viewport != self.viewport {
            debug!("{}: viewport now {:?}", self.name, viewport.scene_rect());
            self.viewport = viewport;
            self.damage.add_whole();
            self.mark_dirty();
        }
    }

    pub fn damage(&self) -> &DamageRing {
        &self.damage
    }

    pub fn pending(&self) -> &PendingState {
        &self.pending
    }

    pub fn swapchain(&self) -> Option<&Swapchain> {
        self.swapchain.as_ref()
    }

    pub fn front_buffer(&self) -> Option<&Slot> {
        self.front.as_ref()
    }

    pub fn commit_failures(&self) -> u32 {
        self.commit_failures
    }

    pub fn stats(&self) -> FrameStats {
        self.stats.with_timing(&self.fps)
    }

    pub fn set_pending_buffer(&mut self, slot: Slot) {
        self.pending.buffer = Some(slot);
    }

    pub fn set_scale(&mut self, scale: f64) {
        self.pending.scale = Some(scale);
    }

    pub fn set_transform(&mut self, transform: Transform) {
        self.pending.transform = Some(transform);
    }

    pub fn set_damage(&mut self, damage: Region) {
        self.pending.damage = Some(damage);
    }

    pub fn set_layers(&mut self, layers: Vec<Layer>) {
        self.pending.layers = Some(layers);
    }

    pub fn mark_dirty(&mut self) {
        self.flags.insert(OutputFlags::CONTENT_DIRTY);
    }

    /// Record content damage (buffer coordinates)
    pub fn add_damage(&mut self, region: &Region) {
        self.damage.add(region);
        self.mark_dirty();
    }

    pub fn record_skip(&mut self) {
        self.stats.skipped += 1;
    }

    /// Check the pending state against the backend
    pub fn test_commit(&self) -> bool {
        let pending = &self.pending;
        let result = with_output_state(
            &self.viewport,
            pending.buffer.as_ref(),
            pending.damage.as_ref(),
            pending.scale,
            pending.transform,
            pending.layers.as_deref(),
            |state| self.output.test_commit(state),
        );
        result.is_ok()
    }

    /// Check a buffer and a set of layers without touching the pending state
    pub fn test_commit_with(&self, buffer: Option<&Slot>, layers: &[Layer]) -> bool {
        with_output_state(&self.viewport, buffer, None, None, None, Some(layers), |state| {
            self.output.test_commit(state)
        })
        .is_ok()
    }

    /// Present the pending state.
    ///
    /// On success the pending state is consumed, the submitted buffer becomes
    /// the front buffer and the damage ring advances. On failure nothing
    /// changes except the failure count.
    pub fn commit(&mut self) -> Result<(), OutputError> {
        let output = &mut self.output;
        let pending = &self.pending;
        let result = with_output_state(
            &self.viewport,
            pending.buffer.as_ref(),
            pending.damage.as_ref(),
            pending.scale,
            pending.transform,
            pending.layers.as_deref(),
            |state| output.commit(state),
        );

        if let Err(err) = result {
            self.commit_failures += 1;
            self.stats.commit_failures += 1;
            if self.commit_failures >= self.options.max_commit_failures {
                warn!(
                    "{}: {} consecutive commit failures ({}), renegotiating without modifiers",
                    self.name, self.commit_failures, err
                );
                if self.options.use_modifiers {
                    self.force_implicit = true;
                }
                self.swapchain = None;
            } else {
                debug!("{}: commit failed: {}", self.name, err);
            }
            return Err(err.into());
        }

        let pending = std::mem::take(&mut self.pending);
        self.commit_failures = 0;
        self.flags.remove(OutputFlags::NEEDS_FRAME);

        if let Some(layers) = pending.layers {
            self.front_layers = plane_inputs(&self.viewport, &layers)
                .into_iter()
                .map(|input| input.slot)
                .collect();
        }

        match pending.buffer {
            Some(slot) => {
                if let Some(swapchain) = &self.swapchain {
                    swapchain.submitted(&slot);
                }
                trace!("{}: presenting {}", self.name, slot.id());
                self.front = Some(slot);
                self.damage.rotate();
                self.stats.commits += 1;
                if let Some(fps) = self.fps.tick() {
                    trace!("{}: {:.1} fps", self.name, fps);
                }
            }
            None => self.stats.empty_commits += 1,
        }
        Ok(())
    }

    /// Clear the per-frame flags after a frame was handled
    pub fn reset_state(&mut self, reset_renderable: bool) {
        self.flags
            .remove(OutputFlags::CONTENT_DIRTY | OutputFlags::NEEDS_FRAME);
        if reset_renderable {
            self.flags.remove(OutputFlags::RENDERABLE);
        }
    }

    pub fn handle(&mut self, event: OutputEvent) -> Option<HelperRequest> {
        trace!("{}: {:?}", self.name, event);
        match event {
            OutputEvent::Frame => {
                self.flags.insert(OutputFlags::RENDERABLE);
            }
            OutputEvent::NeedsFrame => {
                self.flags.insert(OutputFlags::NEEDS_FRAME);
            }
            OutputEvent::Damage(Some(region)) => self.add_damage(&region),
            OutputEvent::Damage(None) => {
                self.damage.add_whole();
                self.mark_dirty();
            }
            OutputEvent::ModeChanged {
                mode,
                scale,
                transform,
            } => {
                info!("{}: mode changed to {} @ {} mHz", self.name, mode.size, mode.refresh);
                let mut viewport = Viewport::new(mode.size, scale, transform)
                    .with_origin(self.viewport.origin);
                viewport.visible = self.viewport.visible;
                self.viewport = viewport;
                self.scale = viewport.scale;
                self.damage.set_bounds(mode.size);
                self.damage.add_whole();
                self.swapchain = None;
                self.front = None;
                self.mark_dirty();
            }
            OutputEvent::Enabled(enabled) => {
                self.viewport.visible = enabled;
                if !enabled {
                    return None;
                }
                self.damage.add_whole();
                self.mark_dirty();
            }
        }
        Some(HelperRequest::ScheduleRender)
    }

    /// Get a buffer to render the next frame into, (re)negotiating the
    /// swapchain when the mode or format changed.
    ///
    /// A buffer left pending by a failed commit goes back to the pool first.
    /// The ring has not rotated since, so its area is still in the frame damage.
    pub fn acquire_render_target(
        &mut self,
        renderer_formats: &FormatSet,
        code: Fourcc,
    ) -> Result<Slot, OutputError> {
        if let Some(stale) = self.pending.buffer.take() {
            debug!("{}: releasing {} from a failed commit", self.name, stale.id());
        }
        let size = self.output.mode().size;
        let reusable = self
            .swapchain
            .as_ref()
            .is_some_and(|swapchain| swapchain.matches(size, code));
        if !reusable {
            let swapchain = self.negotiate_swapchain(renderer_formats, code, size)?;
            self.damage.set_bounds(size);
            self.swapchain = Some(swapchain);
        }

        let swapchain = self
            .swapchain
            .as_mut()
            .ok_or(OutputError::RenderTargetUnavailable)?;
        swapchain.acquire()?.ok_or(OutputError::RenderTargetUnavailable)
    }

    fn negotiate_swapchain(
        &self,
        renderer_formats: &FormatSet,
        code: Fourcc,
        size: Size,
    ) -> Result<Swapchain, OutputError> {
        let display = self.output.plane_formats(PlaneKind::Primary);

        if self.options.use_modifiers && !self.force_implicit {
            match negotiate_modifiers(&display, renderer_formats, code)
                .and_then(|modifiers| self.try_swapchain(size, code, modifiers))
            {
                Ok(swapchain) => return Ok(swapchain),
                Err(err) => warn!("{}: {}; retrying without modifiers", self.name, err),
            }
        }

        let displayable = display.is_empty() || display.supports(code);
        if !renderer_formats.supports(code) || !displayable {
            return Err(OutputError::FormatNegotiationFailed { code });
        }
        self.try_swapchain(size, code, vec![Modifier::INVALID])
            .map_err(|err| {
                warn!("{}: implicit modifier failed too: {}", self.name, err);
                OutputError::FormatNegotiationFailed { code }
            })
    }

    fn try_swapchain(
        &self,
        size: Size,
        code: Fourcc,
        modifiers: Vec<Modifier>,
    ) -> Result<Swapchain, OutputError> {
        let mut swapchain = Swapchain::new(
            self.allocator.clone(),
            size,
            code,
            modifiers,
            self.options.swapchain_slots,
        );
        if self.options.test_buffers {
            let slot = swapchain
                .acquire()?
                .ok_or(OutputError::RenderTargetUnavailable)?;
            let buffer = slot.buffer();
            let state = OutputState {
                buffer: Some(&buffer),
                ..Default::default()
            };
            self.output.test_commit(&state)?;
            debug!("{}: swapchain validated with {}", self.name, buffer.format());
        }
        Ok(swapchain)
    }

    /// Swapchain for layer content shown on a cursor or overlay plane
    pub fn create_plane_swapchain(
        &self,
        plane: PlaneKind,
        size: Size,
        code: Fourcc,
        renderer_formats: &FormatSet,
    ) -> Result<Swapchain, OutputError> {
        let display = self.output.plane_formats(plane);
        let mut attempts = Vec::new();
        if self.options.use_modifiers {
            if let Ok(modifiers) = negotiate_modifiers(&display, renderer_formats, code) {
                attempts.push(modifiers);
            }
        }
        if display.supports(code) && renderer_formats.supports(code) {
            attempts.push(vec![Modifier::INVALID]);
        }

        for modifiers in attempts {
            let mut swapchain = Swapchain::new(
                self.allocator.clone(),
                size,
                code,
                modifiers,
                self.options.swapchain_slots,
            );
            match swapchain.acquire() {
                Ok(Some(_)) => return Ok(swapchain),
                Ok(None) => {}
                Err(err) => debug!("{}: {} plane allocation failed: {}", self.name, plane, err),
            }
        }
        Err(OutputError::FormatNegotiationFailed { code })
    }

    /// Put as many layers on planes as the backend accepts.
    ///
    /// The accepted ones become the pending plane set; the rest are returned
    /// for software compositing.
    pub fn assign_layers(&mut self, layers: &[Layer]) -> Vec<Layer> {
        let mut accepted: Vec<Layer> = Vec::new();
        let mut fallback = Vec::new();
        for layer in layers {
            let mut candidate = accepted.clone();
            candidate.push(layer.clone());
            if self.test_commit_with(None, &candidate) {
                accepted = candidate;
            } else {
                let err = OutputError::LayerUnsupported { layer: layer.id() };
                debug!("{}: {}, compositing in software", self.name, err);
                fallback.push(layer.clone());
            }
        }
        self.stats.layer_fallbacks += fallback.len() as u64;
        self.set_layers(accepted);
        fallback
    }

    /// Damage the areas of software-composited layers, this frame's and last
    /// frame's, so both get repainted.
    pub fn damage_fallback_layers(&mut self, fallback: &[Layer]) {
        let bounds = self.viewport.buffer_rect();
        let rects: Vec<Rect> = fallback
            .iter()
            .filter_map(|layer| {
                let at = self.viewport.map_point(layer.position());
                let size = layer.size();
                Rect::new(at.x, at.y, size.width, size.height).intersection(&bounds)
            })
            .collect();
        let previous = std::mem::replace(&mut self.fallback_rects, rects);
        let damage = Region::from_rects(previous.into_iter().chain(self.fallback_rects.iter().copied()));
        if !damage.is_empty() {
            self.damage.add(&damage);
        }
    }

    /// Restore everything `target` is missing that this frame will not paint.
    ///
    /// Returns the area the renderer still has to draw. Without a front
    /// buffer to copy from that is the whole target.
    pub fn backfill(&self, target: &mut Buffer, age: u32) -> Region {
        let full = Region::from_rect(target.bounds());
        let Some(front) = &self.front else {
            return full;
        };
        let frame = self.damage.frame_damage().clone();
        let stale = self.damage.buffer_damage(age).subtract(&frame);
        let source = front.buffer();
        for rect in stale.rects() {
            if !target.copy_rect_from(&source, rect) {
                debug!("{}: front buffer unusable for backfill", self.name);
                return full;
            }
        }
        trace!(
            "{}: backfilled {} px from {}, repainting {} px",
            self.name,
            stale.area(),
            front.id(),
            frame.area()
        );
        frame
    }

    /// Area to repaint into a fresh target for the given path
    pub fn prepare_target(&self, target: &mut Buffer, age: u32, path: RenderPath) -> Region {
        match path {
            RenderPath::Accelerated => Region::from_rect(target.bounds()),
            RenderPath::Software => self.backfill(target, age),
        }
    }
}

impl fmt::Debug for OutputHelper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputHelper")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("viewport", &self.viewport)
            .field("swapchain", &self.swapchain)
            .finish()
    }
}
