//! In-memory backend
//!
//! `HeadlessOutput` validates and records commits instead of scanning out.
//! A cloned [`HeadlessHandle`] lets the owner inspect what was presented and
//! simulate vblank, hotplug and driver failures.

use std::cell::{Ref, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

use super::{
    AllocError, Allocator, Buffer, BufferId, CommitError, Format, FormatSet, Fourcc, Mode,
    Modifier, OutputBackend, OutputState, PlaneKind,
};
use crate::compositor::layer::LayerId;
use crate::shared::{Point, Region, Size, Transform};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

const DEFAULT_REFRESH: u32 = 60_000;

#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    pub name: String,
    pub mode: Mode,
    pub scale: f64,
    pub transform: Transform,
    pub primary_formats: FormatSet,
    pub cursor_formats: FormatSet,
    pub overlay_formats: FormatSet,
    pub cursor_plane: bool,
    pub overlay_planes: usize,
    /// Fail any buffer that uses an explicit modifier, like drivers that
    /// advertise modifiers they cannot scan out
    pub reject_modifiers: bool,
}

impl HeadlessConfig {
    pub fn new(name: impl Into<String>, size: Size) -> Self {
        let codes = [Fourcc::Xrgb8888, Fourcc::Argb8888];
        Self {
            name: name.into(),
            mode: Mode::new(size, DEFAULT_REFRESH),
            scale: 1.0,
            transform: Transform::Normal,
            primary_formats: FormatSet::with_modifiers(
                &codes,
                &[Modifier::LINEAR, Modifier::X_TILED],
            ),
            cursor_formats: FormatSet::with_modifiers(&[Fourcc::Argb8888], &[Modifier::LINEAR]),
            overlay_formats: FormatSet::with_modifiers(&codes, &[Modifier::LINEAR]),
            cursor_plane: true,
            overlay_planes: 1,
            reject_modifiers: false,
        }
    }
}

/// A presented layer plane
#[derive(Debug, Clone, PartialEq)]
pub struct PlaneRecord {
    pub layer: LayerId,
    pub kind: PlaneKind,
    pub buffer: BufferId,
    pub position: Point,
}

/// One accepted commit
#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub sequence: u64,
    pub buffer: Option<BufferId>,
    pub format: Option<Format>,
    pub damage: Option<Region>,
    /// Output scale sent with this commit
    pub scale: Option<f64>,
    /// Planes after this commit
    pub planes: Vec<PlaneRecord>,
    /// FNV-1a of the primary buffer bytes
    pub checksum: Option<u64>,
}

#[derive(Debug)]
struct HeadlessState {
    config: HeadlessConfig,
    enabled: bool,
    commits: Vec<CommitRecord>,
    planes: Vec<PlaneRecord>,
    tests: usize,
    flip_pending: bool,
    fail_commits: u32,
    sequence: u64,
}

impl HeadlessState {
    fn formats(&self, plane: PlaneKind) -> &FormatSet {
        match plane {
            PlaneKind::Primary => &self.config.primary_formats,
            PlaneKind::Cursor => &self.config.cursor_formats,
            PlaneKind::Overlay => &self.config.overlay_formats,
        }
    }

    fn check_format(&self, format: Format, plane: PlaneKind) -> Result<(), CommitError> {
        let formats = self.formats(plane);
        let accepted = if format.modifier.is_implicit() {
            formats.is_empty() || formats.supports(format.code)
        } else {
            !self.config.reject_modifiers && (formats.is_empty() || formats.contains(&format))
        };
        if accepted {
            Ok(())
        } else {
            Err(CommitError::UnsupportedFormat { format, plane })
        }
    }

    fn check(&self, state: &OutputState<'_>) -> Result<(), CommitError> {
        if !self.enabled {
            return Err(CommitError::Disabled);
        }
        if let Some(buffer) = state.buffer {
            if buffer.size() != self.config.mode.size {
                return Err(CommitError::SizeMismatch {
                    buffer: buffer.size(),
                    mode: self.config.mode.size,
                });
            }
            self.check_format(buffer.format(), PlaneKind::Primary)?;
        }

        let Some(planes) = state.planes else {
            return Ok(());
        };
        let mut cursors = 0;
        let mut overlays = 0;
        for plane in planes {
            let available = match plane.kind {
                PlaneKind::Primary => 0,
                PlaneKind::Cursor => {
                    cursors += 1;
                    if self.config.cursor_plane { 1 } else { 0 }
                }
                PlaneKind::Overlay => {
                    overlays += 1;
                    self.config.overlay_planes
                }
            };
            let used = if plane.kind == PlaneKind::Cursor { cursors } else { overlays };
            if plane.kind == PlaneKind::Primary || used > available {
                return Err(CommitError::NoPlane(plane.kind));
            }
            self.check_format(plane.buffer.format(), plane.kind)?;
        }
        Ok(())
    }
}

/// Shared view of a [`HeadlessOutput`]
#[derive(Debug, Clone)]
pub struct HeadlessHandle(Rc<RefCell<HeadlessState>>);

impl HeadlessHandle {
    pub fn commit_count(&self) -> usize {
        self.0.borrow().commits.len()
    }

    pub fn commits(&self) -> Ref<'_, [CommitRecord]> {
        Ref::map(self.0.borrow(), |state| state.commits.as_slice())
    }

    pub fn last_commit(&self) -> Option<CommitRecord> {
        self.0.borrow().commits.last().cloned()
    }

    /// Planes currently on screen
    pub fn planes(&self) -> Vec<PlaneRecord> {
        self.0.borrow().planes.clone()
    }

    /// Scale the display currently runs at
    pub fn scale(&self) -> f64 {
        self.0.borrow().config.scale
    }

    pub fn test_count(&self) -> usize {
        self.0.borrow().tests
    }

    /// Consume a pending page flip, as a vblank would
    pub fn take_page_flip(&self) -> bool {
        std::mem::take(&mut self.0.borrow_mut().flip_pending)
    }

    /// Make the next `count` commits fail after passing validation
    pub fn fail_next_commits(&self, count: u32) {
        self.0.borrow_mut().fail_commits = count;
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.0.borrow_mut().enabled = enabled;
    }

    pub fn set_mode(&self, mode: Mode) {
        self.0.borrow_mut().config.mode = mode;
    }
}

pub struct HeadlessOutput {
    name: String,
    state: Rc<RefCell<HeadlessState>>,
}

impl HeadlessOutput {
    pub fn new(config: HeadlessConfig) -> (Self, HeadlessHandle) {
        let name = config.name.clone();
        let state = Rc::new(RefCell::new(HeadlessState {
            config,
            enabled: true,
            commits: Vec::new(),
            planes: Vec::new(),
            tests: 0,
            flip_pending: false,
            fail_commits: 0,
            sequence: 0,
        }));
        let handle = HeadlessHandle(state.clone());
        (Self { name, state }, handle)
    }
}

impl OutputBackend for HeadlessOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> Mode {
        self.state.borrow().config.mode
    }

    fn scale(&self) -> f64 {
        self.state.borrow().config.scale
    }

    fn transform(&self) -> Transform {
        self.state.borrow().config.transform
    }

    fn is_enabled(&self) -> bool {
        self.state.borrow().enabled
    }

    fn plane_formats(&self, plane: PlaneKind) -> FormatSet {
        let state = self.state.borrow();
        let available = match plane {
            PlaneKind::Primary => true,
            PlaneKind::Cursor => state.config.cursor_plane,
            PlaneKind::Overlay => state.config.overlay_planes > 0,
        };
        if available {
            state.formats(plane).clone()
        } else {
            FormatSet::new()
        }
    }

    fn test_commit(&self, state: &OutputState<'_>) -> Result<(), CommitError> {
        let mut inner = self.state.borrow_mut();
        inner.tests += 1;
        let result = inner.check(state);
        if let Err(err) = &result {
            trace!("{}: test commit failed: {}", self.name, err);
        }
        result
    }

    fn commit(&mut self, state: &OutputState<'_>) -> Result<(), CommitError> {
        let mut inner = self.state.borrow_mut();
        inner.check(state)?;
        if inner.fail_commits > 0 {
            inner.fail_commits -= 1;
            return Err(CommitError::Backend("simulated commit failure".into()));
        }

        if let Some(planes) = state.planes {
            inner.planes = planes
                .iter()
                .map(|plane| PlaneRecord {
                    layer: plane.layer,
                    kind: plane.kind,
                    buffer: plane.buffer.id(),
                    position: plane.position,
                })
                .collect();
        }
        if let Some(scale) = state.scale {
            inner.config.scale = scale;
        }
        if let Some(transform) = state.transform {
            inner.config.transform = transform;
        }

        inner.sequence += 1;
        let record = CommitRecord {
            sequence: inner.sequence,
            buffer: state.buffer.map(Buffer::id),
            format: state.buffer.map(Buffer::format),
            damage: state.damage.cloned(),
            scale: state.scale,
            planes: inner.planes.clone(),
            checksum: state.buffer.map(|buffer| checksum(buffer.as_bytes())),
        };
        if record.buffer.is_some() {
            inner.flip_pending = true;
        }
        debug!(
            "{}: commit #{} buffer={:?} damage={:?}",
            self.name,
            record.sequence,
            record.buffer,
            record.damage.as_ref().map(Region::area)
        );
        inner.commits.push(record);
        Ok(())
    }
}

fn checksum(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ *byte as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

/// CPU buffer allocator
#[derive(Debug)]
pub struct MemoryAllocator {
    max_size: Size,
    /// `None` allocates any modifier
    supported: Option<Vec<Modifier>>,
}

impl MemoryAllocator {
    pub fn new() -> Self {
        Self {
            max_size: Size::new(16384, 16384),
            supported: None,
        }
    }

    /// Only allocate the given layouts
    pub fn with_modifiers(modifiers: Vec<Modifier>) -> Self {
        Self {
            supported: Some(modifiers),
            ..Self::new()
        }
    }
}

impl Default for MemoryAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for MemoryAllocator {
    fn create_buffer(
        &self,
        size: Size,
        code: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Buffer, AllocError> {
        if size.is_empty() || size.width > self.max_size.width || size.height > self.max_size.height
        {
            return Err(AllocError::InvalidSize(size));
        }

        let modifier = if modifiers.is_empty() {
            Modifier::INVALID
        } else {
            *modifiers
                .iter()
                .find(|modifier| {
                    self.supported
                        .as_ref()
                        .is_none_or(|supported| supported.contains(modifier))
                })
                .ok_or_else(|| AllocError::UnsupportedModifiers(modifiers.to_vec()))?
        };

        let id = BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed));
        Ok(Buffer::new(id, size, Format::new(code, modifier)))
    }
}
