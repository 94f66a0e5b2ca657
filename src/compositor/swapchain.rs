//! Swapchain: a small rotating pool of buffers for one output
//!
//! Buffers are handed out as [`Slot`] guards. While a guard is alive the buffer
//! cannot be acquired again; dropping the guard returns it to the pool. The
//! output helper keeps the guard of the buffer on screen, so a scanned-out
//! buffer is never rendered into.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;
use tracing::{debug, trace};

use crate::backend::{AllocError, Allocator, Buffer, BufferId, Format, FormatSet, Fourcc, Modifier};
use crate::error::OutputError;
use crate::shared::Size;

/// Smallest usable pool: one buffer on screen, one being rendered
pub const MIN_SLOTS: usize = 2;

struct InternalSlot {
    buffer: RefCell<Buffer>,
    acquired: Cell<bool>,
    /// 0 = never presented, N = presented N submits ago
    age: Cell<u32>,
}

/// Exclusive handle to one swapchain buffer
pub struct Slot(Rc<InternalSlot>);

impl Slot {
    pub fn id(&self) -> BufferId {
        self.0.buffer.borrow().id()
    }

    pub fn age(&self) -> u32 {
        self.0.age.get()
    }

    pub fn size(&self) -> Size {
        self.0.buffer.borrow().size()
    }

    pub fn format(&self) -> Format {
        self.0.buffer.borrow().format()
    }

    pub fn buffer(&self) -> Ref<'_, Buffer> {
        self.0.buffer.borrow()
    }

    pub fn buffer_mut(&self) -> RefMut<'_, Buffer> {
        self.0.buffer.borrow_mut()
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.acquired.set(false);
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("buffer", &*self.0.buffer.borrow())
            .field("age", &self.0.age.get())
            .finish()
    }
}

pub struct Swapchain {
    allocator: Rc<dyn Allocator>,
    size: Size,
    code: Fourcc,
    modifiers: Vec<Modifier>,
    slots: Vec<Rc<InternalSlot>>,
    max_slots: usize,
}

impl Swapchain {
    pub fn new(
        allocator: Rc<dyn Allocator>,
        size: Size,
        code: Fourcc,
        modifiers: Vec<Modifier>,
        max_slots: usize,
    ) -> Self {
        Self {
            allocator,
            size,
            code,
            modifiers,
            slots: Vec::new(),
            max_slots: max_slots.max(MIN_SLOTS),
        }
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn code(&self) -> Fourcc {
        self.code
    }

    pub fn modifiers(&self) -> &[Modifier] {
        &self.modifiers
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    /// Number of allocated buffers
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Buffers currently checked out
    pub fn acquired(&self) -> usize {
        self.slots.iter().filter(|slot| slot.acquired.get()).count()
    }

    pub fn matches(&self, size: Size, code: Fourcc) -> bool {
        self.size == size && self.code == code
    }

    /// Hand out a free buffer, allocating lazily up to the pool limit.
    /// `Ok(None)` means every buffer is in use.
    pub fn acquire(&mut self) -> Result<Option<Slot>, AllocError> {
        if let Some(free) = self.slots.iter().find(|slot| !slot.acquired.get()) {
            free.acquired.set(true);
            trace!("Reusing {} (age {})", free.buffer.borrow().id(), free.age.get());
            return Ok(Some(Slot(free.clone())));
        }

        if self.slots.len() >= self.max_slots {
            debug!("Swapchain exhausted ({} buffers in use)", self.slots.len());
            return Ok(None);
        }

        let buffer = self.allocator.create_buffer(self.size, self.code, &self.modifiers)?;
        debug!("Allocated {} as {} ({})", buffer.id(), buffer.format(), self.size);
        let slot = Rc::new(InternalSlot {
            buffer: RefCell::new(buffer),
            acquired: Cell::new(true),
            age: Cell::new(0),
        });
        self.slots.push(slot.clone());
        Ok(Some(Slot(slot)))
    }

    /// Record that `slot` was presented; ages every other presented buffer.
    /// Slots of another pool are ignored.
    pub fn submitted(&self, slot: &Slot) {
        if !self.slots.iter().any(|candidate| Rc::ptr_eq(candidate, &slot.0)) {
            return;
        }
        for candidate in &self.slots {
            if Rc::ptr_eq(candidate, &slot.0) {
                candidate.age.set(1);
            } else if candidate.age.get() > 0 {
                candidate.age.set(candidate.age.get() + 1);
            }
        }
    }

    /// Forget every buffer; outstanding slots stay valid until dropped
    pub fn reset_buffers(&mut self) {
        self.slots.clear();
    }
}

impl fmt::Debug for Swapchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Swapchain")
            .field("size", &self.size)
            .field("code", &self.code)
            .field("modifiers", &self.modifiers)
            .field("slots", &self.slots.len())
            .finish()
    }
}

/// Pick the modifiers to allocate `code` with.
///
/// `display` is what the plane accepts, `renderer` what the renderer can draw
/// into. A display without any advertised formats places no constraint.
pub fn negotiate_modifiers(
    display: &FormatSet,
    renderer: &FormatSet,
    code: Fourcc,
) -> Result<Vec<Modifier>, OutputError> {
    let renderer_modifiers = renderer.modifiers_for(code);
    if renderer_modifiers.is_empty() {
        return Err(OutputError::FormatNegotiationFailed { code });
    }
    if display.is_empty() {
        return Ok(renderer_modifiers);
    }

    let display_modifiers = display.modifiers_for(code);
    if display_modifiers.is_empty() {
        return Err(OutputError::FormatNegotiationFailed { code });
    }

    // One side only knows the implicit modifier, the other offers linear:
    // implicit is the only layout both can agree on.
    let implicit_only = |mods: &[Modifier]| mods.len() == 1 && mods[0].is_implicit();
    let explicit_with_linear = |mods: &[Modifier]| {
        mods.iter().all(|m| !m.is_implicit()) && mods.contains(&Modifier::LINEAR)
    };
    if (implicit_only(&display_modifiers) && explicit_with_linear(&renderer_modifiers))
        || (implicit_only(&renderer_modifiers) && explicit_with_linear(&display_modifiers))
    {
        return Ok(vec![Modifier::INVALID]);
    }

    let common: Vec<Modifier> = renderer_modifiers
        .into_iter()
        .filter(|modifier| display_modifiers.contains(modifier))
        .collect();
    if common.is_empty() {
        return Err(OutputError::FormatNegotiationFailed { code });
    }
    Ok(common)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::MemoryAllocator;

    fn swapchain(max_slots: usize) -> Swapchain {
        Swapchain::new(
            Rc::new(MemoryAllocator::new()),
            Size::new(16, 16),
            Fourcc::Xrgb8888,
            vec![Modifier::LINEAR],
            max_slots,
        )
    }

    #[test]
    fn test_slot_returns_to_pool_on_drop() {
        let mut chain = swapchain(2);
        let a = chain.acquire().unwrap().unwrap();
        let b = chain.acquire().unwrap().unwrap();
        assert!(chain.acquire().unwrap().is_none());
        assert_eq!(chain.acquired(), 2);

        let a_id = a.id();
        drop(a);
        let again = chain.acquire().unwrap().unwrap();
        assert_eq!(again.id(), a_id);
        assert_ne!(again.id(), b.id());
    }

    #[test]
    fn test_ages_follow_submissions() {
        let mut chain = swapchain(3);
        let first = chain.acquire().unwrap().unwrap();
        assert_eq!(first.age(), 0);
        chain.submitted(&first);
        assert_eq!(first.age(), 1);

        let second = chain.acquire().unwrap().unwrap();
        chain.submitted(&second);
        assert_eq!(second.age(), 1);
        assert_eq!(first.age(), 2);

        // A buffer that was never presented stays unknown
        let third = chain.acquire().unwrap().unwrap();
        chain.submitted(&second);
        assert_eq!(third.age(), 0);
        assert_eq!(first.age(), 3);
    }

    #[test]
    fn test_foreign_slot_is_ignored() {
        let mut old = swapchain(2);
        let mut new = swapchain(2);
        let stale = old.acquire().unwrap().unwrap();
        let fresh = new.acquire().unwrap().unwrap();
        new.submitted(&stale);
        assert_eq!(fresh.age(), 0);
        assert_eq!(stale.age(), 0);
    }

    #[test]
    fn test_reset_keeps_outstanding_slot_alive() {
        let mut chain = swapchain(2);
        let slot = chain.acquire().unwrap().unwrap();
        chain.reset_buffers();
        assert!(chain.is_empty());
        assert_eq!(slot.size(), Size::new(16, 16));
    }

    #[test]
    fn test_negotiate_intersects() {
        let display = FormatSet::with_modifiers(&[Fourcc::Xrgb8888], &[Modifier::LINEAR, Modifier::X_TILED]);
        let renderer = FormatSet::with_modifiers(
            &[Fourcc::Xrgb8888],
            &[Modifier::X_TILED, Modifier::INVALID],
        );
        let mods = negotiate_modifiers(&display, &renderer, Fourcc::Xrgb8888).unwrap();
        assert_eq!(mods, vec![Modifier::X_TILED]);
    }

    #[test]
    fn test_negotiate_unconstrained_display() {
        let renderer = FormatSet::with_modifiers(&[Fourcc::Argb8888], &[Modifier::LINEAR, Modifier::INVALID]);
        let mods = negotiate_modifiers(&FormatSet::new(), &renderer, Fourcc::Argb8888).unwrap();
        assert_eq!(mods.len(), 2);
    }

    #[test]
    fn test_negotiate_implicit_linear_special_case() {
        let display = FormatSet::with_modifiers(&[Fourcc::Xrgb8888], &[Modifier::INVALID]);
        let renderer = FormatSet::with_modifiers(&[Fourcc::Xrgb8888], &[Modifier::LINEAR]);
        let mods = negotiate_modifiers(&display, &renderer, Fourcc::Xrgb8888).unwrap();
        assert_eq!(mods, vec![Modifier::INVALID]);
    }

    #[test]
    fn test_negotiate_fails_without_common_format() {
        let display = FormatSet::with_modifiers(&[Fourcc::Argb8888], &[Modifier::LINEAR]);
        let renderer = FormatSet::with_modifiers(&[Fourcc::Xrgb8888], &[Modifier::LINEAR]);
        assert!(matches!(
            negotiate_modifiers(&display, &renderer, Fourcc::Xrgb8888),
            Err(OutputError::FormatNegotiationFailed { code: Fourcc::Xrgb8888 })
        ));
    }
}
