//! # Slabs
//!
//! A [`Slab`] is one page cut into equal object slots. Free slots form a
//! singly linked list threaded through the slots themselves: the first word
//! of a free slot holds the address of the next free slot. Links are read and
//! written unaligned, so any object size of at least one word works.
//!
//! Slab headers are chained into the per-CPU cache lists through
//! [`SlabList`]. The header's [`SlabState`] names the one list it is on.

use crate::frame::PageFrame;
use crate::layout::SlabLayout;
use core::ptr::{self, NonNull};
use kernel_memory_addresses::{PhysicalAddress, align_up};
use kernel_sync::CpuId;

/// Bytes reserved for an onpage header.
#[allow(clippy::cast_possible_truncation)]
pub const SLAB_HEADER_BYTES: usize = align_up(size_of::<Slab>() as u64, 16) as usize;

#[cfg(target_pointer_width = "64")]
const _: () = assert!(SLAB_HEADER_BYTES == 64);

/// Which cache list a slab is linked into.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlabState {
    /// On no list: freshly formatted or about to be deleted.
    Free,
    /// On `partial`: at least one free slot.
    Partial,
    /// On `full`: no free slot.
    Full,
}

/// Slab header.
#[repr(C)]
#[derive(Debug)]
pub struct Slab {
    page: PhysicalAddress,
    slots: NonNull<u8>,
    free_head: Option<NonNull<u8>>,
    prev: Option<NonNull<Slab>>,
    next: Option<NonNull<Slab>>,
    obj_size: u32,
    capacity: u32,
    live: u32,
    owner: CpuId,
    state: SlabState,
    layout: SlabLayout,
}

impl Slab {
    /// Writes a header for `frame` at `header` and threads every slot onto
    /// the free list, lowest address first.
    ///
    /// # Safety
    /// `frame` must be exclusively owned by the caller. `header` must be valid
    /// for writing a `Slab` and, for [`SlabLayout::OnPage`], be the first
    /// [`SLAB_HEADER_BYTES`] of `frame`. `capacity` slots of `obj_size` bytes
    /// must fit behind the metadata.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) unsafe fn format(
        header: NonNull<Self>,
        frame: &PageFrame,
        obj_size: usize,
        capacity: usize,
        layout: SlabLayout,
        owner: CpuId,
    ) -> NonNull<Self> {
        debug_assert!(layout.metadata_bytes() + capacity * obj_size <= frame.len());
        unsafe {
            let slots = frame.as_non_null().add(layout.metadata_bytes());
            let mut next: *mut u8 = ptr::null_mut();
            for i in (0..capacity).rev() {
                let slot = slots.add(i * obj_size);
                write_link(slot, next);
                next = slot.as_ptr();
            }
            header.write(Self {
                page: frame.phys(),
                slots,
                free_head: NonNull::new(next),
                prev: None,
                next: None,
                obj_size: obj_size as u32,
                capacity: capacity as u32,
                live: 0,
                owner,
                state: SlabState::Free,
                layout,
            });
        }
        header
    }

    #[inline]
    #[must_use]
    pub const fn page(&self) -> PhysicalAddress {
        self.page
    }

    #[inline]
    #[must_use]
    pub const fn layout(&self) -> SlabLayout {
        self.layout
    }

    #[inline]
    #[must_use]
    pub const fn state(&self) -> SlabState {
        self.state
    }

    /// The CPU whose cache created the slab.
    #[inline]
    #[must_use]
    pub const fn owner(&self) -> CpuId {
        self.owner
    }

    /// Slots handed out (including those parked in a pending list).
    #[inline]
    #[must_use]
    pub const fn live(&self) -> usize {
        self.live as usize
    }

    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity as usize
    }

    #[inline]
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.live == self.capacity
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Whether `obj` points into this slab's slot area.
    #[must_use]
    pub fn contains(&self, obj: NonNull<u8>) -> bool {
        let start = self.slots.as_ptr() as usize;
        let end = start + self.capacity() * self.obj_size as usize;
        (start..end).contains(&(obj.as_ptr() as usize))
    }

    /// Pops the lowest free slot.
    pub(crate) fn take(&mut self) -> Option<NonNull<u8>> {
        let obj = self.free_head?;
        // SAFETY: free slots always hold a link written by `format` or `put`.
        self.free_head = NonNull::new(unsafe { read_link(obj) });
        self.live += 1;
        Some(obj)
    }

    /// Returns `obj` to the free list.
    ///
    /// # Safety
    /// `obj` must be a slot of this slab that is currently handed out.
    pub(crate) unsafe fn put(&mut self, obj: NonNull<u8>) {
        debug_assert!(self.contains(obj));
        debug_assert_eq!(
            (obj.as_ptr() as usize - self.slots.as_ptr() as usize) % self.obj_size as usize,
            0,
            "pointer into the middle of a slot"
        );
        let head = self.free_head.map_or(ptr::null_mut(), NonNull::as_ptr);
        unsafe { write_link(obj, head) };
        self.free_head = Some(obj);
        self.live -= 1;
    }
}

/// # Safety
/// `slot` must be valid for reading one pointer, unaligned.
#[inline]
pub(crate) unsafe fn read_link(slot: NonNull<u8>) -> *mut u8 {
    unsafe { slot.cast::<*mut u8>().read_unaligned() }
}

/// # Safety
/// `slot` must be valid for writing one pointer, unaligned.
#[inline]
pub(crate) unsafe fn write_link(slot: NonNull<u8>, next: *mut u8) {
    unsafe { slot.cast::<*mut u8>().write_unaligned(next) }
}

/// Intrusive doubly linked list of slab headers.
#[derive(Debug, Default)]
pub(crate) struct SlabList {
    head: Option<NonNull<Slab>>,
    len: usize,
}

impl SlabList {
    pub(crate) const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    #[inline]
    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) const fn front(&self) -> Option<NonNull<Slab>> {
        self.head
    }

    /// # Safety
    /// `slab` must be a live header on no list.
    pub(crate) unsafe fn push_front(&mut self, mut slab: NonNull<Slab>) {
        unsafe {
            let s = slab.as_mut();
            s.prev = None;
            s.next = self.head;
            if let Some(mut old) = self.head {
                old.as_mut().prev = Some(slab);
            }
        }
        self.head = Some(slab);
        self.len += 1;
    }

    /// # Safety
    /// `slab` must be on this list.
    pub(crate) unsafe fn remove(&mut self, mut slab: NonNull<Slab>) {
        unsafe {
            let s = slab.as_mut();
            match s.prev {
                Some(mut prev) => prev.as_mut().next = s.next,
                None => self.head = s.next,
            }
            if let Some(mut next) = s.next {
                next.as_mut().prev = s.prev;
            }
            s.prev = None;
            s.next = None;
        }
        self.len -= 1;
    }

    /// Walks the list front to back.
    pub(crate) fn iter(&self) -> impl Iterator<Item = NonNull<Slab>> + '_ {
        // SAFETY: every linked header is live while the list is borrowed.
        core::iter::successors(self.head, |slab| unsafe { slab.as_ref().next })
    }
}

/// The two lists a cache keeps slabs on, with the state tag kept in sync.
#[derive(Debug, Default)]
pub(crate) struct SlabLists {
    pub(crate) partial: SlabList,
    pub(crate) full: SlabList,
}

impl SlabLists {
    pub(crate) const fn new() -> Self {
        Self {
            partial: SlabList::new(),
            full: SlabList::new(),
        }
    }

    /// Moves `slab` from the list its state names to the list for `to`.
    ///
    /// # Safety
    /// `slab` must be a live header owned by these lists (or on none, for
    /// state [`SlabState::Free`]).
    pub(crate) unsafe fn relink(&mut self, mut slab: NonNull<Slab>, to: SlabState) {
        unsafe {
            match slab.as_ref().state {
                SlabState::Free => {}
                SlabState::Partial => self.partial.remove(slab),
                SlabState::Full => self.full.remove(slab),
            }
            match to {
                SlabState::Free => {}
                SlabState::Partial => self.partial.push_front(slab),
                SlabState::Full => self.full.push_front(slab),
            }
            slab.as_mut().state = to;
        }
    }

    /// The slab whose slots contain `obj`, partial slabs first.
    pub(crate) fn owner_of(&self, obj: NonNull<u8>) -> Option<NonNull<Slab>> {
        self.partial
            .iter()
            .chain(self.full.iter())
            // SAFETY: linked headers are live.
            .find(|slab| unsafe { slab.as_ref() }.contains(obj))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::HhdmPhysMapper;

    #[repr(C, align(4096))]
    struct Aligned4K([u8; 4096]);

    fn frame(page: &mut Aligned4K) -> PageFrame {
        let phys = PhysicalAddress::new(0x20_0000);
        let offset = (page.0.as_mut_ptr() as u64).wrapping_sub(phys.as_u64());
        PageFrame::map(&HhdmPhysMapper::with_offset(offset), phys, 4096).unwrap()
    }

    #[test]
    fn onpage_slab_hands_out_slots_in_order() {
        let mut page = Aligned4K([0; 4096]);
        let frame = frame(&mut page);
        let header = frame.overlay::<Slab>(0, 1).unwrap();
        let capacity = SlabLayout::OnPage.objects_per_page(4096, 100);
        let mut slab =
            unsafe { Slab::format(header, &frame, 100, capacity, SlabLayout::OnPage, CpuId::BOOT) };
        let slab = unsafe { slab.as_mut() };

        let base = frame.as_non_null().as_ptr() as usize + SLAB_HEADER_BYTES;
        let objs: Vec<_> = (0..capacity).map(|_| slab.take().unwrap()).collect();
        for (i, obj) in objs.iter().enumerate() {
            assert_eq!(obj.as_ptr() as usize, base + i * 100);
            assert!(slab.contains(*obj));
        }
        assert!(slab.is_full());
        assert!(slab.take().is_none());

        unsafe { slab.put(objs[7]) };
        assert_eq!(slab.live(), capacity - 1);
        assert_eq!(slab.take(), Some(objs[7]));
    }

    #[test]
    fn relink_follows_the_state_tag() {
        let mut pages = [Aligned4K([0; 4096]), Aligned4K([0; 4096])];
        let mut slabs = Vec::new();
        for page in &mut pages {
            let frame = frame(page);
            let header = frame.overlay::<Slab>(0, 1).unwrap();
            slabs.push(unsafe { Slab::format(header, &frame, 64, 63, SlabLayout::OnPage, CpuId::BOOT) });
        }

        let mut lists = SlabLists::new();
        unsafe {
            lists.relink(slabs[0], SlabState::Partial);
            lists.relink(slabs[1], SlabState::Partial);
        }
        assert_eq!(lists.partial.len(), 2);
        assert_eq!(lists.partial.front(), Some(slabs[1]));

        unsafe { lists.relink(slabs[1], SlabState::Full) };
        assert_eq!(lists.partial.len(), 1);
        assert_eq!(lists.full.len(), 1);
        assert_eq!(unsafe { slabs[1].as_ref() }.state(), SlabState::Full);

        unsafe { lists.relink(slabs[0], SlabState::Free) };
        assert_eq!(lists.partial.len(), 0);
        assert_eq!(lists.partial.iter().count(), 0);
        assert_eq!(lists.full.iter().collect::<Vec<_>>(), [slabs[1]]);
    }
}
