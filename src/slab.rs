//! Fixed-size object allocator parametrized by a single size class. A pool
//! consumes whole pages from an upstream [`PageSource`] — generalizing the
//! teacher crate's `vm::slab`, which wired this hook directly to its own
//! buddy allocator — and maintains partial/full intrusive page lists with
//! a header embedded at the start of every page it owns.
//!
//! A zone serves exactly one size class; a caller wanting several classes
//! maintains one `Pool` per class, each with its own page source.

use core::ptr::NonNull;

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink, UnsafeRef};
use modular_bitfield::prelude::*;

use crate::addr::Addr;
use crate::buddy;
use crate::hooks::{zone_assert, DefaultHooks, Hooks};

/// Upstream page supplier. `buddy::Zone` implements this directly (at
/// order 0); [`NoPageSource`] is the "no upstream, caller donates pages by
/// hand" case.
pub trait PageSource {
    fn alloc_page(&mut self) -> Option<Addr>;
    fn free_page(&mut self, page: Addr);
}

/// A page source that never produces pages — used by pools fed entirely
/// through [`Pool::give_pages`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPageSource;

impl PageSource for NoPageSource {
    fn alloc_page(&mut self) -> Option<Addr> {
        None
    }
    fn free_page(&mut self, _page: Addr) {}
}

impl<H: Hooks, const PAGE_SHIFT: u32, const ORDERS: u32> PageSource
    for buddy::Zone<H, PAGE_SHIFT, ORDERS>
{
    fn alloc_page(&mut self) -> Option<Addr> {
        self.alloc(0).map(|b| b.0)
    }

    fn free_page(&mut self, page: Addr) {
        self.free(buddy::Block(page), 0);
    }
}

#[repr(C)]
struct FreeSlot {
    next: Option<NonNull<FreeSlot>>,
}

/// Packed free-slot accounting, mirroring the teacher's `PageHdr` bitfield
/// (there spread across `prev`/`next`/`num_free`/`free_list`/`slab_bin_id`
/// to fit a 48-bit-VA kernel's constraints; here a single `free_count`
/// field is all a page needs since list membership is carried by `link`
/// instead of hand-rolled prev/next pointers).
#[bitfield(bits = 32)]
#[derive(Clone, Copy)]
struct PageMeta {
    free_count: B24,
    #[skip]
    __: B8,
}

#[repr(C)]
struct PageHeader {
    link: LinkedListLink,
    free_slots: Option<NonNull<FreeSlot>>,
    meta: PageMeta,
}

intrusive_adapter!(PageAdapter = UnsafeRef<PageHeader>: PageHeader { link: LinkedListLink });

/// Compile-time configuration, mirroring spec §6's read-only `config`
/// structure.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub page_shift: u32,
    pub size_class: usize,
    pub objects_per_page: usize,
}

/// A slab zone serving objects of exactly `SIZE_CLASS` bytes out of
/// `2^PAGE_SHIFT`-byte pages.
pub struct Pool<PS: PageSource, H: Hooks = DefaultHooks, const PAGE_SHIFT: u32 = 12, const SIZE_CLASS: usize = 64>
{
    hooks: H,
    page_source: PS,
    header_span: usize,
    objs_per_page: usize,
    partial: LinkedList<PageAdapter>,
    full: LinkedList<PageAdapter>,
}

impl<PS: PageSource, H: Hooks, const PAGE_SHIFT: u32, const SIZE_CLASS: usize>
    Pool<PS, H, PAGE_SHIFT, SIZE_CLASS>
{
    pub fn config() -> Config {
        let this_objs = Self::objects_per_page();
        Config {
            page_shift: PAGE_SHIFT,
            size_class: SIZE_CLASS,
            objects_per_page: this_objs,
        }
    }

    fn header_span() -> usize {
        Addr::new(core::mem::size_of::<PageHeader>()).align_up(SIZE_CLASS).as_raw()
    }

    fn objects_per_page() -> usize {
        let page_size = 1usize << PAGE_SHIFT;
        (page_size - Self::header_span()) / SIZE_CLASS
    }

    pub fn new(hooks: H, page_source: PS) -> Self {
        static_assertions::const_assert!(SIZE_CLASS >= core::mem::size_of::<usize>());
        static_assertions::const_assert!(SIZE_CLASS.is_power_of_two());
        let objs_per_page = Self::objects_per_page();
        assert!(objs_per_page > 0, "slab: SIZE_CLASS too large for a single page");
        Self {
            hooks,
            page_source,
            header_span: Self::header_span(),
            objs_per_page,
            partial: LinkedList::default(),
            full: LinkedList::default(),
        }
    }

    /// Hands `count` raw pages starting at `base` to the zone; each is
    /// initialized with this class's slot layout and placed on the
    /// partial list with all slots free.
    pub fn give_pages(&mut self, base: Addr, count: usize) {
        let page_size = 1usize << PAGE_SHIFT;
        zone_assert!(
            self.hooks,
            base.is_aligned(page_size),
            "slab: give_pages base {base} is not page-aligned"
        );
        for i in 0..count {
            self.init_page(base + i * page_size);
        }
    }

    fn init_page(&mut self, page: Addr) {
        let header_ptr = page.as_mut_ptr::<PageHeader>();
        unsafe {
            header_ptr.write(PageHeader {
                link: LinkedListLink::new(),
                free_slots: None,
                meta: PageMeta::new(),
            });
            let header = &mut *header_ptr;
            let slot_area = page + self.header_span;
            for i in (0..self.objs_per_page).rev() {
                let slot_ptr = (slot_area + i * SIZE_CLASS).as_mut_ptr::<FreeSlot>();
                slot_ptr.write(FreeSlot { next: header.free_slots });
                header.free_slots = NonNull::new(slot_ptr);
            }
            header.meta.set_free_count(self.objs_per_page as u32);
            self.partial.push_back(UnsafeRef::from_raw(header_ptr));
        }
    }

    /// Allocates one object. `size` must be no larger than `SIZE_CLASS` —
    /// an invariant violation (construction-time contract), not a
    /// caller-parameter warning, since the pool's class is fixed at the
    /// type level.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        zone_assert!(
            self.hooks,
            size <= SIZE_CLASS,
            "slab: request of {size} bytes exceeds size class {SIZE_CLASS}"
        );

        if self.partial.is_empty() {
            let page = self.page_source.alloc_page()?;
            self.init_page(page);
        }

        let page_ref = self.partial.pop_front()?;
        let page_ptr = UnsafeRef::into_raw(page_ref) as *mut PageHeader;
        let header = unsafe { &mut *page_ptr };

        let mut slot = header.free_slots.take().expect("partial page has no free slot");
        header.free_slots = unsafe { slot.as_mut() }.next;
        header.meta.set_free_count(header.meta.free_count() - 1);

        unsafe {
            if header.meta.free_count() == 0 {
                self.full.push_back(UnsafeRef::from_raw(page_ptr));
            } else {
                self.partial.push_back(UnsafeRef::from_raw(page_ptr));
            }
        }

        Some(NonNull::new(slot.as_ptr() as *mut u8).unwrap())
    }

    /// Frees an object previously returned by `alloc`. Migrates the owning
    /// page back to the partial list if it had been full, and releases the
    /// page upstream if it is now entirely free and at least one other
    /// partial page remains.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        let page_size = 1usize << PAGE_SHIFT;
        let page = Addr::new(ptr.as_ptr() as usize).align_down(page_size);
        let page_ptr = page.as_mut_ptr::<PageHeader>();
        let header = unsafe { &mut *page_ptr };
        let was_full = header.meta.free_count() == 0;

        let slot_ptr = ptr.as_ptr() as *mut FreeSlot;
        unsafe {
            slot_ptr.write(FreeSlot { next: header.free_slots });
        }
        header.free_slots = NonNull::new(slot_ptr);
        header.meta.set_free_count(header.meta.free_count() + 1);

        if was_full {
            unsafe {
                let mut cursor = self.full.cursor_mut_from_ptr(page_ptr as *const PageHeader);
                cursor.remove();
                self.partial.push_back(UnsafeRef::from_raw(page_ptr));
            }
        }

        if header.meta.free_count() as usize == self.objs_per_page && self.partial.iter().count() > 1 {
            unsafe {
                let mut cursor = self.partial.cursor_mut_from_ptr(page_ptr as *const PageHeader);
                cursor.remove();
            }
            self.page_source.free_page(page);
        }
    }

    #[cfg(test)]
    pub(crate) fn partial_count(&self) -> usize {
        self.partial.iter().count()
    }

    #[cfg(test)]
    pub(crate) fn full_count(&self) -> usize {
        self.full.iter().count()
    }
}

unsafe impl<PS: PageSource, H: Hooks, const PAGE_SHIFT: u32, const SIZE_CLASS: usize> Send
    for Pool<PS, H, PAGE_SHIFT, SIZE_CLASS>
{
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::boxed::Box;
    use std::collections::HashSet;
    use std::vec::Vec;

    use rand::{seq::SliceRandom, thread_rng};

    use super::*;
    use crate::hooks::DefaultHooks;

    const PAGE_SHIFT: u32 = 12;

    fn donate_pages(count: usize) -> (Box<[u8]>, Addr) {
        let page_size = 1usize << PAGE_SHIFT;
        let backing = std::vec![0u8; (count + 1) * page_size].into_boxed_slice();
        let base = Addr::new(backing.as_ptr() as usize).align_up(page_size);
        (backing, base)
    }

    #[test]
    fn alloc_free_roundtrip_reuses_slot() {
        const SIZE_CLASS: usize = 64;
        let (_backing, base) = donate_pages(2);
        let mut pool: Pool<NoPageSource, DefaultHooks, PAGE_SHIFT, SIZE_CLASS> =
            Pool::new(DefaultHooks, NoPageSource);
        pool.give_pages(base, 2);

        let p = pool.alloc(SIZE_CLASS).unwrap();
        assert_eq!(p.as_ptr() as usize % SIZE_CLASS, 0);
        pool.free(p);
        let p2 = pool.alloc(SIZE_CLASS).unwrap();
        assert_eq!(p, p2, "freed slot should be reused");
    }

    #[test]
    fn full_page_migrates_lists_both_ways() {
        const SIZE_CLASS: usize = 256;
        let (_backing, base) = donate_pages(1);
        let mut pool: Pool<NoPageSource, DefaultHooks, PAGE_SHIFT, SIZE_CLASS> =
            Pool::new(DefaultHooks, NoPageSource);
        pool.give_pages(base, 1);
        let objs = Pool::<NoPageSource, DefaultHooks, PAGE_SHIFT, SIZE_CLASS>::objects_per_page();

        let mut ptrs = Vec::new();
        for _ in 0..objs {
            ptrs.push(pool.alloc(SIZE_CLASS).unwrap());
        }
        assert_eq!(pool.full_count(), 1);
        assert_eq!(pool.partial_count(), 0);

        let p = ptrs.pop().unwrap();
        pool.free(p);
        assert_eq!(pool.full_count(), 0);
        assert_eq!(pool.partial_count(), 1);

        for p in ptrs {
            pool.free(p);
        }
    }

    #[test]
    fn stress_round_trip_is_repeatable() {
        const SIZE_CLASS: usize = 128;
        let (_backing, base) = donate_pages(32);
        let mut pool: Pool<NoPageSource, DefaultHooks, PAGE_SHIFT, SIZE_CLASS> =
            Pool::new(DefaultHooks, NoPageSource);
        pool.give_pages(base, 32);

        for _ in 0..2 {
            let mut ptrs = Vec::new();
            while let Some(p) = pool.alloc(SIZE_CLASS) {
                ptrs.push(p);
            }
            let mut seen = HashSet::new();
            for p in &ptrs {
                assert!(seen.insert(p.as_ptr() as usize), "duplicate slot returned");
            }
            ptrs.shuffle(&mut thread_rng());
            for p in ptrs {
                pool.free(p);
            }
        }
    }
}
