//! Spin-lock convenience wrapper turning any of the three `&mut self`
//! engines into a `&self`-based `core::alloc::Allocator`/`GlobalAlloc`,
//! the external-mutex counterpart of the teacher crate's own
//! `unsafe impl Allocator for BuddyAllocator` (there backed by a `Mutex`
//! held *inside* the zone; here the zones stay lock-free and a caller opts
//! into `Locked<T>` only if it wants one as a process-wide allocator).

use core::alloc::{AllocError, GlobalAlloc, Layout};
use core::cmp::max;
use core::ptr::NonNull;

use spin::Mutex;

use crate::{buddy, slab, tlsf};

/// A zone behind a spinlock, usable as `#[global_allocator]` or wherever
/// `core::alloc::Allocator` is expected.
pub struct Locked<T>(Mutex<T>);

impl<T> Locked<T> {
    pub const fn new(inner: T) -> Self {
        Self(Mutex::new(inner))
    }

    pub fn lock(&self) -> spin::MutexGuard<'_, T> {
        self.0.lock()
    }
}

/// What `Locked<T>` needs from an engine to back an `Allocator`/`GlobalAlloc`
/// impl — a single size-oriented alloc/free pair. Implemented once per
/// engine below; layout-to-size translation (rounding to order, to size
/// class, or just padding for alignment) lives in each impl.
trait RawAlloc {
    unsafe fn raw_alloc(&mut self, layout: Layout) -> Option<NonNull<u8>>;
    unsafe fn raw_dealloc(&mut self, ptr: NonNull<u8>, layout: Layout);
}

impl<H: crate::hooks::Hooks, const PAGE_SHIFT: u32, const ORDERS: u32> RawAlloc
    for buddy::Zone<H, PAGE_SHIFT, ORDERS>
{
    unsafe fn raw_alloc(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let page_size = 1usize << PAGE_SHIFT;
        let pages = layout.size().div_ceil(page_size).max(1);
        let order = pages.next_power_of_two().trailing_zeros();
        self.alloc(order).map(|b| NonNull::new_unchecked(b.as_ptr()))
    }

    unsafe fn raw_dealloc(&mut self, ptr: NonNull<u8>, layout: Layout) {
        let page_size = 1usize << PAGE_SHIFT;
        let pages = layout.size().div_ceil(page_size).max(1);
        let order = pages.next_power_of_two().trailing_zeros();
        self.free(buddy::Block(crate::addr::Addr::new(ptr.as_ptr() as usize)), order);
    }
}

impl<PS: slab::PageSource, H: crate::hooks::Hooks, const PAGE_SHIFT: u32, const SIZE_CLASS: usize> RawAlloc
    for slab::Pool<PS, H, PAGE_SHIFT, SIZE_CLASS>
{
    unsafe fn raw_alloc(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        self.alloc(max(layout.size(), layout.align()))
    }

    unsafe fn raw_dealloc(&mut self, ptr: NonNull<u8>, _layout: Layout) {
        self.free(ptr);
    }
}

impl<H: crate::hooks::Hooks, const FL: usize, const SL: usize, Z> RawAlloc for tlsf::Tlsf<H, FL, SL, Z> {
    unsafe fn raw_alloc(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        self.alloc(max(layout.size(), layout.align()))
    }

    unsafe fn raw_dealloc(&mut self, ptr: NonNull<u8>, _layout: Layout) {
        self.free(Some(ptr));
    }
}

unsafe impl<T: RawAlloc> core::alloc::Allocator for Locked<T> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let ptr = unsafe { self.lock().raw_alloc(layout) }.ok_or(AllocError)?;
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.lock().raw_dealloc(ptr, layout)
    }
}

unsafe impl<T: RawAlloc> GlobalAlloc for Locked<T> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.lock().raw_alloc(layout).map_or(core::ptr::null_mut(), |p| p.as_ptr())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            self.lock().raw_dealloc(ptr, layout);
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::boxed::Box;

    use core::alloc::Layout;

    use super::*;
    use crate::hooks::DefaultHooks;

    #[test]
    fn locked_slab_services_global_alloc_layout() {
        const PAGE_SHIFT: u32 = 12;
        const SIZE_CLASS: usize = 64;
        let page_size = 1usize << PAGE_SHIFT;
        let backing = std::vec![0u8; 4 * page_size].into_boxed_slice();
        let base = crate::addr::Addr::new(backing.as_ptr() as usize).align_up(page_size);

        let mut pool: slab::Pool<slab::NoPageSource, DefaultHooks, PAGE_SHIFT, SIZE_CLASS> =
            slab::Pool::new(DefaultHooks, slab::NoPageSource);
        pool.give_pages(base, 2);

        let locked = Locked::new(pool);
        let layout = Layout::from_size_align(32, 8).unwrap();
        let ptr = unsafe { GlobalAlloc::alloc(&locked, layout) };
        assert!(!ptr.is_null());
        unsafe { GlobalAlloc::dealloc(&locked, ptr, layout) };

        std::mem::forget(backing);
    }
}
