//! Two-Level Segregated Fit allocator: O(1) classification by bit-scan over
//! a first-level/second-level bitmap matrix, operating on caller-supplied
//! memory blocks. Self-contained — unlike `buddy`/`slab` it never calls an
//! upstream page source.
//!
//! No workable TLSF implementation existed anywhere in the crates this
//! project drew from, so the chunk-header and free-list mechanics here are
//! built directly from the algorithm description (two-word chunk headers,
//! free-list links overlaid on payload, sentinel chunks at both ends of a
//! managed block) rather than adapted from a sibling module the way
//! `buddy`/`slab` were.
//!
//! `FL` is the number of first-level (power-of-two) classes the zone can
//! address; `SL` is the number of second-level subdivisions within each
//! first-level class and must be a power of two. Both are plain const
//! generics (not a shift exponent for `SL`) so the free-list matrix is a
//! fixed-size `[[_; SL]; FL]` array — the same trick the `rlsf` crate's
//! public API uses (`Tlsf<'pool, FLBitmap, SLBitmap, FLLEN, SLLEN>`) to
//! avoid needing const-generic arithmetic on stable Rust. `Z` is a
//! caller-defined type embedded in the zone alongside the bitmaps, for
//! state a caller wants to carry per-zone; it defaults to `()`.

use core::mem::size_of;
use core::ptr::NonNull;

use bitflags::bitflags;

use crate::addr::Addr;
use crate::error::{Error, Result};
use crate::hooks::{zone_assert, DefaultHooks, Hooks};

const UNIT_SIZE: usize = size_of::<usize>();

bitflags! {
    /// Low bits of a chunk's `size_and_flags` word — the chunk size itself
    /// is always unit-aligned, so these never collide with it.
    struct ChunkFlags: usize {
        const FREE = 0b01;
        const PREV_FREE = 0b10;
    }
}

const FLAG_MASK: usize = ChunkFlags::all().bits();

#[repr(C)]
struct ChunkHeader {
    prev_physical_size: usize,
    size_and_flags: usize,
}

impl ChunkHeader {
    fn flags(&self) -> ChunkFlags {
        ChunkFlags::from_bits_truncate(self.size_and_flags & FLAG_MASK)
    }

    fn size(&self) -> usize {
        self.size_and_flags & !FLAG_MASK
    }

    fn is_free(&self) -> bool {
        self.flags().contains(ChunkFlags::FREE)
    }

    fn prev_free(&self) -> bool {
        self.flags().contains(ChunkFlags::PREV_FREE)
    }

    fn set_prev_free(&mut self, value: bool) {
        let mut flags = self.flags();
        flags.set(ChunkFlags::PREV_FREE, value);
        self.size_and_flags = self.size() | flags.bits();
    }

    fn free(prev_physical_size: usize, size: usize) -> Self {
        ChunkHeader { prev_physical_size, size_and_flags: size | ChunkFlags::FREE.bits() }
    }

    fn allocated(prev_physical_size: usize, size: usize, prev_free: bool) -> Self {
        let mut flags = ChunkFlags::empty();
        flags.set(ChunkFlags::PREV_FREE, prev_free);
        ChunkHeader { prev_physical_size, size_and_flags: size | flags.bits() }
    }
}

/// Free-list links, valid only while the chunk is free — overlaid on the
/// same bytes a live allocation would occupy as payload.
#[repr(C)]
struct FreeLink {
    next: Option<NonNull<u8>>,
    prev: Option<NonNull<u8>>,
}

const HEADER_SIZE: usize = size_of::<ChunkHeader>();
const MIN_CHUNK_SIZE: usize = HEADER_SIZE + size_of::<FreeLink>();

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Compile-time configuration, matching spec §6's read-only `config`
/// structure exactly: `unit_size`, `zone_header_size`, `zone_extra_data_size`,
/// `fl_shift`, `sl_shift`, `machine_alignment`.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub unit_size: usize,
    pub zone_header_size: usize,
    pub zone_extra_data_size: usize,
    pub fl_shift: u32,
    pub sl_shift: u32,
    pub machine_alignment: usize,
}

/// `Z` is the zone's extension point (spec's `EXTRA_ZONEDATA_T`): a
/// caller-defined type embedded in the zone header alongside the bitmaps,
/// for state a caller wants to carry per-zone without a separate
/// allocation. `()` — the default — costs nothing and is what every zone
/// uses unless a caller opts in.
pub struct Tlsf<H: Hooks = DefaultHooks, const FL: usize = 32, const SL: usize = 16, Z = ()> {
    hooks: H,
    fl_bitmap: usize,
    sl_bitmap: [usize; FL],
    heads: [[Option<NonNull<u8>>; SL]; FL],
    blocks: heapless::Vec<(Addr, usize), 8>,
    zone_data: Z,
}

impl<H: Hooks, const FL: usize, const SL: usize, Z> Tlsf<H, FL, SL, Z> {
    pub fn config() -> Config {
        Config {
            unit_size: UNIT_SIZE,
            zone_header_size: Self::zone_header_size(),
            zone_extra_data_size: size_of::<Z>(),
            fl_shift: FL as u32,
            sl_shift: SL.trailing_zeros(),
            machine_alignment: UNIT_SIZE,
        }
    }

    /// Minimum buffer size `create_zone` will accept: the two sentinel
    /// chunks plus one real free chunk large enough to carry a free-list
    /// link.
    pub const fn zone_header_size() -> usize {
        2 * HEADER_SIZE + MIN_CHUNK_SIZE
    }

    /// The caller-defined extension data embedded in this zone (spec's
    /// `EXTRA_ZONEDATA_T`), read-only.
    pub fn zone_data(&self) -> &Z {
        &self.zone_data
    }

    /// Mutable access to the zone's extension data.
    pub fn zone_data_mut(&mut self) -> &mut Z {
        &mut self.zone_data
    }

    /// Adds a further disjoint memory region to the zone. Returns the
    /// usable byte count installed (the payload capacity of the single
    /// free chunk this carves out) — `0` if `base` is misaligned or the
    /// block is too small to carry its own sentinel overhead, matching
    /// spec.md §4.3's "returns usable bytes, 0 on failure" contract
    /// (never an `Err`: `add_block`'s failure sentinel is the zero byte
    /// count itself, not the construction-only `Result` `create_zone` uses).
    pub fn add_block(&mut self, base: Addr, size: usize) -> usize {
        if !base.is_aligned(UNIT_SIZE) {
            self.hooks.warn(format_args!("tlsf: block base {base} is not unit-aligned"));
            return 0;
        }
        let usable_size = size - (size % UNIT_SIZE);
        if usable_size < Self::zone_header_size() {
            self.hooks
                .warn(format_args!("tlsf: block of {size} bytes is too small to carry sentinel overhead"));
            return 0;
        }

        let free_size = usable_size - 2 * HEADER_SIZE;
        let free_addr = base + HEADER_SIZE;
        let tail_addr = free_addr + free_size;

        unsafe {
            self.write_header(base, ChunkHeader::allocated(0, HEADER_SIZE, false));
            self.write_header(free_addr, ChunkHeader::free(HEADER_SIZE, free_size));
            self.write_header(tail_addr, ChunkHeader::allocated(free_size, HEADER_SIZE, true));
        }
        self.insert_free(free_addr, free_size);

        zone_assert!(self.hooks, self.blocks.push((base, usable_size)).is_ok(), "tlsf: too many disjoint blocks added");

        free_size - HEADER_SIZE
    }

    unsafe fn read_header(&self, addr: Addr) -> ChunkHeader {
        core::ptr::read(addr.as_ptr::<ChunkHeader>())
    }

    unsafe fn write_header(&self, addr: Addr, header: ChunkHeader) {
        core::ptr::write(addr.as_mut_ptr::<ChunkHeader>(), header);
    }

    unsafe fn free_link_mut(addr: Addr) -> &'static mut FreeLink {
        &mut *(addr + HEADER_SIZE).as_mut_ptr::<FreeLink>()
    }

    /// Exact free-list mapping for a chunk of `total_size` bytes.
    fn mapping(total_size: usize) -> (usize, usize) {
        let sl_shift = SL.trailing_zeros();
        let fl_raw = usize::BITS - 1 - total_size.leading_zeros();
        if fl_raw < sl_shift {
            (sl_shift as usize, total_size)
        } else {
            let fl = fl_raw as usize;
            let sl = (total_size >> (fl_raw - sl_shift)) & (SL - 1);
            (fl, sl)
        }
    }

    /// Good-fit mapping for `alloc`: rounds up to the next list boundary
    /// first so every chunk on the mapped list satisfies the request.
    fn mapping_for_alloc(total_size: usize) -> (usize, usize) {
        let sl_shift = SL.trailing_zeros();
        if total_size < (1 << sl_shift) {
            return Self::mapping(total_size);
        }
        let fl_raw = usize::BITS - 1 - total_size.leading_zeros();
        let round_mask = (1usize << (fl_raw - sl_shift)) - 1;
        Self::mapping(total_size + round_mask)
    }

    fn find_suitable(&self, fl: usize, sl: usize) -> Option<(usize, usize)> {
        let sl_map = self.sl_bitmap[fl] & (!0usize << sl);
        if sl_map != 0 {
            return Some((fl, sl_map.trailing_zeros() as usize));
        }
        let fl_map = self.fl_bitmap & (!0usize << (fl + 1));
        if fl_map == 0 {
            return None;
        }
        let fl2 = fl_map.trailing_zeros() as usize;
        let sl2 = self.sl_bitmap[fl2].trailing_zeros() as usize;
        Some((fl2, sl2))
    }

    // Free-list head/next/prev pointers all refer to the chunk header
    // address itself (never the payload) so the same value can be handed
    // straight back to `read_header`/`remove_free` without translation.

    fn insert_free(&mut self, addr: Addr, total_size: usize) {
        let (fl, sl) = Self::mapping(total_size);
        let head = self.heads[fl][sl];
        unsafe {
            *Self::free_link_mut(addr) = FreeLink { next: head, prev: None };
            if let Some(old_head) = head {
                Self::free_link_mut(Addr::new(old_head.as_ptr() as usize)).prev =
                    Some(NonNull::new(addr.as_mut_ptr::<u8>()).unwrap());
            }
        }
        self.heads[fl][sl] = Some(NonNull::new(addr.as_mut_ptr::<u8>()).unwrap());
        self.sl_bitmap[fl] |= 1 << sl;
        self.fl_bitmap |= 1 << fl;
    }

    fn remove_free(&mut self, addr: Addr, fl: usize, sl: usize) {
        let link = unsafe { Self::free_link_mut(addr) };
        let (prev, next) = (link.prev, link.next);

        match prev {
            Some(p) => unsafe { Self::free_link_mut(Addr::new(p.as_ptr() as usize)).next = next },
            None => {
                self.heads[fl][sl] = next;
            }
        }
        if let Some(n) = next {
            unsafe {
                Self::free_link_mut(Addr::new(n.as_ptr() as usize)).prev = prev;
            }
        }

        if self.heads[fl][sl].is_none() {
            self.sl_bitmap[fl] &= !(1 << sl);
            if self.sl_bitmap[fl] == 0 {
                self.fl_bitmap &= !(1 << fl);
            }
        }
    }

    fn pop_free(&mut self, fl: usize, sl: usize) -> Addr {
        let head = self.heads[fl][sl].expect("find_suitable returned an empty list");
        let addr = Addr::new(head.as_ptr() as usize);
        self.remove_free(addr, fl, sl);
        addr
    }

    /// `size == 0` returns `None`, matching spec §9's explicit resolution.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let total_needed = core::cmp::max(round_up(size, UNIT_SIZE) + HEADER_SIZE, MIN_CHUNK_SIZE);
        let fl_needed = (usize::BITS - 1 - total_needed.leading_zeros()) as usize;
        if fl_needed >= FL {
            self.hooks.warn(format_args!("tlsf: request of {size} bytes exceeds zone capacity"));
            return None;
        }

        let (fl, sl) = Self::mapping_for_alloc(total_needed);
        let (fl, sl) = self.find_suitable(fl, sl)?;
        let addr = self.pop_free(fl, sl);

        let header = unsafe { self.read_header(addr) };
        let chunk_total = header.size();
        let prev_physical_size = header.prev_physical_size;
        let prev_free = header.prev_free();

        let total = if chunk_total - total_needed >= MIN_CHUNK_SIZE {
            let tail_addr = addr + total_needed;
            let tail_size = chunk_total - total_needed;
            unsafe {
                self.write_header(tail_addr, ChunkHeader::free(total_needed, tail_size));
                let after_tail = tail_addr + tail_size;
                let mut after_header = self.read_header(after_tail);
                after_header.prev_physical_size = tail_size;
                self.write_header(after_tail, after_header);
            }
            self.insert_free(tail_addr, tail_size);
            total_needed
        } else {
            chunk_total
        };

        let next_addr = addr + total;
        unsafe {
            let mut next_header = self.read_header(next_addr);
            next_header.set_prev_free(false);
            self.write_header(next_addr, next_header);
            self.write_header(addr, ChunkHeader::allocated(prev_physical_size, total, prev_free));
        }

        Some(NonNull::new((addr + HEADER_SIZE).as_mut_ptr::<u8>()).unwrap())
    }

    /// A `None` `ptr` is a no-op, matching spec §9's explicit resolution.
    pub fn free(&mut self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else {
            return;
        };
        let mut addr = Addr::new(ptr.as_ptr() as usize) - HEADER_SIZE;
        let header = unsafe { self.read_header(addr) };
        zone_assert!(self.hooks, !header.is_free(), "tlsf: double free at {addr}");

        let mut total = header.size();
        let mut prev_physical_size = header.prev_physical_size;

        if header.prev_free() {
            let prev_addr = addr - prev_physical_size;
            let prev_header = unsafe { self.read_header(prev_addr) };
            let (fl, sl) = Self::mapping(prev_header.size());
            self.remove_free(prev_addr, fl, sl);
            total += prev_header.size();
            prev_physical_size = prev_header.prev_physical_size;
            addr = prev_addr;
        }

        let succ_addr = addr + total;
        let succ_header = unsafe { self.read_header(succ_addr) };
        if succ_header.is_free() {
            let (fl, sl) = Self::mapping(succ_header.size());
            self.remove_free(succ_addr, fl, sl);
            total += succ_header.size();
        }

        let next_addr = addr + total;
        unsafe {
            let mut next_header = self.read_header(next_addr);
            next_header.prev_physical_size = total;
            next_header.set_prev_free(true);
            self.write_header(next_addr, next_header);

            self.write_header(addr, ChunkHeader::free(prev_physical_size, total));
        }
        self.insert_free(addr, total);
    }

    #[cfg(test)]
    fn audit_bitmap_matches_lists(&self) -> bool {
        for fl in 0..FL {
            for sl in 0..SL {
                let bit = self.sl_bitmap[fl] & (1 << sl) != 0;
                let has_head = self.heads[fl][sl].is_some();
                if bit != has_head {
                    return false;
                }
            }
            let fl_bit = self.fl_bitmap & (1 << fl) != 0;
            if fl_bit != (self.sl_bitmap[fl] != 0) {
                return false;
            }
        }
        true
    }
}

impl<H: Hooks, const FL: usize, const SL: usize, Z: Default> Tlsf<H, FL, SL, Z> {
    /// Creates a zone in place over `[base, base + size)`.
    pub fn create_zone(base: Addr, size: usize, hooks: H) -> Result<Self> {
        static_assertions::const_assert!(SL.is_power_of_two());
        static_assertions::const_assert!(FL >= 1);
        let mut zone = Tlsf {
            hooks,
            fl_bitmap: 0,
            sl_bitmap: [0; FL],
            heads: [[None; SL]; FL],
            blocks: heapless::Vec::new(),
            zone_data: Z::default(),
        };
        if zone.add_block(base, size) == 0 {
            if !base.is_aligned(UNIT_SIZE) {
                return Err(Error::Unaligned { base: base.as_raw(), align: UNIT_SIZE });
            }
            return Err(Error::TooSmall { needed: Self::zone_header_size(), given: size });
        }
        Ok(zone)
    }
}

unsafe impl<H: Hooks, const FL: usize, const SL: usize, Z> Send for Tlsf<H, FL, SL, Z> {}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::boxed::Box;
    use std::vec::Vec;

    use rand::{seq::SliceRandom, thread_rng};

    use super::*;
    use crate::hooks::DefaultHooks;

    type TestZone = Tlsf<DefaultHooks, 32, 16>;

    fn backing(size: usize) -> (Box<[u8]>, Addr) {
        let buf = std::vec![0u8; size + UNIT_SIZE].into_boxed_slice();
        let base = Addr::new(buf.as_ptr() as usize).align_up(UNIT_SIZE);
        (buf, base)
    }

    #[test]
    fn zone_minimum_size_boundary() {
        let needed = TestZone::zone_header_size();
        let (_buf, base) = backing(needed + 101);

        assert!(TestZone::create_zone(base, needed - 1, DefaultHooks).is_err());
        assert!(TestZone::create_zone(base, needed, DefaultHooks).is_ok());
        assert!(TestZone::create_zone(base, needed + 101, DefaultHooks).is_ok());
    }

    #[test]
    fn add_block_extends_capacity() {
        let (_buf0, base0) = backing(10 * 1024);
        let mut zone = TestZone::create_zone(base0, 10 * 1024, DefaultHooks).unwrap();

        let (_buf1, base1) = backing(10 * 1024);
        let (_buf2, base2) = backing(100 * 1024);
        let (_buf3, base3) = backing(100 * 1024);
        assert!(zone.add_block(base1, 10 * 1024) > 0);
        assert!(zone.add_block(base2, 100 * 1024) > 0);
        assert!(zone.add_block(base3, 100 * 1024) > 0);

        let p = zone.alloc(98_000);
        assert!(p.is_some());
        zone.free(p);
    }

    #[test]
    fn add_block_too_small_returns_zero_not_err() {
        let (_buf0, base0) = backing(10 * 1024);
        let mut zone = TestZone::create_zone(base0, 10 * 1024, DefaultHooks).unwrap();

        let (_buf1, base1) = backing(1024);
        assert_eq!(zone.add_block(base1, 19), 0);
        assert!(zone.add_block(base1, 1024) > 0);
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    struct TestZoneData {
        dummy: u32,
    }

    #[test]
    fn zone_extra_data_is_accessible() {
        type ExtZone = Tlsf<DefaultHooks, 32, 16, TestZoneData>;
        assert_eq!(ExtZone::config().zone_extra_data_size, core::mem::size_of::<TestZoneData>());

        let (_buf, base) = backing(64 * 1024);
        let mut zone = ExtZone::create_zone(base, 64 * 1024, DefaultHooks).unwrap();
        assert_eq!(*zone.zone_data(), TestZoneData::default());
        zone.zone_data_mut().dummy = 7;
        assert_eq!(zone.zone_data().dummy, 7);
    }

    #[test]
    fn null_safety_and_rounding() {
        let (_buf, base) = backing(64 * 1024);
        let mut zone = TestZone::create_zone(base, 64 * 1024, DefaultHooks).unwrap();

        assert!(zone.alloc(0).is_none());
        zone.free(None);

        let p = zone.alloc(UNIT_SIZE * 2 - 1);
        assert!(p.is_some());
        zone.free(p);
    }

    #[test]
    fn alloc_free_roundtrip_restores_state() {
        let (_buf, base) = backing(64 * 1024);
        let mut zone = TestZone::create_zone(base, 64 * 1024, DefaultHooks).unwrap();

        let p = zone.alloc(128).unwrap();
        assert!(zone.audit_bitmap_matches_lists());
        zone.free(Some(p));
        assert!(zone.audit_bitmap_matches_lists());
        let p2 = zone.alloc(128).unwrap();
        assert_eq!(p, p2, "freed chunk should be reused for an identical request");
        zone.free(Some(p2));
    }

    #[test]
    fn stress_round_trip_is_repeatable() {
        let (_buf, base) = backing(256 * 1024);
        let mut zone = TestZone::create_zone(base, 256 * 1024, DefaultHooks).unwrap();
        let mut rng = thread_rng();
        let sizes = [16usize, 32, 64, 128, 256, 512, 1024];

        for _ in 0..2 {
            let mut ptrs: Vec<NonNull<u8>> = Vec::new();
            loop {
                let size = *sizes.choose(&mut rng).unwrap();
                match zone.alloc(size) {
                    Some(p) => ptrs.push(p),
                    None => break,
                }
                if ptrs.len() > 2000 {
                    break;
                }
            }
            assert!(zone.audit_bitmap_matches_lists());
            ptrs.shuffle(&mut rng);
            for p in ptrs {
                zone.free(Some(p));
            }
            assert!(zone.audit_bitmap_matches_lists());
        }
    }

    #[test]
    #[should_panic]
    fn double_free_is_caught() {
        let (_buf, base) = backing(64 * 1024);
        let mut zone = TestZone::create_zone(base, 64 * 1024, DefaultHooks).unwrap();
        let p = zone.alloc(64);
        zone.free(p);
        zone.free(p);
    }
}
