//! Relative addressing for memory shared across address spaces.
//!
//! Every process maps each node segment at its own virtual address, so raw
//! pointers are never stored in shared memory. A [`RelativeOffset`] names a
//! location as `(segment rank, byte offset from that segment's base)` packed
//! into one signed 64-bit word; [`SegmentMap`] resolves it against this
//! process's base for that rank.
//!
//! ```text
//!  63            32 31             0
//! ┌────────────────┬────────────────┐
//! │   owner rank   │  byte offset   │
//! └────────────────┴────────────────┘
//! ```

use std::collections::HashMap;
use std::fmt;
use std::mem::size_of;
use std::ptr::NonNull;

use crate::core::fragment::FragmentHeader;
use crate::core::error::fatal;

/// Marks an empty FIFO end or an unlinked `next`. Negative, so no
/// `(rank, offset)` pair with `rank <= i32::MAX` can produce it.
pub const FIFO_FREE: i64 = -2;

pub const MAX_RANK: u32 = i32::MAX as u32;

/// A location inside some node's shared segment, valid in every process that
/// maps that segment.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RelativeOffset(i64);

impl RelativeOffset {
    pub const FREE: RelativeOffset = RelativeOffset(FIFO_FREE);

    pub fn new(rank: u32, offset: u32) -> Self {
        debug_assert!(rank <= MAX_RANK);
        RelativeOffset(((rank as i64) << 32) | offset as i64)
    }

    pub fn from_raw(raw: i64) -> Self {
        RelativeOffset(raw)
    }

    pub fn raw(self) -> i64 {
        self.0
    }

    pub fn is_free(self) -> bool {
        self.0 == FIFO_FREE
    }

    pub fn rank(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn offset(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Debug for RelativeOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_free() {
            write!(f, "RelativeOffset(FREE)")
        } else {
            write!(f, "RelativeOffset({}:{:#x})", self.rank(), self.offset())
        }
    }
}

/// Turns a relative offset into a fragment header this process can touch.
pub trait Resolver {
    fn resolve(&self, offset: RelativeOffset) -> NonNull<FragmentHeader>;
}

#[derive(Clone, Copy)]
struct Mapping {
    base: NonNull<u8>,
    len: usize,
}

/// Per-process table of segment base addresses, keyed by owner rank.
pub struct SegmentMap {
    local_rank: u32,
    mappings: HashMap<u32, Mapping>,
}

// SAFETY: the map only stores base addresses of mappings owned elsewhere in
// this process; translation is pure arithmetic and the table is not mutated
// while shared.
unsafe impl Send for SegmentMap {}
unsafe impl Sync for SegmentMap {}

impl SegmentMap {
    pub fn new(local_rank: u32) -> Self {
        Self {
            local_rank,
            mappings: HashMap::new(),
        }
    }

    pub fn local_rank(&self) -> u32 {
        self.local_rank
    }

    /// Records where `rank`'s segment is mapped in this process.
    ///
    /// # Safety
    ///
    /// `base..base + len` must stay mapped for as long as any translation
    /// through this map is performed.
    pub unsafe fn register(&mut self, rank: u32, base: *mut u8, len: usize) {
        let Some(base) = NonNull::new(base) else {
            fatal!("segment base for rank {rank} is null");
        };
        if rank > MAX_RANK || len > u32::MAX as usize {
            fatal!("segment for rank {rank} cannot be addressed relatively");
        }
        self.mappings.insert(rank, Mapping { base, len });
    }

    pub fn unregister(&mut self, rank: u32) {
        self.mappings.remove(&rank);
    }

    pub fn is_registered(&self, rank: u32) -> bool {
        self.mapping(rank).is_some()
    }

    fn mapping(&self, rank: u32) -> Option<Mapping> {
        self.mappings.get(&rank).copied()
    }

    fn expect_mapping(&self, rank: u32) -> Mapping {
        match self.mapping(rank) {
            Some(mapping) => mapping,
            None => fatal!("no segment base registered for rank {rank}"),
        }
    }

    /// Offset of `local_ptr` against this process's own segment.
    pub fn to_relative(&self, local_ptr: *const u8) -> RelativeOffset {
        self.to_relative_for_peer(self.local_rank, local_ptr)
    }

    /// Offset of `local_ptr` against `rank`'s segment, for pointers into
    /// pages that `rank` owns.
    pub fn to_relative_for_peer(&self, rank: u32, local_ptr: *const u8) -> RelativeOffset {
        let mapping = self.expect_mapping(rank);
        let base = mapping.base.as_ptr() as usize;
        let addr = local_ptr as usize;
        if addr < base || addr - base >= mapping.len {
            fatal!("address {addr:#x} is outside the segment of rank {rank}");
        }
        RelativeOffset::new(rank, (addr - base) as u32)
    }

    pub fn to_virtual(&self, offset: RelativeOffset) -> *mut u8 {
        if offset.is_free() {
            fatal!("attempted to translate the free sentinel");
        }
        let mapping = self.expect_mapping(offset.rank());
        let local = offset.offset() as usize;
        if local >= mapping.len {
            fatal!("{offset:?} is outside a segment of {} bytes", mapping.len);
        }
        // SAFETY: local < len and the mapping is live per `register`.
        unsafe { mapping.base.as_ptr().add(local) }
    }
}

impl Resolver for SegmentMap {
    fn resolve(&self, offset: RelativeOffset) -> NonNull<FragmentHeader> {
        let mapping = self.expect_mapping(offset.rank());
        if offset.offset() as usize + size_of::<FragmentHeader>() > mapping.len {
            fatal!("{offset:?} does not leave room for a fragment header");
        }
        let ptr = self.to_virtual(offset) as *mut FragmentHeader;
        if ptr.align_offset(std::mem::align_of::<FragmentHeader>()) != 0 {
            fatal!("{offset:?} is not a fragment header boundary");
        }
        // SAFETY: to_virtual never returns null for a registered mapping.
        unsafe { NonNull::new_unchecked(ptr) }
    }
}
