use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;

use crate::core::config::SizeClassConfig;
use crate::core::relative::FIFO_FREE;
use crate::core::segment::SharedSegment;
use crate::core::{Error, Result};

pub const FRAGMENT_HEADER_SIZE: usize = 64;
pub const FRAGMENT_ALIGN: usize = 64;

/// Set on a fragment travelling back to the rank that owns its pages.
pub const FLAG_RETURNED: u16 = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SizeClass {
    User = 0,
    Eager = 1,
    MaxSend = 2,
}

impl SizeClass {
    pub const ALL: [SizeClass; 3] = [SizeClass::User, SizeClass::Eager, SizeClass::MaxSend];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SizeClass::User),
            1 => Some(SizeClass::Eager),
            2 => Some(SizeClass::MaxSend),
            _ => None,
        }
    }

    pub fn capacity(self, classes: &SizeClassConfig) -> usize {
        match self {
            SizeClass::User => classes.user,
            SizeClass::Eager => classes.eager,
            SizeClass::MaxSend => classes.max_send,
        }
    }

    /// Maps a payload capacity back to the class that produced it.
    pub fn from_capacity(classes: &SizeClassConfig, capacity: usize) -> Option<Self> {
        SizeClass::ALL
            .into_iter()
            .find(|class| class.capacity(classes) == capacity)
    }

    /// Smallest class whose capacity holds `len` bytes.
    pub fn for_payload(classes: &SizeClassConfig, len: usize) -> Option<Self> {
        SizeClass::ALL
            .into_iter()
            .filter(|class| class.capacity(classes) >= len)
            .min_by_key(|class| class.capacity(classes))
    }
}

/// Largest payload a slot can carry; the header stores capacities as `u32`.
pub const MAX_FRAGMENT_CAPACITY: usize = u32::MAX as usize - FRAGMENT_HEADER_SIZE;

/// Bytes one slot of `capacity` takes in the arena, or `None` if the
/// capacity cannot be represented.
pub fn slot_size(capacity: usize) -> Option<usize> {
    if capacity > MAX_FRAGMENT_CAPACITY {
        return None;
    }
    FRAGMENT_HEADER_SIZE
        .checked_add(capacity)
        .and_then(|len| align_up(len, FRAGMENT_ALIGN))
}

pub(crate) fn align_up(value: usize, align: usize) -> Option<usize> {
    value
        .checked_add(align - 1)
        .map(|value| value & !(align - 1))
}

/// Header prefixed to every fragment payload in shared memory.
///
/// `src_rank`, `slot`, `capacity` and `size_class` are written once when the
/// slot is carved and are read-only afterwards. `slot` keys the owner's local
/// descriptor table and means nothing to other ranks.
#[repr(C, align(64))]
pub struct FragmentHeader {
    /// Relative offset of the next fragment in a FIFO, or `FIFO_FREE`.
    pub next: AtomicI64,
    pub src_rank: u32,
    pub slot: u32,
    pub capacity: u32,
    pub payload_len: AtomicU32,
    pub flags: AtomicU16,
    pub size_class: u8,
    pub _pad: [u8; 37],
}

impl FragmentHeader {
    /// Writes a fresh header at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be aligned, writable for `slot_size(capacity)` bytes and not
    /// yet visible to any other thread or process.
    pub(crate) unsafe fn init(
        ptr: *mut FragmentHeader,
        src_rank: u32,
        slot: u32,
        class: SizeClass,
        capacity: u32,
    ) {
        ptr.write(FragmentHeader {
            next: AtomicI64::new(FIFO_FREE),
            src_rank,
            slot,
            capacity,
            payload_len: AtomicU32::new(0),
            flags: AtomicU16::new(0),
            size_class: class as u8,
            _pad: [0u8; 37],
        });
    }

    pub fn load_next(&self) -> i64 {
        self.next.load(Ordering::Acquire)
    }

    pub fn store_next(&self, next: i64) {
        self.next.store(next, Ordering::Release);
    }

    pub fn flags(&self) -> u16 {
        self.flags.load(Ordering::Relaxed)
    }

    pub fn class(&self) -> Option<SizeClass> {
        SizeClass::from_u8(self.size_class)
    }

    pub(crate) fn payload_ptr(&self) -> *mut u8 {
        // SAFETY: the payload immediately follows the header inside the slot.
        unsafe { (self as *const FragmentHeader as *mut u8).add(FRAGMENT_HEADER_SIZE) }
    }

    /// Bytes committed by the sender.
    ///
    /// # Safety
    ///
    /// The caller must have claimed the fragment (dequeued it or allocated
    /// it) so no producer is still writing the payload.
    pub unsafe fn payload(&self) -> &[u8] {
        let len = (self.payload_len.load(Ordering::Relaxed) as usize).min(self.capacity as usize);
        std::slice::from_raw_parts(self.payload_ptr(), len)
    }
}

/// Exclusive in-process handle to one carved fragment slot.
///
/// Holding a `FragmentRef` means this process may write the payload. It is
/// consumed when the fragment is enqueued or put back on a free list, and it
/// keeps the owning segment mapped until then.
pub struct FragmentRef {
    segment: Arc<SharedSegment>,
    header: NonNull<FragmentHeader>,
    slot: u32,
    class: SizeClass,
    capacity: usize,
}

// SAFETY: a FragmentRef is the unique owner of its slot until it is handed to
// a FIFO or free list.
unsafe impl Send for FragmentRef {}

impl fmt::Debug for FragmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentRef")
            .field("rank", &self.segment.rank())
            .field("slot", &self.slot)
            .field("class", &self.class)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl FragmentRef {
    /// `class` and `capacity` come from the local descriptor table, never
    /// from the shared header.
    ///
    /// # Safety
    ///
    /// `header` must point at an initialized slot of `capacity` payload bytes
    /// inside `segment` that nothing else holds.
    pub(crate) unsafe fn new(
        segment: Arc<SharedSegment>,
        header: NonNull<FragmentHeader>,
        slot: u32,
        class: SizeClass,
        capacity: usize,
    ) -> Self {
        Self {
            segment,
            header,
            slot,
            class,
            capacity,
        }
    }

    pub fn header(&self) -> &FragmentHeader {
        // SAFETY: the header outlives this handle and is only mutated through atomics.
        unsafe { self.header.as_ref() }
    }

    pub fn header_ptr(&self) -> *const u8 {
        self.header.as_ptr() as *const u8
    }

    pub(crate) fn header_nonnull(&self) -> NonNull<FragmentHeader> {
        self.header
    }

    pub(crate) fn segment(&self) -> &Arc<SharedSegment> {
        &self.segment
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn class(&self) -> SizeClass {
        self.class
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn src_rank(&self) -> u32 {
        self.header().src_rank
    }

    pub fn len(&self) -> usize {
        (self.header().payload_len.load(Ordering::Relaxed) as usize).min(self.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn payload(&self) -> &[u8] {
        // SAFETY: this handle owns the slot and len() is bounded by capacity.
        unsafe { std::slice::from_raw_parts(self.header().payload_ptr(), self.len()) }
    }

    /// The whole payload area, `capacity()` bytes.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        // SAFETY: this handle owns the slot and the area lies within it.
        unsafe { std::slice::from_raw_parts_mut(self.header().payload_ptr(), self.capacity) }
    }

    pub fn set_len(&mut self, len: usize) -> Result<()> {
        if len > self.capacity {
            return Err(Error::PayloadTooLarge {
                len,
                capacity: self.capacity,
            });
        }
        self.header().payload_len.store(len as u32, Ordering::Relaxed);
        Ok(())
    }

    /// Copies `bytes` into the payload and sets the length.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.capacity {
            return Err(Error::PayloadTooLarge {
                len: bytes.len(),
                capacity: self.capacity,
            });
        }
        self.payload_mut()[..bytes.len()].copy_from_slice(bytes);
        self.set_len(bytes.len())
    }

    pub(crate) fn set_flags(&self, flags: u16) {
        self.header().flags.store(flags, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};

    #[test]
    fn header_size_and_alignment() {
        assert_eq!(size_of::<FragmentHeader>(), FRAGMENT_HEADER_SIZE);
        assert_eq!(align_of::<FragmentHeader>(), FRAGMENT_ALIGN);
    }

    #[test]
    fn slot_size_rounds_to_cache_lines() {
        assert_eq!(slot_size(1), Some(128));
        assert_eq!(slot_size(64), Some(128));
        assert_eq!(slot_size(65), Some(192));
        assert_eq!(slot_size(192), Some(256));
    }

    #[test]
    fn slot_size_rejects_unrepresentable_capacity() {
        assert!(slot_size(MAX_FRAGMENT_CAPACITY).is_some());
        assert_eq!(slot_size(MAX_FRAGMENT_CAPACITY + 1), None);
        assert_eq!(slot_size(usize::MAX), None);
        assert_eq!(slot_size(usize::MAX - FRAGMENT_HEADER_SIZE), None);
    }

    #[test]
    fn classes_map_back_from_capacity() {
        let classes = SizeClassConfig::default();
        for class in SizeClass::ALL {
            let capacity = class.capacity(&classes);
            assert_eq!(SizeClass::from_capacity(&classes, capacity), Some(class));
        }
        assert_eq!(SizeClass::from_capacity(&classes, 3), None);
    }

    #[test]
    fn smallest_fitting_class() {
        let classes = SizeClassConfig {
            user: 100,
            eager: 1000,
            max_send: 10_000,
        };
        assert_eq!(SizeClass::for_payload(&classes, 0), Some(SizeClass::User));
        assert_eq!(SizeClass::for_payload(&classes, 100), Some(SizeClass::User));
        assert_eq!(SizeClass::for_payload(&classes, 101), Some(SizeClass::Eager));
        assert_eq!(SizeClass::for_payload(&classes, 10_000), Some(SizeClass::MaxSend));
        assert_eq!(SizeClass::for_payload(&classes, 10_001), None);
    }
}
