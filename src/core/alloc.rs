use std::ptr::NonNull;
use std::sync::Arc;

use crate::core::config::SizeClassConfig;
use crate::core::fragment::{slot_size, FragmentHeader, FragmentRef, SizeClass};
use crate::core::segment::SharedSegment;
use crate::core::{Error, Result};

/// Where a carved slot lives. Indexed by the header's `slot` field; only
/// meaningful inside the process that carved it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotDescriptor {
    pub class: SizeClass,
    /// Byte offset of the header from the segment base.
    pub offset: usize,
    pub capacity: u32,
}

/// Carves fixed-size fragment slots out of a segment's arena.
///
/// The allocator only constructs slots; reuse is handled by
/// [`FragmentPool`](crate::core::pool::FragmentPool). The arena cursor lives
/// in the segment header and is advanced atomically, so several processes may
/// carve from the same arena.
pub struct FragmentAllocator {
    segment: Arc<SharedSegment>,
    classes: SizeClassConfig,
    rank: u32,
    slots: Vec<SlotDescriptor>,
}

impl FragmentAllocator {
    /// `rank` is recorded as the source of every fragment carved here.
    pub fn new(segment: Arc<SharedSegment>, classes: SizeClassConfig, rank: u32) -> Result<Self> {
        classes.validate()?;
        Ok(Self {
            segment,
            classes,
            rank,
            slots: Vec::new(),
        })
    }

    /// Carves one slot of `class`. Fails with `ResourceExhausted` once the
    /// arena cannot hold another slot of that size; the arena is unchanged
    /// in that case and smaller classes may still succeed.
    pub fn alloc(&mut self, class: SizeClass) -> Result<FragmentRef> {
        let capacity = class.capacity(&self.classes);
        let size = slot_size(capacity)
            .ok_or(Error::InvalidConfig("size class capacity exceeds fragment limit"))?;
        let capacity = u32::try_from(capacity)
            .map_err(|_| Error::InvalidConfig("size class capacity exceeds fragment limit"))?;
        let Some(offset) = self.segment.reserve(size) else {
            log::warn!(
                "fragment arena of rank {} exhausted for {:?} ({} bytes left)",
                self.segment.rank(),
                class,
                self.segment.arena_remaining()
            );
            return Err(Error::ResourceExhausted { class });
        };
        let slot = u32::try_from(self.slots.len())
            .map_err(|_| Error::Unsupported("slot table overflow"))?;

        // SAFETY: `reserve` handed out [offset, offset + size) exclusively and
        // it lies inside the mapping; offsets stay 64-byte aligned.
        let header = unsafe {
            let ptr = self.segment.base_ptr().add(offset) as *mut FragmentHeader;
            FragmentHeader::init(ptr, self.rank, slot, class, capacity);
            NonNull::new_unchecked(ptr)
        };
        self.slots.push(SlotDescriptor {
            class,
            offset,
            capacity,
        });
        // SAFETY: freshly initialized and owned by nobody else.
        Ok(unsafe {
            FragmentRef::new(
                Arc::clone(&self.segment),
                header,
                slot,
                class,
                capacity as usize,
            )
        })
    }

    pub fn descriptor(&self, slot: u32) -> Option<&SlotDescriptor> {
        self.slots.get(slot as usize)
    }

    pub(crate) fn segment(&self) -> &Arc<SharedSegment> {
        &self.segment
    }

    pub fn slots_allocated(&self) -> usize {
        self.slots.len()
    }

    pub fn capacity_remaining(&self) -> usize {
        self.segment.arena_remaining()
    }

    /// How many more slots of `class` the arena can hold right now.
    pub fn slots_available(&self, class: SizeClass) -> usize {
        slot_size(class.capacity(&self.classes)).map_or(0, |size| self.capacity_remaining() / size)
    }

    pub fn classes(&self) -> &SizeClassConfig {
        &self.classes
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fragment::FRAGMENT_HEADER_SIZE;
    use crate::core::relative::FIFO_FREE;
    use crate::core::segment::DATA_OFFSET;
    use std::sync::atomic::Ordering;

    fn classes() -> SizeClassConfig {
        SizeClassConfig {
            user: 64,
            eager: 448,
            max_send: 960,
        }
    }

    #[test]
    fn exhaustion_boundary() {
        const M: usize = 7;
        let dir = tempfile::tempdir().expect("tempdir");
        let segment = Arc::new(
            SharedSegment::create(dir.path(), 0, DATA_OFFSET + M * 512, true).expect("segment"),
        );
        let mut alloc = FragmentAllocator::new(segment, classes(), 0).expect("allocator");
        assert_eq!(alloc.slots_available(SizeClass::Eager), M);

        let mut starts = Vec::new();
        for _ in 0..M {
            let frag = alloc.alloc(SizeClass::Eager).expect("slot");
            starts.push(frag.header_ptr() as usize);
        }
        assert!(matches!(
            alloc.alloc(SizeClass::Eager),
            Err(Error::ResourceExhausted { class: SizeClass::Eager })
        ));
        assert_eq!(alloc.capacity_remaining(), 0);
        for pair in starts.windows(2) {
            assert!(pair[1] >= pair[0] + 512, "slots overlap");
        }
        assert_eq!(alloc.slots_allocated(), M);
    }

    #[test]
    fn exhausted_class_leaves_room_for_smaller() {
        let dir = tempfile::tempdir().expect("tempdir");
        let segment = Arc::new(
            SharedSegment::create(dir.path(), 0, DATA_OFFSET + 1024 + 128, true).expect("segment"),
        );
        let mut alloc = FragmentAllocator::new(segment, classes(), 0).expect("allocator");
        alloc.alloc(SizeClass::MaxSend).expect("max send");
        assert!(matches!(
            alloc.alloc(SizeClass::MaxSend),
            Err(Error::ResourceExhausted { .. })
        ));
        alloc.alloc(SizeClass::User).expect("user slot still fits");
        assert!(alloc.alloc(SizeClass::User).is_err());
    }

    #[test]
    fn header_is_initialized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let segment = Arc::new(SharedSegment::create(dir.path(), 3, 64 * 1024, true).expect("segment"));
        let base = segment.base_ptr() as usize;
        let mut alloc = FragmentAllocator::new(segment, classes(), 3).expect("allocator");
        alloc.alloc(SizeClass::User).expect("first");
        let mut frag = alloc.alloc(SizeClass::Eager).expect("second");

        let header = frag.header();
        assert_eq!(header.next.load(Ordering::Acquire), FIFO_FREE);
        assert_eq!(header.src_rank, 3);
        assert_eq!(header.slot, 1);
        assert_eq!(header.flags(), 0);
        assert_eq!(header.class(), Some(SizeClass::Eager));
        assert_eq!(frag.capacity(), 448);
        assert!(frag.is_empty());

        let descriptor = alloc.descriptor(1).expect("descriptor");
        assert_eq!(descriptor.offset, frag.header_ptr() as usize - base);
        assert_eq!(descriptor.offset, DATA_OFFSET + 128);
        assert_eq!(descriptor.capacity, 448);
        assert_eq!(descriptor.class, SizeClass::Eager);
        let header_addr = frag.header_ptr() as usize;
        assert_eq!(
            frag.payload_mut().as_ptr() as usize,
            header_addr + FRAGMENT_HEADER_SIZE
        );
    }

    #[test]
    fn fragment_keeps_segment_mapped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let segment = Arc::new(SharedSegment::create(dir.path(), 0, 64 * 1024, true).expect("segment"));
        let mut alloc = FragmentAllocator::new(segment, classes(), 0).expect("allocator");
        let mut frag = alloc.alloc(SizeClass::Eager).expect("slot");
        drop(alloc);
        frag.write(b"still mapped").expect("write");
        assert_eq!(frag.payload(), b"still mapped");
    }

    #[test]
    fn rejects_huge_classes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let segment = Arc::new(SharedSegment::create(dir.path(), 0, 64 * 1024, true).expect("segment"));
        let huge = SizeClassConfig {
            user: 64,
            eager: usize::MAX,
            max_send: 960,
        };
        assert!(matches!(
            FragmentAllocator::new(segment, huge, 0),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_duplicate_classes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let segment = Arc::new(SharedSegment::create(dir.path(), 0, 64 * 1024, true).expect("segment"));
        let dup = SizeClassConfig {
            user: 64,
            eager: 64,
            max_send: 960,
        };
        assert!(matches!(
            FragmentAllocator::new(segment, dup, 0),
            Err(Error::InvalidConfig(_))
        ));
    }
}
