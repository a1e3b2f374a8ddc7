use std::sync::Arc;

use courier::core::fifo::Fifo;
use courier::core::relative::{Resolver, SegmentMap};
use courier::core::segment::{SharedSegment, DATA_OFFSET, FIFO_OFFSET};
use courier::core::{FragmentAllocator, SizeClass, SizeClassConfig};
use tempfile::tempdir;

const SEGMENT_SIZE: usize = 256 * 1024;

fn map_for(segment: &SharedSegment) -> SegmentMap {
    let mut map = SegmentMap::new(segment.rank());
    unsafe { map.register(segment.rank(), segment.base_ptr(), segment.len()) };
    map
}

#[test]
fn offsets_survive_a_second_mapping() {
    let dir = tempdir().expect("tempdir");
    let owner = SharedSegment::create(dir.path(), 0, SEGMENT_SIZE, true).expect("create");
    let other = SharedSegment::attach(dir.path(), 0).expect("attach");
    assert_ne!(owner.base_ptr(), other.base_ptr());

    let map_a = map_for(&owner);
    let map_b = map_for(&other);

    for local in [0usize, FIFO_OFFSET, DATA_OFFSET, 4096 + 17, SEGMENT_SIZE - 1] {
        let ptr = unsafe { owner.base_ptr().add(local) };
        let rel = map_a.to_relative(ptr);
        assert_eq!(rel.offset() as usize, local);
        assert_eq!(map_a.to_virtual(rel), ptr);
        assert_eq!(map_b.to_virtual(rel), unsafe { other.base_ptr().add(local) });
    }
}

#[test]
fn fifo_crosses_mappings() {
    let dir = tempdir().expect("tempdir");
    let owner = Arc::new(SharedSegment::create(dir.path(), 2, SEGMENT_SIZE, true).expect("create"));
    let other = SharedSegment::attach(dir.path(), 2).expect("attach");
    let map_a = map_for(&owner);
    let map_b = map_for(&other);

    let mut alloc =
        FragmentAllocator::new(Arc::clone(&owner), SizeClassConfig::default(), 2).expect("allocator");
    let producer = Fifo::new(owner.fifo_control(), &map_a);
    for i in 0..16u32 {
        let mut fragment = alloc.alloc(SizeClass::User).expect("alloc");
        fragment.write(&i.to_le_bytes()).expect("write");
        producer.enqueue(map_a.to_relative(fragment.header_ptr()));
    }

    let consumer = Fifo::new(other.fifo_control(), &map_b);
    for i in 0..16u32 {
        let offset = consumer.dequeue().expect("fragment");
        let header = unsafe { map_b.resolve(offset).as_ref() };
        assert_eq!(header.src_rank, 2);
        assert_eq!(unsafe { header.payload() }, &i.to_le_bytes());
    }
    assert_eq!(consumer.dequeue(), None);
    assert!(producer.is_empty());
}
