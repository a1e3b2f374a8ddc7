//! Shared-memory building blocks: relative addressing, fragment slots and the
//! lock-free inbound FIFO.

pub mod alloc;
pub mod config;
pub mod error;
pub mod fifo;
pub mod fragment;
pub mod mmap;
pub mod pool;
pub mod relative;
pub mod segment;

pub use alloc::{FragmentAllocator, SlotDescriptor};
pub use config::{NodeConfig, SizeClassConfig, WaitStrategy};
pub use error::{Error, Result};
pub use fifo::{Fifo, FifoControl};
pub use fragment::{FragmentHeader, FragmentRef, SizeClass};
pub use pool::FragmentPool;
pub use relative::{RelativeOffset, Resolver, SegmentMap, FIFO_FREE};
pub use segment::SharedSegment;
