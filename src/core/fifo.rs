//! Lock-free multi-producer / single-consumer FIFO of fragment headers.
//!
//! The queue is an intrusive linked list threaded through
//! [`FragmentHeader::next`]. Both ends are relative offsets so the control
//! block can sit in shared memory mapped at different addresses by every
//! producer.
//!
//! # Protocol
//!
//! Producers swap themselves in as the new `tail` and then link the previous
//! tail to themselves (or publish themselves as `head` if the queue was
//! empty). Between those two steps the chain is broken: `tail` is reachable
//! only through a `next` that has not been written yet. The consumer detects
//! this when the node it just claimed has no successor but is no longer the
//! tail, and spins on that node's `next` until the producer finishes.
//!
//! ```text
//!            swap tail            link prev.next
//! producer ─────────────► (gap) ─────────────────► linked
//!
//! head ─► A ─► B ─╳  C ◄─ tail     consumer spins on B.next
//! ```
//!
//! Ordering between different producers is unspecified; each producer's own
//! enqueues are dequeued in the order they were made.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::core::error::fatal;
use crate::core::fragment::FragmentHeader;
use crate::core::relative::{RelativeOffset, Resolver, FIFO_FREE};

/// FIFO ends. Lives on its own 128-byte block so producers hammering `tail`
/// do not share a line with unrelated segment metadata.
#[repr(C, align(128))]
pub struct FifoControl {
    pub head: AtomicI64,
    pub tail: AtomicI64,
    pub _pad: [u8; 112],
}

impl FifoControl {
    /// An empty control block for queues hosted outside a segment.
    pub fn new() -> Self {
        Self {
            head: AtomicI64::new(FIFO_FREE),
            tail: AtomicI64::new(FIFO_FREE),
            _pad: [0u8; 112],
        }
    }

    /// Resets both ends to empty. Only valid before the queue is shared.
    pub fn init(&self) {
        self.head.store(FIFO_FREE, Ordering::Relaxed);
        self.tail.store(FIFO_FREE, Ordering::Release);
    }
}

impl Default for FifoControl {
    fn default() -> Self {
        Self::new()
    }
}

/// A view of a FIFO control block paired with the address table used to
/// reach the fragments linked through it.
pub struct Fifo<'a, R: Resolver + ?Sized> {
    control: &'a FifoControl,
    resolver: &'a R,
}

impl<'a, R: Resolver + ?Sized> Fifo<'a, R> {
    pub fn new(control: &'a FifoControl, resolver: &'a R) -> Self {
        Self { control, resolver }
    }

    /// Appends the fragment at `offset`. Safe to call from any number of
    /// producers at once.
    ///
    /// The fragment must not already be queued anywhere; its payload must be
    /// fully written before this call, which publishes it with release
    /// ordering.
    pub fn enqueue(&self, offset: RelativeOffset) {
        self.header(offset).store_next(FIFO_FREE);
        let prev = self.swap_tail(offset);
        self.link(prev, offset);
    }

    fn swap_tail(&self, offset: RelativeOffset) -> RelativeOffset {
        let prev = self.control.tail.swap(offset.raw(), Ordering::AcqRel);
        if prev == offset.raw() {
            fatal!("fifo: {offset:?} enqueued while already the tail");
        }
        RelativeOffset::from_raw(prev)
    }

    fn link(&self, prev: RelativeOffset, offset: RelativeOffset) {
        if prev.is_free() {
            self.control.head.store(offset.raw(), Ordering::Release);
        } else {
            self.header(prev).store_next(offset.raw());
        }
    }

    /// Removes the oldest linked fragment, or returns `None` when nothing is
    /// ready. Only one consumer may call this at a time.
    pub fn dequeue(&self) -> Option<RelativeOffset> {
        let value = self.control.head.swap(FIFO_FREE, Ordering::AcqRel);
        if value == FIFO_FREE {
            return None;
        }
        let candidate = RelativeOffset::from_raw(value);
        let header = self.header(candidate);

        let mut next = header.load_next();
        if next == value {
            fatal!("fifo: {candidate:?} links to itself");
        }
        if next == FIFO_FREE {
            if self
                .control
                .tail
                .compare_exchange(value, FIFO_FREE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(candidate);
            }
            // A producer already swapped in a new tail; wait for its link.
            loop {
                next = header.load_next();
                if next != FIFO_FREE {
                    break;
                }
                std::hint::spin_loop();
            }
        }
        self.control.head.store(next, Ordering::Release);
        Some(candidate)
    }

    pub fn head(&self) -> RelativeOffset {
        RelativeOffset::from_raw(self.control.head.load(Ordering::Acquire))
    }

    pub fn tail(&self) -> RelativeOffset {
        RelativeOffset::from_raw(self.control.tail.load(Ordering::Acquire))
    }

    /// Snapshot only; producers may be mid-enqueue.
    pub fn is_empty(&self) -> bool {
        self.head().is_free() && self.tail().is_free()
    }

    fn header(&self, offset: RelativeOffset) -> &FragmentHeader {
        let ptr: NonNull<FragmentHeader> = self.resolver.resolve(offset);
        // SAFETY: the resolver hands back an aligned header inside a live
        // mapping; shared fields are only touched through atomics.
        unsafe { ptr.as_ref() }
    }
}
