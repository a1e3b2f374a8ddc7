//! Per-class free lists that recycle fragment slots.
//!
//! Slots are never returned to the arena. A fragment that has been consumed
//! goes back on the free list of its size class. The class is read from the
//! allocator's descriptor table; header bytes in shared memory are only used
//! to find the descriptor and are rewritten from it.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::core::alloc::FragmentAllocator;
use crate::core::error::fatal;
use crate::core::fragment::{FragmentHeader, FragmentRef, SizeClass};
use crate::core::{Error, Result};

pub struct FragmentPool {
    allocator: FragmentAllocator,
    free: [Vec<FragmentRef>; 3],
    grow_batch: usize,
}

impl FragmentPool {
    pub fn new(allocator: FragmentAllocator, grow_batch: usize) -> Self {
        Self {
            allocator,
            free: [Vec::new(), Vec::new(), Vec::new()],
            grow_batch: grow_batch.max(1),
        }
    }

    /// Takes a fragment of `class`, carving up to `grow_batch` new slots when
    /// the free list is empty.
    pub fn get(&mut self, class: SizeClass) -> Result<FragmentRef> {
        if let Some(fragment) = self.free[class.index()].pop() {
            return Ok(fragment);
        }
        let fragment = self.allocator.alloc(class)?;
        let mut grown = 1;
        while grown < self.grow_batch {
            match self.allocator.alloc(class) {
                Ok(extra) => self.free[class.index()].push(extra),
                Err(Error::ResourceExhausted { .. }) => break,
                Err(err) => return Err(err),
            }
            grown += 1;
        }
        log::debug!(
            "grew {:?} free list by {} slots ({} allocated)",
            class,
            grown,
            self.allocator.slots_allocated()
        );
        Ok(fragment)
    }

    /// Tries `classes` in order and returns the first fragment available.
    /// Cross-class fallback only happens through this call.
    pub fn get_fallback(&mut self, classes: &[SizeClass]) -> Result<FragmentRef> {
        let mut last = Error::Unsupported("no size class requested");
        for &class in classes {
            match self.get(class) {
                Ok(fragment) => return Ok(fragment),
                Err(err @ Error::ResourceExhausted { .. }) => last = err,
                Err(err) => return Err(err),
            }
        }
        Err(last)
    }

    /// Returns a consumed fragment to the free list of its class.
    pub fn put(&mut self, fragment: FragmentRef) -> Result<()> {
        if !Arc::ptr_eq(fragment.segment(), self.allocator.segment()) {
            return Err(Error::Unsupported("fragment belongs to another rank"));
        }
        // SAFETY: the handle proves the slot is ours and unshared.
        unsafe { self.recycle(fragment.header_nonnull()) }
    }

    /// Puts the slot at `header` back on its free list. The slot is located
    /// through the header's `slot` index and must match the descriptor
    /// recorded when it was carved; class and capacity come from that
    /// descriptor and the header is rewritten from it.
    ///
    /// # Safety
    ///
    /// Nothing else in this process may still reference the slot.
    pub(crate) unsafe fn recycle(&mut self, header: NonNull<FragmentHeader>) -> Result<()> {
        let segment = Arc::clone(self.allocator.segment());
        let base = segment.base_ptr() as usize;
        let addr = header.as_ptr() as usize;
        if addr < base || addr - base >= segment.len() {
            return Err(Error::Unsupported("fragment belongs to another rank"));
        }
        let offset = addr - base;
        let (slot, stored_class, stored_capacity) = {
            let h = header.as_ref();
            (h.slot, h.size_class, h.capacity)
        };
        let descriptor = match self.allocator.descriptor(slot) {
            Some(descriptor) if descriptor.offset == offset => *descriptor,
            _ => fatal!("fragment at offset {offset:#x} names slot {slot} that was never carved there"),
        };
        if stored_class != descriptor.class as u8 || stored_capacity != descriptor.capacity {
            log::warn!(
                "slot {} header says class {} capacity {}, restoring {:?} capacity {}",
                slot,
                stored_class,
                stored_capacity,
                descriptor.class,
                descriptor.capacity
            );
        }
        FragmentHeader::init(
            header.as_ptr(),
            self.allocator.rank(),
            slot,
            descriptor.class,
            descriptor.capacity,
        );
        self.free[descriptor.class.index()].push(FragmentRef::new(
            segment,
            header,
            slot,
            descriptor.class,
            descriptor.capacity as usize,
        ));
        Ok(())
    }

    pub fn free_count(&self, class: SizeClass) -> usize {
        self.free[class.index()].len()
    }

    pub fn allocator(&self) -> &FragmentAllocator {
        &self.allocator
    }
}
