//! Node-local endpoints.
//!
//! A [`LocalNode`] is one rank's context: it owns that rank's segment (the
//! inbound FIFO plus the fragment arena) and holds read/write mappings of the
//! peers it talks to. All ranks that may appear on a queue this node touches
//! must be attached before traffic starts: producers follow the previous
//! tail's link, which can live in any sender's segment.
//!
//! # Example
//!
//! ```no_run
//! use courier::core::NodeConfig;
//! use courier::endpoint::LocalNode;
//!
//! let dir = std::path::Path::new("/dev/shm/job-42");
//! let mut node = LocalNode::create(dir, 0, NodeConfig::default())?;
//! node.attach_peer(1)?;
//!
//! node.send(1, b"hello")?;
//! loop {
//!     while let Some(msg) = node.read_own_queue() {
//!         println!("from {}: {:?}", msg.src_rank(), msg.payload());
//!         node.release(msg)?;
//!     }
//!     node.wait(None)?;
//! }
//! # Ok::<(), courier::Error>(())
//! ```

mod doorbell;

pub use doorbell::Doorbell;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::core::alloc::FragmentAllocator;
use crate::core::config::NodeConfig;
use crate::core::error::fatal;
use crate::core::fifo::Fifo;
use crate::core::fragment::{
    FragmentHeader, FragmentRef, SizeClass, FLAG_RETURNED, FRAGMENT_HEADER_SIZE,
};
use crate::core::pool::FragmentPool;
use crate::core::relative::{RelativeOffset, Resolver, SegmentMap};
use crate::core::segment::SharedSegment;
use crate::core::{Error, Result};

/// A fragment taken off this node's inbound queue.
///
/// Keeps the segment holding its pages mapped, so it stays readable even if
/// the node or the peer handle goes away first. Hand it back with
/// [`LocalNode::release`] once the payload has been consumed.
pub struct Received {
    segment: Arc<SharedSegment>,
    header: NonNull<FragmentHeader>,
    offset: RelativeOffset,
}

// SAFETY: the consumer owns a dequeued fragment exclusively.
unsafe impl Send for Received {}

impl fmt::Debug for Received {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Received")
            .field("offset", &self.offset)
            .field("len", &self.payload().len())
            .finish()
    }
}

impl Received {
    fn header(&self) -> &FragmentHeader {
        // SAFETY: `segment` keeps the mapping alive; the consumer owns it now.
        unsafe { self.header.as_ref() }
    }

    /// Committed payload bytes, clipped to the slot's capacity and to the end
    /// of the mapping since both lengths live in peer-writable memory.
    pub fn payload(&self) -> &[u8] {
        let header = self.header();
        let start = self.offset.offset() as usize + FRAGMENT_HEADER_SIZE;
        let len = (header.payload_len.load(Ordering::Relaxed) as usize)
            .min(header.capacity as usize)
            .min(self.segment.len().saturating_sub(start));
        // SAFETY: dequeued, so the producer finished writing; the range lies
        // inside the mapping.
        unsafe { std::slice::from_raw_parts(self.segment.base_ptr().add(start), len) }
    }

    /// Rank that filled the fragment.
    pub fn src_rank(&self) -> u32 {
        self.header().src_rank
    }

    /// Rank whose segment holds the fragment's pages.
    pub fn owner_rank(&self) -> u32 {
        self.offset.rank()
    }

    pub fn offset(&self) -> RelativeOffset {
        self.offset
    }
}

struct Peer {
    segment: Arc<SharedSegment>,
}

pub struct LocalNode {
    dir: PathBuf,
    rank: u32,
    config: NodeConfig,
    segment: Arc<SharedSegment>,
    peers: HashMap<u32, Peer>,
    map: SegmentMap,
    pool: FragmentPool,
}

impl LocalNode {
    /// Creates this rank's segment under `dir` and an empty inbound queue.
    pub fn create(dir: impl AsRef<Path>, rank: u32, config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        let segment = Arc::new(SharedSegment::create(
            &dir,
            rank,
            config.segment_size,
            config.unlink_on_drop,
        )?);
        if config.lock_memory {
            segment.lock()?;
        }
        let mut map = SegmentMap::new(rank);
        // SAFETY: the segment is kept alive by `self.segment` for the life of
        // the map.
        unsafe { map.register(rank, segment.base_ptr(), segment.len()) };

        let allocator = FragmentAllocator::new(Arc::clone(&segment), config.size_classes, rank)?;
        let pool = FragmentPool::new(allocator, config.grow_batch);
        log::info!("node rank={} ready at {}", rank, dir.display());
        Ok(Self {
            dir,
            rank,
            config,
            segment,
            peers: HashMap::new(),
            map,
            pool,
        })
    }

    /// Maps `rank`'s segment for writing. Attaching twice is a no-op.
    pub fn attach_peer(&mut self, rank: u32) -> Result<()> {
        if rank == self.rank || self.peers.contains_key(&rank) {
            return Ok(());
        }
        let segment = Arc::new(SharedSegment::attach(&self.dir, rank)?);
        // SAFETY: the mapping is owned by `self.peers` until `detach_peer`,
        // which unregisters it first.
        unsafe { self.map.register(rank, segment.base_ptr(), segment.len()) };
        self.peers.insert(rank, Peer { segment });
        Ok(())
    }

    pub fn attach_peers(&mut self, ranks: impl IntoIterator<Item = u32>) -> Result<()> {
        for rank in ranks {
            self.attach_peer(rank)?;
        }
        Ok(())
    }

    /// Unmaps a peer. Nothing from that rank may still be queued anywhere
    /// this node will touch.
    pub fn detach_peer(&mut self, rank: u32) -> bool {
        match self.peers.remove(&rank) {
            Some(peer) => {
                self.map.unregister(rank);
                drop(peer);
                true
            }
            None => false,
        }
    }

    pub fn peer_ranks(&self) -> impl Iterator<Item = u32> + '_ {
        self.peers.keys().copied()
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn addresses(&self) -> &SegmentMap {
        &self.map
    }

    pub fn pool(&self) -> &FragmentPool {
        &self.pool
    }

    fn segment_for(&self, rank: u32) -> Result<&Arc<SharedSegment>> {
        if rank == self.rank {
            return Ok(&self.segment);
        }
        self.peers
            .get(&rank)
            .map(|peer| &peer.segment)
            .ok_or(Error::UnknownPeer(rank))
    }

    /// Takes an empty fragment of `class` from this node's arena.
    pub fn alloc(&mut self, class: SizeClass) -> Result<FragmentRef> {
        self.pool.get(class)
    }

    /// Returns an unsent fragment to the free list.
    pub fn free(&mut self, fragment: FragmentRef) -> Result<()> {
        self.pool.put(fragment)
    }

    /// Copies `payload` into the smallest fitting fragment and queues it on
    /// `peer`.
    pub fn send(&mut self, peer: u32, payload: &[u8]) -> Result<()> {
        let classes = *self.pool.allocator().classes();
        let class = SizeClass::for_payload(&classes, payload.len()).ok_or(
            Error::PayloadTooLarge {
                len: payload.len(),
                capacity: classes.max_send,
            },
        )?;
        let mut fragment = self.pool.get(class)?;
        fragment.write(payload)?;
        self.write_to_peer(peer, fragment)
    }

    /// Queues a fragment from this node's own arena on `peer`'s inbound FIFO.
    /// The offset is taken against this node's base: the pages are ours.
    pub fn write_to_peer(&mut self, peer: u32, fragment: FragmentRef) -> Result<()> {
        let target = match self.segment_for(peer) {
            Ok(target) => target,
            Err(err) => {
                self.pool.put(fragment)?;
                return Err(err);
            }
        };
        let offset = self.map.to_relative(fragment.header_ptr());
        fragment.set_flags(0);
        Fifo::new(target.fifo_control(), &self.map).enqueue(offset);
        Doorbell::new(target.doorbell()).ring()
    }

    /// Hands a fragment back to the rank whose pages it lives in. The offset
    /// is taken against that rank's base.
    fn write_back(&self, received: Received) -> Result<()> {
        let owner = received.owner_rank();
        let target = self.segment_for(owner)?;
        let header = received.header();
        let offset = self
            .map
            .to_relative_for_peer(owner, header as *const FragmentHeader as *const u8);
        header.flags.fetch_or(FLAG_RETURNED, Ordering::Relaxed);
        Fifo::new(target.fifo_control(), &self.map).enqueue(offset);
        Doorbell::new(target.doorbell()).ring()
    }

    /// Next fragment on this node's inbound queue, or `None` if nothing is
    /// ready. Own fragments coming back from peers are recycled here and
    /// never surface.
    pub fn read_own_queue(&mut self) -> Option<Received> {
        loop {
            let offset = Fifo::new(self.segment.fifo_control(), &self.map).dequeue()?;
            let header = self.map.resolve(offset);
            // SAFETY: just dequeued; this consumer owns the fragment.
            let flags = unsafe { header.as_ref() }.flags();
            if offset.rank() == self.rank && flags & FLAG_RETURNED != 0 {
                // SAFETY: an own slot that nobody else references any more.
                if let Err(err) = unsafe { self.pool.recycle(header) } {
                    log::error!("dropping returned fragment {offset:?}: {err}");
                }
                continue;
            }
            // resolve() already aborted if the owner rank is unmapped.
            let segment = match self.segment_for(offset.rank()) {
                Ok(segment) => Arc::clone(segment),
                Err(_) => fatal!("dequeued {offset:?} from an unattached rank"),
            };
            return Some(Received {
                segment,
                header,
                offset,
            });
        }
    }

    /// Gives a consumed fragment back: own fragments go to the free list,
    /// peer fragments travel back to their owner's queue.
    pub fn release(&mut self, received: Received) -> Result<()> {
        if received.owner_rank() == self.rank {
            // SAFETY: dequeued from our own queue and consumed.
            unsafe { self.pool.recycle(received.header) }
        } else {
            self.write_back(received)
        }
    }

    /// Parks until something may be waiting on the inbound queue.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let fifo = Fifo::new(self.segment.fifo_control(), &self.map);
        Doorbell::new(self.segment.doorbell()).wait(self.config.wait_strategy, timeout, || {
            !fifo.is_empty()
        })
    }

    /// Polls the inbound queue, waiting between polls, until a fragment
    /// arrives or `timeout` expires.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Received>> {
        let deadline = quanta::Instant::now() + timeout;
        loop {
            if let Some(received) = self.read_own_queue() {
                return Ok(Some(received));
            }
            let now = quanta::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.wait(Some(deadline.duration_since(now)))?;
        }
    }
}
