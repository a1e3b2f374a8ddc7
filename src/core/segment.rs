//! Per-rank shared segment.
//!
//! ```text
//!   0 ┌──────────────────────────┐
//!     │ SegmentHeader            │ magic, version, rank, arena cursor
//! 128 ├──────────────────────────┤
//!     │ FifoControl              │ head / tail (inbound queue)
//! 256 ├──────────────────────────┤
//!     │ DoorbellBlock            │ futex words for idle consumers
//! 384 ├──────────────────────────┤
//!     │ fragment arena           │ fixed-size slots, carved upwards
//!     └──────────────────────────┘
//! ```
//!
//! The owning rank creates and initializes the file, then publishes it with a
//! rename so attachers never map a half-written header.

use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::core::fifo::FifoControl;
use crate::core::mmap::MmapFile;
use crate::core::relative::MAX_RANK;
use crate::core::{Error, Result};

pub const SEG_MAGIC: u32 = 0x4352_5352; // 'CRSR'
pub const SEG_VERSION: u32 = 1;

pub const FIFO_OFFSET: usize = 128;
pub const DOORBELL_OFFSET: usize = 256;
pub const DATA_OFFSET: usize = 384;
pub const MAX_SEGMENT_SIZE: usize = u32::MAX as usize;

const INIT_STATE_WRITING: u32 = 1;
const INIT_STATE_READY: u32 = 2;

#[repr(C, align(128))]
pub struct SegmentHeader {
    pub magic: AtomicU32,
    pub version: AtomicU32,
    pub init_state: AtomicU32,
    pub rank: AtomicU32,
    pub segment_size: AtomicU64,
    pub data_offset: AtomicU64,
    /// Next free byte of the fragment arena.
    pub alloc_cursor: AtomicU64,
    pub owner_pid: AtomicU32,
    pub _pad: [u8; 84],
}

/// Wake-up words for a consumer parked on its own queue.
#[repr(C, align(128))]
pub struct DoorbellBlock {
    pub notify_seq: AtomicU32,
    pub waiters_pending: AtomicU32,
    pub _pad: [u8; 120],
}

pub fn segment_filename(rank: u32) -> String {
    format!("{:06}.seg", rank)
}

pub fn segment_path(dir: &Path, rank: u32) -> PathBuf {
    dir.join(segment_filename(rank))
}

pub struct SharedSegment {
    mmap: MmapFile,
    rank: u32,
    owner: bool,
    unlink_on_drop: bool,
}

// SAFETY: all shared state in the mapping is accessed through atomics.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Creates and publishes `rank`'s segment under `dir`, replacing any
    /// stale file left by an earlier run.
    pub fn create(dir: &Path, rank: u32, segment_size: usize, unlink_on_drop: bool) -> Result<Self> {
        if rank > MAX_RANK {
            return Err(Error::InvalidConfig("rank exceeds relative addressing range"));
        }
        if segment_size <= DATA_OFFSET || segment_size > MAX_SEGMENT_SIZE {
            return Err(Error::InvalidConfig("segment size out of range"));
        }
        std::fs::create_dir_all(dir)?;
        let path = segment_path(dir, rank);
        let tmp_path = path.with_extension("seg.tmp");
        let mut mmap = MmapFile::create(&tmp_path, segment_size)?;
        mmap.as_mut_slice()[..DATA_OFFSET].fill(0);

        let mut segment = Self {
            mmap,
            rank,
            owner: true,
            unlink_on_drop,
        };
        let header = segment.header();
        header.init_state.store(INIT_STATE_WRITING, Ordering::Relaxed);
        header.version.store(SEG_VERSION, Ordering::Relaxed);
        header.rank.store(rank, Ordering::Relaxed);
        header.segment_size.store(segment_size as u64, Ordering::Relaxed);
        header.data_offset.store(DATA_OFFSET as u64, Ordering::Relaxed);
        header.alloc_cursor.store(DATA_OFFSET as u64, Ordering::Relaxed);
        header.owner_pid.store(std::process::id(), Ordering::Relaxed);
        segment.fifo_control().init();
        header.magic.store(SEG_MAGIC, Ordering::Relaxed);
        header.init_state.store(INIT_STATE_READY, Ordering::Release);

        segment.mmap.rename(&path)?;
        log::debug!(
            "created segment rank={} size={} path={}",
            rank,
            segment_size,
            path.display()
        );
        Ok(segment)
    }

    /// Maps an existing segment owned by `rank`.
    pub fn attach(dir: &Path, rank: u32) -> Result<Self> {
        let path = segment_path(dir, rank);
        let mmap = MmapFile::open(&path)?;
        if mmap.len() <= DATA_OFFSET {
            return Err(Error::CorruptMetadata("segment too small"));
        }
        let segment = Self {
            mmap,
            rank,
            owner: false,
            unlink_on_drop: false,
        };
        segment.wait_ready()?;
        if !segment.owner_alive() {
            log::warn!(
                "segment {} belongs to pid {} which is no longer running",
                path.display(),
                segment.owner_pid()
            );
        }
        log::debug!("attached segment rank={} path={}", rank, path.display());
        Ok(segment)
    }

    fn wait_ready(&self) -> Result<()> {
        let header = self.header();
        while header.init_state.load(Ordering::Acquire) != INIT_STATE_READY {
            std::thread::yield_now();
        }
        if header.magic.load(Ordering::Acquire) != SEG_MAGIC {
            return Err(Error::CorruptMetadata("segment magic mismatch"));
        }
        let version = header.version.load(Ordering::Acquire);
        if version != SEG_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        if header.rank.load(Ordering::Acquire) != self.rank {
            return Err(Error::CorruptMetadata("segment rank mismatch"));
        }
        if header.segment_size.load(Ordering::Acquire) != self.mmap.len() as u64 {
            return Err(Error::CorruptMetadata("segment size mismatch"));
        }
        if header.data_offset.load(Ordering::Acquire) != DATA_OFFSET as u64 {
            return Err(Error::CorruptMetadata("segment data offset mismatch"));
        }
        Ok(())
    }

    pub fn header(&self) -> &SegmentHeader {
        // SAFETY: the mapping is page aligned and larger than DATA_OFFSET.
        unsafe { &*(self.mmap.base_ptr() as *const SegmentHeader) }
    }

    pub fn fifo_control(&self) -> &FifoControl {
        // SAFETY: FIFO_OFFSET is 128-byte aligned and inside the control region.
        unsafe { &*(self.mmap.base_ptr().add(FIFO_OFFSET) as *const FifoControl) }
    }

    pub fn doorbell(&self) -> &DoorbellBlock {
        // SAFETY: DOORBELL_OFFSET is 128-byte aligned and inside the control region.
        unsafe { &*(self.mmap.base_ptr().add(DOORBELL_OFFSET) as *const DoorbellBlock) }
    }

    pub fn base_ptr(&self) -> *mut u8 {
        self.mmap.base_ptr()
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn path(&self) -> &Path {
        self.mmap.path()
    }

    pub fn lock(&self) -> Result<()> {
        self.mmap.lock()
    }

    /// Pid of the process that created the segment.
    pub fn owner_pid(&self) -> u32 {
        self.header().owner_pid.load(Ordering::Acquire)
    }

    /// Whether the creating process still exists. A dead owner means nobody
    /// drains this segment's queue any more.
    #[cfg(unix)]
    pub fn owner_alive(&self) -> bool {
        let Ok(pid) = libc::pid_t::try_from(self.owner_pid()) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // SAFETY: signal 0 only checks that the pid can be addressed.
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
    }

    #[cfg(not(unix))]
    pub fn owner_alive(&self) -> bool {
        true
    }

    /// Claims `len` bytes of the arena. Returns the segment offset of the
    /// claimed range, or `None` if the arena cannot hold it; the cursor is
    /// left untouched on failure.
    pub fn reserve(&self, len: usize) -> Option<usize> {
        let limit = self.len() as u64;
        self.header()
            .alloc_cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cursor| {
                cursor.checked_add(len as u64).filter(|end| *end <= limit)
            })
            .ok()
            .map(|start| start as usize)
    }

    pub fn arena_remaining(&self) -> usize {
        let cursor = self.header().alloc_cursor.load(Ordering::Acquire) as usize;
        self.len().saturating_sub(cursor)
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if self.owner && self.unlink_on_drop {
            if let Err(err) = std::fs::remove_file(self.mmap.path()) {
                log::warn!("failed to remove segment {}: {err}", self.mmap.path().display());
            }
        }
    }
}

const _: () = assert!(size_of::<SegmentHeader>() == FIFO_OFFSET);
const _: () = assert!(size_of::<FifoControl>() == DOORBELL_OFFSET - FIFO_OFFSET);
const _: () = assert!(size_of::<DoorbellBlock>() == DATA_OFFSET - DOORBELL_OFFSET);
