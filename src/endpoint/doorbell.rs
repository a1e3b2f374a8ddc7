use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::core::config::WaitStrategy;
use crate::core::segment::DoorbellBlock;
use crate::core::Result;

/// Wake-up channel for a consumer that went idle on its own queue. The FIFO
/// itself never blocks; producers ring after enqueueing.
pub struct Doorbell<'a> {
    block: &'a DoorbellBlock,
}

impl<'a> Doorbell<'a> {
    pub fn new(block: &'a DoorbellBlock) -> Self {
        Self { block }
    }

    pub fn ring(&self) -> Result<()> {
        self.block.notify_seq.fetch_add(1, Ordering::SeqCst);
        if self.block.waiters_pending.load(Ordering::SeqCst) > 0 {
            wake_all(&self.block.notify_seq)?;
        }
        Ok(())
    }

    /// Waits until `ready` holds, a ring arrives, or `timeout` passes.
    /// May return early; callers poll their queue afterwards either way.
    /// Time spent spinning counts against `timeout`.
    pub fn wait(
        &self,
        strategy: WaitStrategy,
        timeout: Option<Duration>,
        ready: impl Fn() -> bool,
    ) -> Result<()> {
        let start = quanta::Instant::now();
        match strategy {
            WaitStrategy::BusyPoll { interval_us } => {
                if !ready() {
                    let interval = Duration::from_micros(interval_us);
                    std::thread::sleep(timeout.map_or(interval, |t| t.min(interval)));
                }
                return Ok(());
            }
            WaitStrategy::Hybrid { spin_us } => {
                let spin = Duration::from_micros(spin_us as u64);
                let spin_deadline = start + timeout.map_or(spin, |t| t.min(spin));
                while quanta::Instant::now() < spin_deadline {
                    if ready() {
                        return Ok(());
                    }
                    std::hint::spin_loop();
                }
            }
        }

        let remaining = match timeout {
            Some(timeout) => {
                let left = timeout.saturating_sub(quanta::Instant::now().duration_since(start));
                if left.is_zero() {
                    return Ok(());
                }
                Some(left)
            }
            None => None,
        };

        self.block.waiters_pending.fetch_add(1, Ordering::SeqCst);
        let seq = self.block.notify_seq.load(Ordering::SeqCst);
        let res = if ready() {
            Ok(())
        } else {
            park(&self.block.notify_seq, seq, remaining)
        };
        self.block.waiters_pending.fetch_sub(1, Ordering::SeqCst);
        res
    }
}

/// Sleeps on `word` while it still reads `seen`. The word sits in a shared
/// file mapping, so the futex is process-shared (no `FUTEX_PRIVATE_FLAG`).
#[cfg(target_os = "linux")]
fn park(word: &AtomicU32, seen: u32, timeout: Option<Duration>) -> Result<()> {
    let ts = timeout.map(|t| libc::timespec {
        tv_sec: t.as_secs() as libc::time_t,
        tv_nsec: t.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts.as_ref().map_or(std::ptr::null(), |ts| ts as *const libc::timespec);
    match futex(word, libc::FUTEX_WAIT, seen, ts_ptr) {
        Ok(_) => Ok(()),
        // Spurious wakeups, a changed word and timeouts all mean "re-check".
        Err(err) => match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) | Some(libc::ETIMEDOUT) => Ok(()),
            _ => Err(err.into()),
        },
    }
}

#[cfg(target_os = "linux")]
fn wake_all(word: &AtomicU32) -> Result<()> {
    futex(word, libc::FUTEX_WAKE, i32::MAX as u32, std::ptr::null())?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn futex(
    word: &AtomicU32,
    op: libc::c_int,
    val: u32,
    timeout: *const libc::timespec,
) -> std::io::Result<libc::c_long> {
    // SAFETY: `word` is a live, aligned u32 for the duration of the call and
    // `timeout` is null or points at a timespec on the caller's stack.
    let res = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            op,
            val,
            timeout,
            std::ptr::null::<u32>(),
            0u32,
        )
    };
    if res < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(res)
    }
}

#[cfg(not(target_os = "linux"))]
fn park(_word: &AtomicU32, _seen: u32, timeout: Option<Duration>) -> Result<()> {
    let nap = Duration::from_millis(1);
    std::thread::sleep(timeout.map_or(nap, |t| t.min(nap)));
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn wake_all(_word: &AtomicU32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::segment::SharedSegment;

    #[test]
    fn hybrid_spin_counts_against_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let segment = SharedSegment::create(dir.path(), 0, 64 * 1024, true).expect("segment");
        let bell = Doorbell::new(segment.doorbell());
        let strategy = WaitStrategy::Hybrid { spin_us: 200_000 };

        let start = std::time::Instant::now();
        bell.wait(strategy, Some(Duration::from_millis(50)), || false)
            .expect("wait");
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(45), "returned after {waited:?}");
        assert!(waited < Duration::from_millis(150), "blocked for {waited:?}");
        assert_eq!(segment.doorbell().waiters_pending.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn ready_condition_skips_parking() {
        let dir = tempfile::tempdir().expect("tempdir");
        let segment = SharedSegment::create(dir.path(), 0, 64 * 1024, true).expect("segment");
        let bell = Doorbell::new(segment.doorbell());
        let start = std::time::Instant::now();
        bell.wait(WaitStrategy::Hybrid { spin_us: 0 }, None, || true)
            .expect("wait");
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn ring_wakes_parked_waiter() {
        use std::sync::Arc;

        let dir = tempfile::tempdir().expect("tempdir");
        let segment =
            Arc::new(SharedSegment::create(dir.path(), 0, 64 * 1024, true).expect("segment"));
        let waiter = {
            let segment = Arc::clone(&segment);
            std::thread::spawn(move || {
                let start = std::time::Instant::now();
                Doorbell::new(segment.doorbell())
                    .wait(
                        WaitStrategy::Hybrid { spin_us: 0 },
                        Some(Duration::from_secs(5)),
                        || false,
                    )
                    .expect("wait");
                start.elapsed()
            })
        };
        while segment.doorbell().waiters_pending.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        // The waiter may still be between registering and reading the
        // sequence word, so keep ringing until it is gone.
        while !waiter.is_finished() {
            Doorbell::new(segment.doorbell()).ring().expect("ring");
            std::thread::sleep(Duration::from_millis(1));
        }
        let waited = waiter.join().expect("join");
        assert!(waited < Duration::from_secs(5), "waiter slept through ring");
    }
}
