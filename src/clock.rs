//!
//! Clock / Scheduler
//! ------------------
//! A monotonic wall-clock source and a way to schedule a callback at an
//! absolute time, cancellable by token. `Store::ScheduleSave` and the WS
//! `Session`'s authentication timer are both built on this.
//!
//! Grounded on the background-ticker `tokio::spawn` loops in
//! `clarium::server::run_with_ports` (the KV sweeper, the GraphStore GC
//! ticker), generalized from fixed-interval loops into one-shot
//! absolute-time scheduling with cancellation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Notify;

/// Seconds since the Unix epoch, as an `f64` to match `spec.md`'s
/// `MinSaveInterval`/timeout fields which are expressed in fractional
/// seconds.
pub type Timestamp = f64;

/// Wall-clock time source. The OS wall clock itself is an out-of-scope
/// external collaborator (`spec.md` §1); this trait is the seam the rest
/// of the crate depends on so tests can substitute a controllable clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// The real OS wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}

/// Opaque cancellation handle for a scheduled callback. Dropping it does
/// *not* cancel the callback; `cancel()` must be called explicitly, mirroring
/// the "cancel by token" contract in `spec.md` §2.
#[derive(Clone)]
pub struct CancelToken {
    generation: u64,
    cancelled: Arc<AtomicU64>,
}

impl CancelToken {
    pub fn cancel(&self) {
        self.cancelled.store(self.generation, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) == self.generation
    }
}

/// Schedules a single callback to run at an absolute timestamp on the Tokio
/// runtime's own time-driven task, per `spec.md` §5 ("A scheduler fires
/// time-based callbacks on its own thread pool").
#[derive(Clone, Default)]
pub struct Scheduler;

impl Scheduler {
    pub fn new() -> Self {
        Self
    }

    /// Schedule `callback` to run once the clock reaches `at`. Returns a
    /// token that, if `cancel()`-ed before firing, makes the callback a
    /// no-op instead.
    pub fn schedule_at<C, F>(&self, clock: Arc<C>, at: Timestamp, callback: F) -> CancelToken
    where
        C: Clock + 'static,
        F: FnOnce() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicU64::new(0));
        // Generation 0 means "not cancelled"; tokens start at 1 so the
        // zero-valued sentinel never collides with a live token.
        static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        let token = CancelToken { generation, cancelled: cancelled.clone() };

        tokio::spawn(async move {
            loop {
                let now = clock.now();
                if now >= at {
                    break;
                }
                let remaining = (at - now).max(0.0);
                tokio::time::sleep(Duration::from_secs_f64(remaining.min(3600.0))).await;
            }
            if cancelled.load(Ordering::SeqCst) != generation {
                callback();
            }
        });

        token
    }
}

/// A notification-based gate used by tests to wait for a scheduled callback
/// to have run, without sleeping a fixed wall-clock duration.
pub fn notifier() -> Arc<Notify> {
    Arc::new(Notify::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct FixedClock(std::sync::atomic::AtomicU64);
    impl Clock for FixedClock {
        fn now(&self) -> Timestamp {
            self.0.load(Ordering::SeqCst) as f64
        }
    }

    #[tokio::test]
    async fn callback_fires_once_time_reached() {
        let clock = Arc::new(FixedClock(std::sync::atomic::AtomicU64::new(0)));
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let scheduler = Scheduler::new();
        let _token = scheduler.schedule_at(clock.clone(), 0.0, move || {
            fired2.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancelled_callback_never_fires() {
        let clock = Arc::new(FixedClock(std::sync::atomic::AtomicU64::new(0)));
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let scheduler = Scheduler::new();
        let token = scheduler.schedule_at(clock.clone(), 0.0, move || {
            fired2.store(true, Ordering::SeqCst);
        });
        token.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
