//! Tracking of operations that must finish even during shutdown.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Process-wide count of in-flight critical sections.
///
/// Wrap single persisted writes or checkpoint saves, never whole loops:
/// shutdown waits for the count to reach zero.
#[derive(Debug, Default)]
pub struct CriticalSectionTracker {
    count: Mutex<usize>,
}

/// Scope of one critical section; the count drops when this does, including
/// during unwinding.
#[must_use = "the critical section ends as soon as the guard is dropped"]
#[derive(Debug)]
pub struct CriticalSection<'a> {
    tracker: &'a CriticalSectionTracker,
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        let mut count = self.tracker.count.lock();
        *count = count.saturating_sub(1);
        debug!(active = *count, "critical section exited");
    }
}

impl CriticalSectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> CriticalSection<'_> {
        let mut count = self.count.lock();
        *count += 1;
        debug!(active = *count, "critical section entered");
        CriticalSection { tracker: self }
    }

    /// Run `f` inside a critical section.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        let _section = self.enter();
        f()
    }

    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Poll until the count reaches zero or `timeout` elapses. Returns
    /// whether everything drained.
    pub fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let active = self.count();
            if active == 0 {
                info!("all critical sections completed");
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    active,
                    timeout_secs = timeout.as_secs_f64(),
                    "critical sections still running at drain timeout, continuing shutdown"
                );
                return false;
            }
            std::thread::sleep(DRAIN_POLL.min(deadline - now));
        }
    }
}
