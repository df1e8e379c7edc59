//! Injectable clock and timer scheduling.
//!
//! Everything in the core that needs wall time or periodic callbacks goes
//! through [`TimeProvider`], so tests can drive timers deterministically with
//! [`TestTimeProvider`] while production uses the tokio-backed
//! [`SystemTimeProvider`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A unique identifier for a scheduled interval.
pub type IntervalId = u64;

/// Callback type for interval timers.
pub type IntervalCallback = Arc<dyn Fn() + Send + Sync>;

/// Clock and timer injection point.
pub trait TimeProvider: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now(&self) -> i64;

    /// Schedule `cb` to run every `period_ms` milliseconds until cleared.
    fn set_interval(&self, cb: IntervalCallback, period_ms: u64) -> IntervalId;

    /// Cancel a previously scheduled interval. Unknown ids are ignored.
    fn clear_interval(&self, id: IntervalId);
}

/// Production time provider: system clock plus tokio interval tasks.
///
/// `set_interval` must be called from within a tokio runtime context.
pub struct SystemTimeProvider {
    tasks: Mutex<HashMap<IntervalId, tokio::task::JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl SystemTimeProvider {
    /// Create a new system time provider.
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for SystemTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn set_interval(&self, cb: IntervalCallback, period_ms: u64) -> IntervalId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(period_ms.max(1)));
            // The first tick of a tokio interval fires immediately; skip it so
            // the callback cadence starts one period from now.
            interval.tick().await;
            loop {
                interval.tick().await;
                cb();
            }
        });
        let mut tasks = self.tasks.lock().unwrap();
        tasks.insert(id, handle);
        id
    }

    fn clear_interval(&self, id: IntervalId) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(handle) = tasks.remove(&id) {
            handle.abort();
        }
    }
}

impl Drop for SystemTimeProvider {
    fn drop(&mut self) {
        let tasks = self.tasks.lock().unwrap();
        for handle in tasks.values() {
            handle.abort();
        }
    }
}

struct TestInterval {
    cb: IntervalCallback,
    period_ms: u64,
    next_due: i64,
}

/// Controllable time provider for tests.
///
/// The clock only moves when told to; due intervals fire synchronously inside
/// [`set_time`](TestTimeProvider::set_time), [`advance`](TestTimeProvider::advance)
/// or [`flush`](TestTimeProvider::flush).
pub struct TestTimeProvider {
    now_ms: AtomicI64,
    intervals: Mutex<HashMap<IntervalId, TestInterval>>,
    next_id: AtomicU64,
}

impl TestTimeProvider {
    /// Create a test provider starting at the given epoch milliseconds.
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
            intervals: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Jump the clock to an absolute time, firing every interval that came due.
    pub fn set_time(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
        self.flush();
    }

    /// Move the clock forward by `delta_ms`, firing every interval that came due.
    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
        self.flush();
    }

    /// Fire all intervals whose next due time has passed.
    ///
    /// Each interval fires as many times as full periods have elapsed, in due
    /// order, mirroring how a real timer would catch up.
    pub fn flush(&self) {
        let now = self.now_ms.load(Ordering::SeqCst);
        loop {
            // Pick the single most-overdue callback, release the lock, fire it.
            // Callbacks may themselves schedule or clear intervals.
            let due: Option<(IntervalId, IntervalCallback)> = {
                let mut intervals = self.intervals.lock().unwrap();
                let candidate = intervals
                    .iter_mut()
                    .filter(|(_, i)| i.next_due <= now)
                    .min_by_key(|(_, i)| i.next_due)
                    .map(|(id, i)| {
                        i.next_due += i.period_ms.max(1) as i64;
                        (*id, Arc::clone(&i.cb))
                    });
                candidate
            };
            match due {
                Some((_, cb)) => cb(),
                None => break,
            }
        }
    }
}

impl TimeProvider for TestTimeProvider {
    fn now(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn set_interval(&self, cb: IntervalCallback, period_ms: u64) -> IntervalId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let next_due = self.now() + period_ms.max(1) as i64;
        let mut intervals = self.intervals.lock().unwrap();
        intervals.insert(
            id,
            TestInterval {
                cb,
                period_ms,
                next_due,
            },
        );
        id
    }

    fn clear_interval(&self, id: IntervalId) {
        let mut intervals = self.intervals.lock().unwrap();
        intervals.remove(&id);
    }
}

/// Trailing-edge debouncer built on a [`TimeProvider`].
///
/// Every [`trigger`](Debouncer::trigger) resets the quiet period; the callback
/// runs once after `delay_ms` without further triggers.
pub struct Debouncer {
    time: Arc<dyn TimeProvider>,
    delay_ms: u64,
    cb: IntervalCallback,
    pending: Arc<Mutex<Option<IntervalId>>>,
}

impl Debouncer {
    /// Create a debouncer wrapping `cb`.
    pub fn new(time: Arc<dyn TimeProvider>, delay_ms: u64, cb: IntervalCallback) -> Self {
        Self {
            time,
            delay_ms,
            cb,
            pending: Arc::new(Mutex::new(None)),
        }
    }

    /// Schedule (or reschedule) the wrapped callback.
    pub fn trigger(&self) {
        let mut pending = self.pending.lock().unwrap();
        if let Some(prior) = pending.take() {
            self.time.clear_interval(prior);
        }

        let time = Arc::clone(&self.time);
        let cb = Arc::clone(&self.cb);
        let slot = Arc::clone(&self.pending);
        // Fire-once: the interval clears itself on its first tick.
        let id_cell: Arc<Mutex<Option<IntervalId>>> = Arc::new(Mutex::new(None));
        let id_cell_inner = Arc::clone(&id_cell);
        let id = self.time.set_interval(
            Arc::new(move || {
                if let Some(own_id) = *id_cell_inner.lock().unwrap() {
                    time.clear_interval(own_id);
                }
                let mut slot = slot.lock().unwrap();
                *slot = None;
                drop(slot);
                cb();
            }),
            self.delay_ms,
        );
        *id_cell.lock().unwrap() = Some(id);
        *pending = Some(id);
    }

    /// Drop any scheduled run without firing it.
    pub fn cancel(&self) {
        let mut pending = self.pending.lock().unwrap();
        if let Some(prior) = pending.take() {
            self.time.clear_interval(prior);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_test_provider_now() {
        let time = TestTimeProvider::new(1_000);
        assert_eq!(time.now(), 1_000);
        time.advance(500);
        assert_eq!(time.now(), 1_500);
    }

    #[test]
    fn test_interval_fires_on_advance() {
        let time = TestTimeProvider::new(0);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        time.set_interval(
            Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            100,
        );

        time.advance(99);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        time.advance(1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        time.advance(250);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_clear_interval() {
        let time = TestTimeProvider::new(0);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = time.set_interval(
            Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            10,
        );
        time.clear_interval(id);
        time.advance(100);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_debounce_collapses_triggers() {
        let time = Arc::new(TestTimeProvider::new(0));
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let debouncer = Debouncer::new(
            Arc::clone(&time) as Arc<dyn TimeProvider>,
            50,
            Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        debouncer.trigger();
        time.advance(30);
        debouncer.trigger();
        time.advance(30);
        // Second trigger reset the quiet period; still nothing.
        assert_eq!(count.load(Ordering::SeqCst), 0);
        time.advance(20);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // Fire-once: no repeat.
        time.advance(500);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_debounce_cancel() {
        let time = Arc::new(TestTimeProvider::new(0));
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let debouncer = Debouncer::new(
            Arc::clone(&time) as Arc<dyn TimeProvider>,
            50,
            Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        debouncer.trigger();
        debouncer.cancel();
        time.advance(200);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_system_provider_interval() {
        let time = SystemTimeProvider::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = time.set_interval(
            Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            10,
        );
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        time.clear_interval(id);
        assert!(count.load(Ordering::SeqCst) >= 1);
    }
}
