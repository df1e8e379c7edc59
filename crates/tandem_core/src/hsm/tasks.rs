//! Cancellable async operations, one pending per category.
//!
//! The state machine never blocks inside `send`; anything that suspends runs
//! through [`OpRegistry::spawn`]. Spawning under an id cancels the previous
//! operation with the same id; cancelled closures must check their
//! [`CancelFlag`] before sending results back into the machine.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Cooperative cancellation flag handed to spawned operations.
#[derive(Debug, Clone)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Whether the operation has been superseded or cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct OpSlot {
    generation: u64,
    cancel: CancelFlag,
    running: bool,
}

/// Tracks at most one pending async operation per id.
pub struct OpRegistry {
    slots: Mutex<HashMap<&'static str, OpSlot>>,
    notify: Notify,
}

impl OpRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        })
    }

    /// Spawn an operation under `id`, cancelling any prior operation with the
    /// same id. Requires a tokio runtime context.
    pub fn spawn<F, Fut>(self: &Arc<Self>, id: &'static str, f: F)
    where
        F: FnOnce(CancelFlag) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let flag = CancelFlag::new();
        let generation = {
            let mut slots = self.slots.lock().unwrap();
            let next_gen = slots.get(id).map(|s| s.generation + 1).unwrap_or(1);
            if let Some(prior) = slots.get(id) {
                if prior.running {
                    log::debug!("[OpRegistry] Cancelling prior '{}' op", id);
                    prior.cancel.cancel();
                }
            }
            slots.insert(
                id,
                OpSlot {
                    generation: next_gen,
                    cancel: flag.clone(),
                    running: true,
                },
            );
            next_gen
        };

        let registry = Arc::clone(self);
        let fut = f(flag);
        tokio::spawn(async move {
            fut.await;
            registry.finish(id, generation);
        });
    }

    fn finish(&self, id: &'static str, generation: u64) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(id) {
            if slot.generation == generation {
                slot.running = false;
            }
        }
        drop(slots);
        self.notify.notify_waiters();
    }

    /// Whether an operation with `id` is currently running.
    pub fn is_running(&self, id: &str) -> bool {
        let slots = self.slots.lock().unwrap();
        slots.get(id).is_some_and(|s| s.running)
    }

    /// Cancel the running operation with `id`, if any.
    pub fn cancel(&self, id: &str) {
        let slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get(id) {
            if slot.running {
                slot.cancel.cancel();
            }
        }
    }

    /// Cancel every running operation.
    pub fn cancel_all(&self) {
        let slots = self.slots.lock().unwrap();
        for slot in slots.values() {
            if slot.running {
                slot.cancel.cancel();
            }
        }
    }

    /// Wait until no operation with `id` is running.
    ///
    /// If a newer operation replaces the current one mid-await, this keeps
    /// waiting for the replacement too.
    pub async fn await_op(&self, id: &str) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a finish landing between
            // the check and the await cannot be missed.
            notified.as_mut().enable();
            if !self.is_running(id) {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_spawn_and_await() {
        let registry = OpRegistry::new();
        let done = Arc::new(AtomicBool::new(false));

        let d = Arc::clone(&done);
        registry.spawn("work", move |_flag| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            d.store(true, Ordering::SeqCst);
        });

        assert!(registry.is_running("work"));
        registry.await_op("work").await;
        assert!(done.load(Ordering::SeqCst));
        assert!(!registry.is_running("work"));
    }

    #[tokio::test]
    async fn test_await_without_op_returns_immediately() {
        let registry = OpRegistry::new();
        registry.await_op("nothing").await;
    }

    #[tokio::test]
    async fn test_respawn_cancels_prior() {
        let registry = OpRegistry::new();
        let cancelled = Arc::new(AtomicBool::new(false));
        let completions = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&cancelled);
        let n = Arc::clone(&completions);
        registry.spawn("op", move |flag| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if flag.is_cancelled() {
                c.store(true, Ordering::SeqCst);
                return;
            }
            n.fetch_add(1, Ordering::SeqCst);
        });

        // Replace it immediately.
        let n2 = Arc::clone(&completions);
        registry.spawn("op", move |flag| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if !flag.is_cancelled() {
                n2.fetch_add(1, Ordering::SeqCst);
            }
        });

        registry.await_op("op").await;
        // await_op covers the replacement generation too.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cancelled.load(Ordering::SeqCst));
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_await_covers_replacement_mid_wait() {
        let registry = OpRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        registry.spawn("op", move |_| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            o1.lock().unwrap().push("first");
        });

        let registry_inner = Arc::clone(&registry);
        let o2 = Arc::clone(&order);
        let spawner = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            registry_inner.spawn("op", move |_| async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                o2.lock().unwrap().push("second");
            });
        });

        registry.await_op("op").await;
        spawner.await.unwrap();
        let order = order.lock().unwrap();
        assert!(order.contains(&"second"));
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let registry = OpRegistry::new();
        let survived = Arc::new(AtomicUsize::new(0));

        for id in ["a", "b"] {
            let s = Arc::clone(&survived);
            registry.spawn(id, move |flag| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if !flag.is_cancelled() {
                    s.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        registry.cancel_all();
        registry.await_op("a").await;
        registry.await_op("b").await;
        assert_eq!(survived.load(Ordering::SeqCst), 0);
    }
}
