use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, sleep};

pub type TimerCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct ArmedTimer {
    generation: u64,
    due_at: Instant,
    stop_tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct TimerSlot {
    armed: Option<ArmedTimer>,
    generation: u64,
}

struct TimerShared {
    name: &'static str,
    callback: TimerCallback,
    slot: Mutex<TimerSlot>,
}

/// Single re-armable one-shot timer.
///
/// Arming replaces any pending expiry. The callback runs on its own tokio task
/// after the timer has been disarmed, so the callback may re-arm it.
#[derive(Clone)]
pub struct CancellableTimer {
    shared: Arc<TimerShared>,
}

impl CancellableTimer {
    pub fn new(name: &'static str, callback: TimerCallback) -> Self {
        Self {
            shared: Arc::new(TimerShared {
                name,
                callback,
                slot: Mutex::new(TimerSlot::default()),
            }),
        }
    }

    /// Arms the timer to fire after `delay`, replacing a pending expiry.
    pub fn set(&self, delay: Duration) {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let generation = {
            let mut slot = lock(&self.shared.slot);
            if let Some(previous) = slot.armed.take() {
                let _ = previous.stop_tx.send(());
            }
            slot.generation += 1;
            slot.armed = Some(ArmedTimer {
                generation: slot.generation,
                due_at: Instant::now() + delay,
                stop_tx,
            });
            slot.generation
        };

        let shared = self.shared.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = &mut stop_rx => {}
                _ = sleep(delay) => {
                    if shared.claim(generation) {
                        (shared.callback)().await;
                    }
                }
            }
        });
    }

    /// Disarms the timer. Returns whether an expiry was pending.
    pub fn cancel(&self) -> bool {
        match lock(&self.shared.slot).armed.take() {
            Some(armed) => {
                let _ = armed.stop_tx.send(());
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        lock(&self.shared.slot).armed.is_some()
    }

    /// Time left until the pending expiry, if armed.
    pub fn remaining(&self) -> Option<Duration> {
        lock(&self.shared.slot)
            .armed
            .as_ref()
            .map(|armed| armed.due_at.saturating_duration_since(Instant::now()))
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }
}

impl TimerShared {
    fn claim(&self, generation: u64) -> bool {
        let mut slot = lock(&self.slot);
        match slot.armed.as_ref() {
            Some(current) if current.generation == generation => {
                slot.armed.take();
                true
            }
            _ => false,
        }
    }
}

// Nothing panics while these locks are held.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
