use super::RetryPriorityQueue;
use crate::core::Result;
use crate::timer::CancellableTimer;
use futures::FutureExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{Level, event};
use uuid::Uuid;

/// How a parked retry is woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryWake {
    /// The delay elapsed; run the next attempt.
    Fire,
    /// The lock owner was lost; give up.
    Abort,
}

/// Continuation of one lock-contention retry waiting in the scheduler.
#[derive(Debug)]
pub struct PendingRetry {
    pub retry_id: u64,
    pub instance_id: Option<Uuid>,
    pub attempt: u32,
    wake: oneshot::Sender<RetryWake>,
}

impl PendingRetry {
    pub fn new(
        instance_id: Option<Uuid>,
        attempt: u32,
    ) -> (Self, oneshot::Receiver<RetryWake>) {
        static NEXT_RETRY_ID: AtomicU64 = AtomicU64::new(1);
        let (wake, waiter) = oneshot::channel();
        let pending = Self {
            retry_id: NEXT_RETRY_ID.fetch_add(1, Ordering::Relaxed),
            instance_id,
            attempt,
            wake,
        };
        (pending, waiter)
    }

    fn resume(self) {
        let _ = self.wake.send(RetryWake::Fire);
    }

    fn abort(self) {
        let _ = self.wake.send(RetryWake::Abort);
    }
}

/// Parks lock-contention retries until they are due.
///
/// One heap and one timer serve every pending retry; the timer always tracks
/// the earliest due time. Continuations run outside the heap lock.
pub struct RetryScheduler {
    queue: Mutex<RetryPriorityQueue<Instant, PendingRetry>>,
    timer: CancellableTimer,
}

impl RetryScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let timer = CancellableTimer::new(
                "lock-retry",
                Arc::new(move || {
                    let weak = weak.clone();
                    async move {
                        if let Some(scheduler) = weak.upgrade() {
                            scheduler.on_timer();
                        }
                    }
                    .boxed()
                }),
            );
            Self {
                queue: Mutex::new(RetryPriorityQueue::new()),
                timer,
            }
        })
    }

    /// Parks `pending` for `delay`. Re-arms the timer only if it became the
    /// earliest retry.
    pub fn enqueue(&self, pending: PendingRetry, delay: Duration) -> Result<()> {
        let mut queue = self.queue.lock()?;
        let due_at = Instant::now() + delay;
        let retry_id = pending.retry_id;
        if queue.enqueue(due_at, pending) {
            self.timer.set(delay);
        }
        event!(
            Level::DEBUG,
            retry_id,
            delay_ms = delay.as_millis() as u64,
            pending = queue.len(),
            "lock retry parked"
        );
        Ok(())
    }

    /// Removes one parked retry without waking it. Returns false if it was
    /// no longer parked.
    pub fn cancel(&self, retry_id: u64) -> Result<bool> {
        let removed = {
            let mut queue = self.queue.lock()?;
            queue.remove_all_matching(|_, pending| pending.retry_id == retry_id)
        };
        if removed.is_empty() {
            return Ok(false);
        }
        self.rearm()?;
        Ok(true)
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    /// Cancels the timer and aborts every parked retry.
    ///
    /// Abort continuations run on a separate task. Returns how many retries
    /// were aborted.
    pub fn abort_all(&self) -> Result<usize> {
        let drained = {
            let mut queue = self.queue.lock()?;
            self.timer.cancel();
            queue.drain_all()
        };

        let count = drained.len();
        if count > 0 {
            event!(Level::INFO, aborted = count, "aborting pending lock retries");
            tokio::spawn(async move {
                for (_, pending) in drained {
                    pending.abort();
                }
            });
        }
        Ok(count)
    }

    fn on_timer(&self) {
        let due = match self.take_due() {
            Ok(due) => due,
            Err(err) => {
                event!(Level::ERROR, error = %err, "lock retry queue unavailable");
                return;
            }
        };

        for (_, pending) in due {
            pending.resume();
        }

        if let Err(err) = self.rearm() {
            event!(Level::ERROR, error = %err, "lock retry timer not re-armed");
        }
    }

    fn take_due(&self) -> Result<Vec<(Instant, PendingRetry)>> {
        let mut queue = self.queue.lock()?;
        let now = Instant::now();
        let overdue = match queue.peek_min() {
            Ok((due_at, _)) => *due_at <= now,
            Err(_) => false,
        };
        if !overdue {
            return Ok(Vec::new());
        }
        Ok(queue.take_while_min_satisfies(|due_at, _| *due_at <= now))
    }

    fn rearm(&self) -> Result<()> {
        let queue = self.queue.lock()?;
        if let Ok((due_at, _)) = queue.peek_min() {
            self.timer
                .set(due_at.saturating_duration_since(Instant::now()));
        }
        Ok(())
    }
}
