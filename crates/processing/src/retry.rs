//! Fixed-interval retry queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::time::MissedTickBehavior;

/// Shortest drain period. A zero period would stop the ticker.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Holds items until the next drain tick, then hands them to `dispatch`.
///
/// Workers share one queue and stop once every handle to the service is
/// dropped.
pub struct RetryService<T> {
    sender: mpsc::UnboundedSender<T>,
    queued: Arc<AtomicUsize>,
}

impl<T: Send + 'static> RetryService<T> {
    /// Spawns `workers` drain loops on the current runtime. `interval` is
    /// raised to at least one millisecond.
    pub fn start<F>(workers: usize, interval: Duration, dispatch: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let interval = interval.max(MIN_INTERVAL);
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let dispatch = Arc::new(dispatch);
        let queued = Arc::new(AtomicUsize::new(0));

        for worker in 0..workers.max(1) {
            tokio::spawn(drain(
                worker,
                Arc::clone(&receiver),
                Arc::clone(&dispatch),
                Arc::clone(&queued),
                interval,
            ));
        }

        Self { sender, queued }
    }

    /// Queues an item for the next tick. Returns false once the workers are gone.
    pub fn schedule(&self, item: T) -> bool {
        self.queued.fetch_add(1, Ordering::AcqRel);
        if self.sender.send(item).is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Items waiting for a tick.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }
}

async fn drain<T, F>(
    worker: usize,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<T>>>,
    dispatch: Arc<F>,
    queued: Arc<AtomicUsize>,
    interval: Duration,
) where
    F: Fn(T) + Send + Sync,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; consume it.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let mut batch = Vec::new();
        let closed = {
            let mut receiver = receiver.lock().await;
            loop {
                match receiver.try_recv() {
                    Ok(item) => batch.push(item),
                    Err(mpsc::error::TryRecvError::Empty) => break false,
                    Err(mpsc::error::TryRecvError::Disconnected) => break true,
                }
            }
        };

        if !batch.is_empty() {
            tracing::debug!(worker, items = batch.len(), "draining retry queue");
        }
        for item in batch {
            queued.fetch_sub(1, Ordering::AcqRel);
            dispatch(item);
        }

        if closed {
            tracing::debug!(worker, "retry queue closed");
            return;
        }
    }
}
