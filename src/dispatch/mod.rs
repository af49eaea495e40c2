//! Handler dispatch
//!
//! Matched handlers never run on the transport read path. The reader enqueues
//! one work item per matched subscription; a fixed pool of worker threads runs
//! the handlers.
//!
//! ```text
//! reader ──enqueue──► [permits: C] ──► lane[hash(filter) % N] ──► worker N ──► handler
//! ```
//!
//! The queue holds at most `C` items, counting the ones a handler is currently
//! processing. When it is full, `enqueue` waits (backpressure on the read
//! loop) for up to the dispatch timeout and then reports `DispatchOverload`.
//! Items are never dropped.
//!
//! All items for one filter go to the same lane, so each handler sees its
//! messages in enqueue order.

use crate::error::SessionError;
use crate::protocol::Message;
use crate::subscription::MatchedHandler;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct DispatcherSettings {
    pub capacity: usize,
    pub workers: usize,
    pub enqueue_timeout: Duration,
}

struct WorkItem {
    matched: MatchedHandler,
    message: Message,
    /// Returned to the queue once the handler has finished
    _permit: OwnedSemaphorePermit,
}

pub struct Dispatcher {
    lanes: Vec<mpsc::UnboundedSender<WorkItem>>,
    permits: Arc<Semaphore>,
    settings: DispatcherSettings,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawns the worker threads
    pub fn spawn(settings: DispatcherSettings) -> Result<Self, std::io::Error> {
        info!(
            "Starting dispatcher: capacity {}, {} workers",
            settings.capacity, settings.workers
        );
        let mut lanes = Vec::with_capacity(settings.workers);
        let mut workers = Vec::with_capacity(settings.workers);

        for index in 0..settings.workers {
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = std::thread::Builder::new()
                .name(format!("dispatch-worker-{}", index))
                .spawn(move || run_worker(index, rx))?;
            lanes.push(tx);
            workers.push(worker);
        }

        Ok(Self {
            lanes,
            permits: Arc::new(Semaphore::new(settings.capacity)),
            settings,
            workers,
        })
    }

    /// Queues `message` for every matched handler, in order.
    ///
    /// Blocks while the queue is full. Fails with `DispatchOverload` if a slot
    /// does not free up within the enqueue timeout.
    pub async fn enqueue(
        &self,
        matched: Vec<MatchedHandler>,
        message: &Message,
    ) -> Result<(), SessionError> {
        for handler in matched {
            let permit = match tokio::time::timeout(
                self.settings.enqueue_timeout,
                self.permits.clone().acquire_owned(),
            )
            .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    error!("Dispatcher queue closed");
                    return Err(SessionError::DispatchOverload { waited_ms: 0 });
                }
                Err(_) => {
                    let waited_ms = self.settings.enqueue_timeout.as_millis() as u64;
                    error!(
                        "Work queue full for {}ms, handler for '{}' not keeping up",
                        waited_ms, handler.filter
                    );
                    return Err(SessionError::DispatchOverload { waited_ms });
                }
            };

            let lane = self.lane_for(&handler.filter);
            let item = WorkItem {
                message: message.at_qos(handler.qos),
                matched: handler,
                _permit: permit,
            };
            if self.lanes[lane].send(item).is_err() {
                error!("Dispatch worker {} is gone", lane);
                return Err(SessionError::DispatchOverload { waited_ms: 0 });
            }
        }
        Ok(())
    }

    fn lane_for(&self, filter: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        filter.hash(&mut hasher);
        (hasher.finish() % self.lanes.len() as u64) as usize
    }

    /// Items queued or being handled
    pub fn pending(&self) -> usize {
        self.settings.capacity - self.permits.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.settings.capacity
    }

    /// Stops accepting work and lets workers drain their lanes.
    ///
    /// Returns without waiting for workers stuck in a handler.
    pub fn shutdown(&mut self) {
        self.permits.close();
        self.lanes.clear();
        let workers = std::mem::take(&mut self.workers);
        debug!("Dispatcher shut down, {} workers detached", workers.len());
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(index: usize, mut lane: mpsc::UnboundedReceiver<WorkItem>) {
    debug!("Dispatch worker {} started", index);
    while let Some(item) = lane.blocking_recv() {
        let WorkItem {
            matched,
            message,
            _permit,
        } = item;
        debug!(
            "Worker {} delivering '{}' to handler for '{}'",
            index,
            message.topic(),
            matched.filter
        );
        let handler = matched.handler.clone();
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler.deliver(message)))
            .is_err()
        {
            warn!("Handler for '{}' panicked", matched.filter);
        }
    }
    debug!("Dispatch worker {} stopped", index);
}
