//! Bounded-concurrency send queue.
//!
//! Items are admitted in FIFO order by a single pump task; at most
//! `max_concurrent` of them are inside the worker at any time. The queue
//! supports drain-then-close: once closed it refuses new items, finishes the
//! ones it holds, and then fires its ready callback exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};

use crate::{MetricsSink, OwnedTask};

/// Default bound on items in flight.
pub const DEFAULT_CONCURRENCY: usize = 1000;

/// Processes items pulled off a [`SendQueue`].
#[async_trait::async_trait]
pub trait Worker<T>: Send + Sync + 'static {
    async fn process(&self, item: T);
}

type ReadyCallback = Box<dyn FnOnce() + Send>;

struct QueueState {
    name: String,
    /// Enqueued but not yet admitted.
    pending: AtomicUsize,
    /// Enqueued but not yet finished.
    outstanding: AtomicUsize,
    closed: AtomicBool,
    on_ready: std::sync::Mutex<Option<ReadyCallback>>,
}

impl QueueState {
    fn finish_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 && self.closed.load(Ordering::SeqCst)
        {
            self.fire_ready();
        }
    }

    fn fire_ready(&self) {
        let callback = match self.on_ready.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(callback) = callback {
            tracing::debug!(queue = %self.name, "queue drained");
            callback();
        }
    }
}

/// Marks one item finished even if its worker panics.
struct Finished(Arc<QueueState>);

impl Drop for Finished {
    fn drop(&mut self) {
        self.0.finish_one();
    }
}

/// Bounded-concurrency FIFO queue feeding a [`Worker`].
pub struct SendQueue<T> {
    state: Arc<QueueState>,
    tx: mpsc::UnboundedSender<T>,
    max_concurrent: usize,
    _pump: OwnedTask,
    sampler: Option<OwnedTask>,
}

impl<T: Send + 'static> SendQueue<T> {
    /// Create a queue and start its pump.
    pub fn new<W: Worker<T>>(name: impl Into<String>, max_concurrent: usize, worker: Arc<W>) -> Self {
        let max_concurrent = max_concurrent.max(1);
        let state = Arc::new(QueueState {
            name: name.into(),
            pending: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            on_ready: std::sync::Mutex::new(None),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = OwnedTask::spawn(
            "send-queue-pump",
            pump(rx, worker, state.clone(), Arc::new(Semaphore::new(max_concurrent))),
        );

        Self {
            state,
            tx,
            max_concurrent,
            _pump: pump,
            sampler: None,
        }
    }

    /// Report queue length and throughput every `interval`.
    ///
    /// Gauges are written to `<name>.queue` and `<name>.rate`.
    pub fn with_rate_sampler(mut self, interval: Duration, metrics: Arc<dyn MetricsSink>) -> Self {
        let state = self.state.clone();
        let previous = Arc::new(AtomicUsize::new(0));
        let secs = interval.as_secs_f64().max(f64::EPSILON);

        self.sampler = Some(OwnedTask::every("send-queue-rate", interval, move || {
            let state = state.clone();
            let previous = previous.clone();
            let metrics = metrics.clone();
            async move {
                let current = state.pending.load(Ordering::SeqCst);
                let before = previous.swap(current, Ordering::SeqCst);
                let rate = (before as f64 - current as f64) / secs;

                metrics.gauge(&format!("{}.queue", state.name), current as f64);
                metrics.gauge(&format!("{}.rate", state.name), rate);
                if rate != 0.0 {
                    tracing::info!(queue = %state.name, length = current, rate, "queue rate msg/sec");
                }
            }
        }));
        self
    }

    /// Add an item. A closed queue hands the item back.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        self.state.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.state.closed.load(Ordering::SeqCst) {
            self.state.finish_one();
            return Err(item);
        }

        self.state.pending.fetch_add(1, Ordering::SeqCst);
        self.tx.send(item).map_err(|mpsc::error::SendError(item)| {
            self.state.pending.fetch_sub(1, Ordering::SeqCst);
            self.state.finish_one();
            item
        })
    }

    /// Stop accepting items and call `on_ready` once everything enqueued so
    /// far has finished. An idle queue calls it before returning.
    ///
    /// Only the first close registers a callback; later calls are ignored.
    pub fn close(&self, on_ready: impl FnOnce() + Send + 'static) {
        {
            let mut slot = match self.state.on_ready.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            if self.state.closed.load(Ordering::SeqCst) {
                return;
            }
            *slot = Some(Box::new(on_ready));
            self.state.closed.store(true, Ordering::SeqCst);
        }

        if let Some(sampler) = &self.sampler {
            sampler.abort();
        }
        if self.state.outstanding.load(Ordering::SeqCst) == 0 {
            self.state.fire_ready();
        }
    }

    /// Items waiting for admission.
    pub fn len(&self) -> usize {
        self.state.pending.load(Ordering::SeqCst)
    }

    /// Whether no item is waiting for admission.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items admitted and still being processed.
    pub fn in_flight(&self) -> usize {
        self.state
            .outstanding
            .load(Ordering::SeqCst)
            .saturating_sub(self.len())
    }

    /// Whether nothing is waiting or in flight.
    pub fn is_idle(&self) -> bool {
        self.state.outstanding.load(Ordering::SeqCst) == 0
    }

    /// Whether [`SendQueue::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Concurrency bound.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

async fn pump<T, W>(
    mut rx: mpsc::UnboundedReceiver<T>,
    worker: Arc<W>,
    state: Arc<QueueState>,
    permits: Arc<Semaphore>,
) where
    T: Send + 'static,
    W: Worker<T>,
{
    while let Some(item) = rx.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        state.pending.fetch_sub(1, Ordering::SeqCst);

        let worker = worker.clone();
        let finished = Finished(state.clone());
        tokio::spawn(async move {
            worker.process(item).await;
            drop(permit);
            drop(finished);
        });
    }
}
