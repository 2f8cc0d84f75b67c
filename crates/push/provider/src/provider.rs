//! A provider: one platform variant, its connection pool and send queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use push_core::{
    DispatchError, Installation, Notification, ProviderEvent, ProviderKey, RecipientError,
};
use push_transport::{Connector, Delivery, Message, PushOptions, Recipient, TransportSignal};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::{
    Cancellations, Completion, ConnectionPool, DEFAULT_CONCURRENCY, DeliveryReport, MetricsSink,
    OwnedTask, Planned, Platform, Receipt, SendQueue, WorkItem, Worker,
};

/// Default period between connection rotations.
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(50 * 60);

/// Default period of the queue rate sampler.
pub const DEFAULT_RATE_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Default bound on how long shutdown waits for queued work.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Tunables shared by every provider a manager builds.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    /// Queue concurrency when the application does not set one.
    pub concurrency: usize,
    /// `None` disables rotation.
    pub rotation_interval: Option<Duration>,
    /// `None` disables the rate sampler.
    pub rate_sample_interval: Option<Duration>,
    pub drain_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            rotation_interval: Some(DEFAULT_ROTATION_INTERVAL),
            rate_sample_interval: Some(DEFAULT_RATE_SAMPLE_INTERVAL),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Everything outside the provider it reports to.
#[derive(Clone)]
pub struct ProviderContext {
    pub events: mpsc::UnboundedSender<ProviderEvent>,
    pub metrics: Arc<dyn MetricsSink>,
    pub cancellations: Arc<Cancellations>,
}

/// Sends one application's notifications for one device type.
pub struct Provider {
    id: Uuid,
    key: ProviderKey,
    platform: Platform,
    pool: Arc<ConnectionPool>,
    queue: SendQueue<WorkItem>,
    sender: Arc<Sender>,
    drain_timeout: Duration,
    closed: AtomicBool,
    rotation: Option<OwnedTask>,
    signals: OwnedTask,
}

impl Provider {
    /// Open the connection pool and start the queue.
    ///
    /// Fails with [`DispatchError::Construction`] when a connection cannot be
    /// opened; nothing is left running in that case.
    pub async fn connect(
        key: ProviderKey,
        options: PushOptions,
        connector: Arc<dyn Connector>,
        context: ProviderContext,
        config: &ProviderConfig,
    ) -> Result<Arc<Self>, DispatchError> {
        let id = Uuid::new_v4();
        let platform = Platform::new(options.clone());
        let prefix = format!("app.{}.{}", key.app_id, platform.kind());
        let concurrency = options.concurrency().unwrap_or(config.concurrency);

        tracing::info!(
            provider = %key,
            %id,
            pool = options.pool_size(),
            concurrency,
            "setting up provider"
        );

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let pool = ConnectionPool::open(&*connector, &options, options.pool_size(), &signal_tx)
            .await
            .map_err(|e| DispatchError::construction(&key, e))?;
        let pool = Arc::new(pool);

        let sender = Arc::new(Sender {
            pool: pool.clone(),
            events: context.events.clone(),
            metrics: context.metrics.clone(),
            cancellations: context.cancellations,
            prefix: prefix.clone(),
            batches: platform.batches(),
        });

        let mut queue = SendQueue::new(prefix, concurrency, sender.clone());
        if let Some(interval) = config.rate_sample_interval {
            queue = queue.with_rate_sampler(interval, context.metrics);
        }

        let signals = OwnedTask::spawn(
            "provider-signals",
            forward_signals(signal_rx, context.events, key.clone()),
        );

        let rotation = config.rotation_interval.map(|interval| {
            let pool = pool.clone();
            let drain_timeout = config.drain_timeout;
            let key = key.clone();
            OwnedTask::every("provider-rotation", interval, move || {
                let pool = pool.clone();
                let connector = connector.clone();
                let options = options.clone();
                let signal_tx = signal_tx.clone();
                let key = key.clone();
                async move {
                    let rotated = pool
                        .rotate(&*connector, &options, &signal_tx, drain_timeout)
                        .await;
                    tracing::info!(provider = %key, rotated, "rotated connections");
                }
            })
        });

        Ok(Arc::new(Self {
            id,
            key,
            platform,
            pool,
            queue,
            sender,
            drain_timeout: config.drain_timeout,
            closed: AtomicBool::new(false),
            rotation,
            signals,
        }))
    }

    /// Instance id, unique per construction.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &ProviderKey {
        &self.key
    }

    /// Connection pool, for inspection.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Queue a notification for `recipient`.
    ///
    /// The receipt resolves once every work item produced for the request
    /// has completed. Recipients that cannot be addressed fail without a
    /// transport call.
    pub fn push_notification(
        &self,
        notification: Arc<Notification>,
        recipient: Recipient,
        installation: Option<&Installation>,
    ) -> Receipt {
        if self.is_closed() {
            return Receipt::ready(Err(DispatchError::ShuttingDown));
        }

        tracing::debug!(
            provider = %self.key,
            installation = installation.map(|i| i.id.as_str()),
            recipients = recipient.len(),
            "pushing notification"
        );
        self.sender
            .metrics
            .increment(&self.sender.metric("request"), recipient.len() as u64);

        let mut receipt = Receipt::default();
        for planned in self.platform.plan(&notification, recipient) {
            match planned {
                Planned::Send { message, recipient } => {
                    let (completion, rx) = Completion::new();
                    receipt.push(rx);
                    let item = WorkItem {
                        id: Uuid::new_v4(),
                        message,
                        recipient,
                        notification: notification.clone(),
                        completion,
                    };
                    if let Err(item) = self.queue.enqueue(item) {
                        item.completion.complete(Err(DispatchError::ShuttingDown));
                    }
                }
                Planned::Reject { recipient, error } => {
                    self.sender.fail(&notification, recipient, error, None);
                    receipt.extend(Receipt::ready(Ok(DeliveryReport {
                        failed: 1,
                        ..Default::default()
                    })));
                }
            }
        }
        receipt
    }

    /// Whether the notification's batch was cancelled.
    pub async fn is_cancelled(&self, notification: &Notification) -> bool {
        self.sender.cancellations.is_cancelled(notification).await
    }

    /// Whether [`Provider::shutdown`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting work, let queued items finish (bounded by the drain
    /// timeout), then close every connection. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(rotation) = &self.rotation {
            rotation.abort();
        }

        let (tx, rx) = oneshot::channel();
        self.queue.close(move || {
            let _ = tx.send(());
        });
        if tokio::time::timeout(self.drain_timeout, rx).await.is_err() {
            tracing::warn!(
                provider = %self.key,
                queued = self.queue.len(),
                in_flight = self.queue.in_flight(),
                "queue did not drain before timeout"
            );
        }

        self.pool.shutdown(self.drain_timeout).await;
        self.signals.abort();
        tracing::info!(provider = %self.key, id = %self.id, "provider shut down");
    }
}

/// Queue worker: hands items to the transport and reports outcomes.
struct Sender {
    pool: Arc<ConnectionPool>,
    events: mpsc::UnboundedSender<ProviderEvent>,
    metrics: Arc<dyn MetricsSink>,
    cancellations: Arc<Cancellations>,
    prefix: String,
    batches: bool,
}

impl Sender {
    fn metric(&self, name: &str) -> String {
        format!("{}.{name}", self.prefix)
    }

    fn emit(&self, event: ProviderEvent) {
        // The receiver only goes away when nobody listens any more.
        let _ = self.events.send(event);
    }

    fn fail(
        &self,
        notification: &Arc<Notification>,
        recipient: String,
        error: RecipientError,
        description: Option<String>,
    ) {
        self.metrics.increment(&self.metric("fail"), 1);
        self.emit(ProviderEvent::TransmissionError {
            error,
            notification: notification.clone(),
            recipient,
            description,
        });
    }

    fn report(
        &self,
        delivery: Delivery,
        message: &Message,
        notification: &Arc<Notification>,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        for sent in delivery.sent {
            let message_id = if self.batches {
                notification.message_id.clone().or(sent.message_id)
            } else {
                sent.message_id
                    .or_else(|| message.message_id().map(str::to_string))
            };
            self.emit(ProviderEvent::Transmitted {
                notification: notification.clone(),
                message_id,
                recipient: Some(sent.recipient),
            });
            report.transmitted += 1;
        }
        self.metrics
            .increment(&self.metric("sent"), report.transmitted as u64);

        for failed in delivery.failed {
            if failed.error.is_device_gone() {
                report.devices_gone.push(failed.recipient.clone());
            }
            self.fail(notification, failed.recipient, failed.error, failed.description);
            report.failed += 1;
        }

        if !report.devices_gone.is_empty() {
            self.emit(ProviderEvent::DevicesGone {
                tokens: report.devices_gone.clone(),
                notification: Some(notification.clone()),
            });
        }
        report
    }
}

#[async_trait::async_trait]
impl Worker<WorkItem> for Sender {
    async fn process(&self, item: WorkItem) {
        let WorkItem {
            id,
            message,
            recipient,
            notification,
            completion,
        } = item;
        let count = recipient.len();

        if self.cancellations.is_cancelled(&notification).await {
            tracing::debug!(item = %id, batch = ?notification.batch_id, "skipping cancelled batch");
            completion.complete(Ok(DeliveryReport::cancelled(count)));
            return;
        }

        let Some(lease) = self.pool.next().await else {
            completion.complete(Err(DispatchError::ShuttingDown));
            return;
        };
        self.metrics.increment(&self.metric("submit"), count as u64);

        let result = lease.send(&message, &recipient).await;
        lease.connection().record(result.as_ref().map(|_| ())).await;
        drop(lease);

        match result {
            Ok(delivery) => {
                let report = self.report(delivery, &message, &notification);
                completion.complete(Ok(report));
            }
            Err(error) => {
                tracing::warn!(item = %id, %error, recipients = count, "send failed");
                for target in recipient.targets() {
                    self.fail(
                        &notification,
                        target,
                        RecipientError::Transport(error.clone()),
                        None,
                    );
                }
                if error.is_fatal() {
                    self.emit(ProviderEvent::Fatal {
                        error: error.clone(),
                    });
                }
                completion.complete(Err(DispatchError::Transport(error)));
            }
        }
    }
}

/// Split a `messageId:deviceId` receipt id.
fn split_receipt_id(id: &str) -> (String, Option<String>) {
    match id.split_once(':') {
        Some((message, device)) if !device.contains(':') => {
            (message.to_string(), Some(device.to_string()))
        }
        _ => (id.to_string(), None),
    }
}

async fn forward_signals(
    mut signals: mpsc::UnboundedReceiver<TransportSignal>,
    events: mpsc::UnboundedSender<ProviderEvent>,
    key: ProviderKey,
) {
    while let Some(signal) = signals.recv().await {
        let event = match signal {
            TransportSignal::Connected => ProviderEvent::Connected,
            TransportSignal::Disconnected => ProviderEvent::Disconnected,
            TransportSignal::Receipt {
                message_id,
                from,
                category,
                data,
            } => {
                let (message_id, device_id) = split_receipt_id(&message_id);
                ProviderEvent::Receipt {
                    message_id,
                    device_id,
                    from,
                    category,
                    data,
                }
            }
            TransportSignal::Upstream {
                message_id,
                from,
                category,
                data,
            } => ProviderEvent::Upstream {
                message_id,
                from,
                category,
                data,
            },
            TransportSignal::Error(error) => {
                tracing::warn!(provider = %key, %error, "transport error");
                ProviderEvent::Fatal { error }
            }
        };

        if events.send(event).is_err() {
            break;
        }
    }
}
