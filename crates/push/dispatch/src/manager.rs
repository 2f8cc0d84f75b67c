//! The dispatch manager: resolves targets, fetches providers, re-emits events.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use push_core::{
    DeviceType, DispatchError, DispatchEvent, Installation, InstallationQuery, Notification,
    ProviderEvent, ProviderKey,
};
use push_provider::{
    Cancellations, DeliveryReport, MetricsSink, OwnedTask, Provider, ProviderConfig,
    ProviderContext, Receipt,
};
use push_transport::{Connector, PushOptions, Recipient};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::{ApplicationStore, DispatchConfig, InstallationStore, ProviderCache, ProviderFactory};

/// Capacity of the event broadcast; slow subscribers lag past this.
const EVENT_CAPACITY: usize = 1024;

/// A provider event tagged with the instance that raised it.
struct Tagged {
    key: ProviderKey,
    provider: Uuid,
    event: ProviderEvent,
}

/// Builds providers from application settings.
pub struct SettingsFactory<A> {
    apps: Arc<A>,
    connector: Arc<dyn Connector>,
    metrics: Arc<dyn MetricsSink>,
    cancellations: Arc<Cancellations>,
    config: ProviderConfig,
    events: mpsc::UnboundedSender<Tagged>,
}

impl<A: ApplicationStore> ProviderFactory for SettingsFactory<A> {
    async fn build(&self, key: &ProviderKey) -> Result<Arc<Provider>, DispatchError> {
        let app = self
            .apps
            .find_by_id(&key.app_id)
            .await
            .map_err(|e| DispatchError::Lookup(format!("{e:#}")))?
            .ok_or_else(|| DispatchError::app_not_found(&key.app_id))?;

        let settings = app.push_settings.as_ref().ok_or_else(|| {
            DispatchError::construction(
                key,
                format!("no push settings configured for application {:?}", app.name),
            )
        })?;
        let options = PushOptions::resolve(key.device_type, settings)
            .map_err(|e| DispatchError::construction(key, e))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let context = ProviderContext {
            events: tx,
            metrics: self.metrics.clone(),
            cancellations: self.cancellations.clone(),
        };
        let provider =
            Provider::connect(key.clone(), options, self.connector.clone(), context, &self.config)
                .await?;

        // Ends once the provider and its tasks are gone.
        let events = self.events.clone();
        let (key, id) = (key.clone(), provider.id());
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let tagged = Tagged {
                    key: key.clone(),
                    provider: id,
                    event,
                };
                if events.send(tagged).is_err() {
                    break;
                }
            }
        });

        Ok(provider)
    }
}

/// Per-installation outcome of [`DispatchManager::notify_by_query`].
#[derive(Debug)]
pub struct QueryReport {
    /// Installations matched by the query.
    pub matched: usize,
    pub results: Vec<(String, Result<DeliveryReport, DispatchError>)>,
}

impl QueryReport {
    /// The first failure, in installation order.
    pub fn first_error(&self) -> Option<&DispatchError> {
        self.results.iter().find_map(|(_, r)| r.as_ref().err())
    }
}

/// Entry point for sending notifications.
pub struct DispatchManager<A, I> {
    installations: Arc<I>,
    cache: Arc<ProviderCache<SettingsFactory<A>>>,
    cancellations: Arc<Cancellations>,
    events: broadcast::Sender<DispatchEvent>,
    shutdown_timeout: Duration,
    closed: AtomicBool,
    _forwarder: OwnedTask,
}

impl<A: ApplicationStore, I: InstallationStore> DispatchManager<A, I> {
    /// Create a manager. Must be called inside a tokio runtime.
    pub fn new(
        apps: Arc<A>,
        installations: Arc<I>,
        connector: Arc<dyn Connector>,
        metrics: Arc<dyn MetricsSink>,
        config: &DispatchConfig,
    ) -> Self {
        let cancellations = Arc::new(Cancellations::new());
        let (tagged_tx, tagged_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let factory = SettingsFactory {
            apps,
            connector,
            metrics,
            cancellations: cancellations.clone(),
            config: config.provider(),
            events: tagged_tx,
        };
        let cache = Arc::new(ProviderCache::new(
            factory,
            config.ttl(),
            config.check_period(),
        ));

        let forwarder = OwnedTask::spawn(
            "dispatch-events",
            forward_events(tagged_rx, events.clone(), cache.clone()),
        );

        Self {
            installations,
            cache,
            cancellations,
            events,
            shutdown_timeout: config.shutdown_timeout(),
            closed: AtomicBool::new(false),
            _forwarder: forwarder,
        }
    }

    /// Provider cache, for inspection.
    pub fn cache(&self) -> &ProviderCache<SettingsFactory<A>> {
        &self.cache
    }

    /// Stream of provider events tagged with their tenant.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    /// Send to one installation and wait for the outcome.
    pub async fn notify(
        &self,
        installation: &Installation,
        notification: &Notification,
    ) -> Result<DeliveryReport, DispatchError> {
        self.ensure_open()?;
        dispatch(&self.cache, installation, notification)
            .await?
            .wait()
            .await
    }

    /// Send to the installation with id `installation_id`.
    pub async fn notify_by_id(
        &self,
        installation_id: &str,
        notification: &Notification,
    ) -> Result<DeliveryReport, DispatchError> {
        let installation = self
            .installations
            .find_by_id(installation_id)
            .await
            .map_err(|e| DispatchError::Lookup(format!("{e:#}")))?
            .ok_or_else(|| DispatchError::installation_not_found(installation_id))?;

        self.notify(&installation, notification).await
    }

    /// Send to every installation matching `query`.
    ///
    /// Each installation is resolved and dispatched on its own task, so a
    /// slow provider construction only holds up its own tenant. Every branch
    /// is joined; the per-installation results are reported in query order.
    pub async fn notify_by_query(
        &self,
        query: &InstallationQuery,
        notification: &Notification,
    ) -> Result<QueryReport, DispatchError> {
        self.ensure_open()?;
        let installations = self
            .installations
            .find(query)
            .await
            .map_err(|e| DispatchError::Lookup(format!("{e:#}")))?;
        let matched = installations.len();
        tracing::debug!(matched, "notifying by query");

        let notification = Arc::new(notification.clone());
        let mut branches = JoinSet::new();
        for (index, installation) in installations.iter().cloned().enumerate() {
            let cache = self.cache.clone();
            let notification = notification.clone();
            branches.spawn(async move {
                let outcome = match dispatch(&cache, &installation, &notification).await {
                    Ok(receipt) => receipt.wait().await,
                    Err(e) => Err(e),
                };
                (index, outcome)
            });
        }

        let mut outcomes: Vec<Option<Result<DeliveryReport, DispatchError>>> =
            (0..matched).map(|_| None).collect();
        while let Some(joined) = branches.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => tracing::error!(error = %e, "notify branch failed"),
            }
        }

        let results = installations
            .into_iter()
            .zip(outcomes)
            .map(|(installation, outcome)| {
                (
                    installation.id,
                    outcome.unwrap_or(Err(DispatchError::Dropped)),
                )
            })
            .collect();

        Ok(QueryReport { matched, results })
    }

    /// Send to a set of tokens of one application and device type.
    ///
    /// Returns once the work is queued; the receipt resolves when it has
    /// been delivered.
    pub async fn notify_many(
        &self,
        app_id: &str,
        device_type: DeviceType,
        tokens: Vec<String>,
        notification: &Notification,
    ) -> Result<Receipt, DispatchError> {
        self.ensure_open()?;
        if tokens.is_empty() {
            return Err(DispatchError::Validation(
                "deviceTokens must not be empty".into(),
            ));
        }
        if tokens.iter().any(String::is_empty) {
            return Err(DispatchError::Validation(
                "deviceTokens must not contain empty tokens".into(),
            ));
        }

        let notification = notification.addressed_to(device_type, None);
        notification.validate_content()?;

        let key = ProviderKey::new(app_id, device_type);
        let provider = self.cache.get(&key).await?;
        Ok(provider.push_notification(Arc::new(notification), Recipient::Tokens(tokens), None))
    }

    /// Send to every device subscribed to `topic`. Only the Android
    /// transports support topics.
    pub async fn notify_topic(
        &self,
        app_id: &str,
        device_type: DeviceType,
        topic: &str,
        notification: &Notification,
    ) -> Result<Receipt, DispatchError> {
        self.ensure_open()?;
        if !matches!(device_type, DeviceType::Android | DeviceType::AndroidXcs) {
            return Err(DispatchError::Validation(format!(
                "topics are not supported for {device_type}"
            )));
        }
        let topic = topic.trim_start_matches("/topics/");
        if topic.is_empty() {
            return Err(DispatchError::Validation("topic must not be empty".into()));
        }

        let notification = notification.addressed_to(device_type, None);
        notification.validate_content()?;

        let key = ProviderKey::new(app_id, device_type);
        let provider = self.cache.get(&key).await?;
        tracing::debug!(provider = %key, topic, "notifying topic");
        Ok(provider.push_notification(
            Arc::new(notification),
            Recipient::Topic(format!("/topics/{topic}")),
            None,
        ))
    }

    /// Application settings for `device_type` changed: rebuild its provider
    /// on next use.
    pub async fn settings_changed(&self, app_id: &str, device_type: DeviceType) -> bool {
        let key = ProviderKey::new(app_id, device_type);
        tracing::info!(provider = %key, "push settings changed");
        self.cache.invalidate(&key).await
    }

    /// Skip queued items belonging to `batch_id` that have not been sent yet.
    pub async fn cancel_batch(&self, batch_id: &str) {
        tracing::info!(batch = batch_id, "cancelling batch");
        self.cancellations.cancel(batch_id).await;
    }

    /// Forget a cancelled batch once none of its items can still be queued.
    pub async fn forget_batch(&self, batch_id: &str) {
        self.cancellations.forget(batch_id).await;
    }

    /// Stop accepting work, drain every provider and close its connections.
    /// Gives up after the configured shutdown timeout. Returns whether
    /// everything finished in time.
    pub async fn shutdown(&self) -> bool {
        self.shutdown_within(self.shutdown_timeout).await
    }

    /// [`DispatchManager::shutdown`] with an explicit bound.
    pub async fn shutdown_within(&self, limit: Duration) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return true;
        }
        crate::graceful_shutdown(limit, || self.cache.shutdown_all()).await
    }

    fn ensure_open(&self) -> Result<(), DispatchError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DispatchError::ShuttingDown)
        } else {
            Ok(())
        }
    }
}

/// Validate, fetch the provider and queue the notification.
async fn dispatch<F: ProviderFactory>(
    cache: &ProviderCache<F>,
    installation: &Installation,
    notification: &Notification,
) -> Result<Receipt, DispatchError> {
    let notification = notification.addressed_to(
        installation.device_type,
        Some(installation.device_token.as_str()).filter(|t| !t.is_empty()),
    );
    notification.validate()?;

    let key = ProviderKey::new(&installation.app_id, installation.device_type);
    let provider = cache.get(&key).await?;
    let token = notification
        .device_token
        .clone()
        .unwrap_or_else(|| installation.device_token.clone());

    Ok(provider.push_notification(
        Arc::new(notification),
        Recipient::Token(token),
        Some(installation),
    ))
}

async fn forward_events<F: ProviderFactory>(
    mut tagged: mpsc::UnboundedReceiver<Tagged>,
    events: broadcast::Sender<DispatchEvent>,
    cache: Arc<ProviderCache<F>>,
) {
    while let Some(Tagged {
        key,
        provider,
        event,
    }) = tagged.recv().await
    {
        if let ProviderEvent::Fatal { error } = &event {
            if error.is_auth() {
                tracing::warn!(provider = %key, %error, "authentication failed, rebuilding provider");
                let cache = cache.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    cache.invalidate_instance(&key, provider).await;
                });
            } else {
                tracing::error!(provider = %key, %error, "provider error");
            }
        }

        // No subscribers is fine.
        let _ = events.send(DispatchEvent {
            app_id: key.app_id,
            device_type: key.device_type,
            event,
        });
    }
}
