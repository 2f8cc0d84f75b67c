//! Single-flight provider cache.
//!
//! One provider per (application, device type). Concurrent misses for the
//! same key share one construction; every waiter receives the same provider
//! or the same error.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use push_core::{DispatchError, ProviderKey};
use push_provider::{OwnedTask, Provider};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use uuid::Uuid;

/// Builds the provider for a key on a cache miss.
#[trait_variant::make(Send)]
pub trait ProviderFactory: Send + Sync + 'static {
    /// Resolve the key's settings and connect a provider.
    async fn build(&self, key: &ProviderKey) -> Result<Arc<Provider>, DispatchError>;
}

type Built = Option<Result<Arc<Provider>, DispatchError>>;

/// Observable state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Construction in progress.
    Loading,
    Ready,
}

enum Slot {
    Loading {
        generation: u64,
        done: watch::Receiver<Built>,
    },
    Ready {
        provider: Arc<Provider>,
        created_at: Instant,
    },
}

#[derive(Default)]
struct Entries {
    slots: HashMap<ProviderKey, Slot>,
    /// Built after their entry was invalidated; shut down at the next sweep.
    retired: Vec<Arc<Provider>>,
    generation: u64,
}

/// Cache of live providers keyed by [`ProviderKey`].
pub struct ProviderCache<F> {
    factory: Arc<F>,
    entries: Arc<Mutex<Entries>>,
    closed: Arc<AtomicBool>,
    sweeper: OwnedTask,
}

impl<F: ProviderFactory> ProviderCache<F> {
    /// Create a cache. Entries older than `ttl` are evicted by a sweep that
    /// runs every `check_period`.
    pub fn new(factory: F, ttl: Option<Duration>, check_period: Duration) -> Self {
        let entries = Arc::new(Mutex::new(Entries::default()));

        let sweeper = {
            let entries = entries.clone();
            OwnedTask::every("provider-cache-sweep", check_period, move || {
                let entries = entries.clone();
                async move {
                    let evicted = sweep(&entries, ttl).await;
                    if evicted > 0 {
                        tracing::info!(evicted, "evicted providers");
                    }
                }
            })
        };

        Self {
            factory: Arc::new(factory),
            entries,
            closed: Arc::new(AtomicBool::new(false)),
            sweeper,
        }
    }

    /// The factory this cache builds with.
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Get the provider for `key`, building it on a miss.
    pub async fn get(&self, key: &ProviderKey) -> Result<Arc<Provider>, DispatchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::ShuttingDown);
        }

        let mut done = {
            let mut entries = self.entries.lock().await;
            match entries.slots.get(key) {
                Some(Slot::Ready { provider, .. }) => return Ok(provider.clone()),
                Some(Slot::Loading { done, .. }) => done.clone(),
                None => self.start_loading(&mut entries, key),
            }
        };

        loop {
            if let Some(result) = done.borrow_and_update().clone() {
                return result;
            }
            if done.changed().await.is_err() {
                return Err(DispatchError::construction(key, "construction abandoned"));
            }
        }
    }

    fn start_loading(&self, entries: &mut Entries, key: &ProviderKey) -> watch::Receiver<Built> {
        entries.generation += 1;
        let generation = entries.generation;
        let (tx, rx) = watch::channel(None);
        entries.slots.insert(
            key.clone(),
            Slot::Loading {
                generation,
                done: rx.clone(),
            },
        );

        let factory = self.factory.clone();
        let entries = self.entries.clone();
        let closed = self.closed.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let build = {
                let key = key.clone();
                tokio::spawn(async move { factory.build(&key).await })
            };
            let result = build.await.unwrap_or_else(|e| {
                Err(DispatchError::construction(
                    &key,
                    format!("construction task failed: {e}"),
                ))
            });

            let stale = {
                let mut entries = entries.lock().await;
                let current = matches!(
                    entries.slots.get(&key),
                    Some(Slot::Loading { generation: g, .. }) if *g == generation
                );
                if current {
                    match &result {
                        Ok(provider) => {
                            entries.slots.insert(
                                key.clone(),
                                Slot::Ready {
                                    provider: provider.clone(),
                                    created_at: Instant::now(),
                                },
                            );
                        }
                        Err(_) => {
                            entries.slots.remove(&key);
                        }
                    }
                } else if let Ok(provider) = &result {
                    entries.retired.push(provider.clone());
                }
                !current
            };

            match &result {
                Ok(_) if stale => {
                    tracing::info!(provider = %key, "construction finished after invalidation, not cached")
                }
                Ok(provider) => tracing::debug!(provider = %key, id = %provider.id(), "provider ready"),
                Err(e) => tracing::warn!(provider = %key, error = %e, "provider construction failed"),
            }

            let late = closed.load(Ordering::SeqCst).then(|| result.clone().ok()).flatten();
            let _ = tx.send(Some(result));
            if let Some(provider) = late {
                provider.shutdown().await;
            }
        });

        rx
    }

    /// Current state of the entry for `key`, `None` when absent.
    pub async fn state(&self, key: &ProviderKey) -> Option<EntryState> {
        self.entries.lock().await.slots.get(key).map(|slot| match slot {
            Slot::Loading { .. } => EntryState::Loading,
            Slot::Ready { .. } => EntryState::Ready,
        })
    }

    /// Number of entries, loading or ready.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop the entry for `key` and shut its provider down. A construction
    /// in progress still reaches its waiters but is not cached.
    pub async fn invalidate(&self, key: &ProviderKey) -> bool {
        self.invalidate_if(key, |_| true).await
    }

    /// Like [`ProviderCache::invalidate`], but only while the entry still
    /// holds the provider instance `id`.
    pub async fn invalidate_instance(&self, key: &ProviderKey, id: Uuid) -> bool {
        self.invalidate_if(key, |provider| provider.map(Provider::id) == Some(id))
            .await
    }

    async fn invalidate_if(
        &self,
        key: &ProviderKey,
        predicate: impl FnOnce(Option<&Provider>) -> bool,
    ) -> bool {
        let removed = {
            let mut entries = self.entries.lock().await;
            let current = match entries.slots.get(key) {
                Some(Slot::Ready { provider, .. }) => Some(&**provider),
                Some(Slot::Loading { .. }) => None,
                None => return false,
            };
            if !predicate(current) {
                return false;
            }
            entries.slots.remove(key)
        };

        match removed {
            Some(Slot::Ready { provider, .. }) => {
                tracing::info!(provider = %key, id = %provider.id(), "invalidating provider");
                provider.shutdown().await;
                true
            }
            Some(Slot::Loading { .. }) => {
                tracing::info!(provider = %key, "invalidated during construction");
                true
            }
            None => false,
        }
    }

    /// Evict entries older than `ttl` and shut down retired providers.
    pub async fn sweep(&self, ttl: Option<Duration>) -> usize {
        sweep(&self.entries, ttl).await
    }

    /// Refuse new lookups, then shut down every cached provider.
    pub async fn shutdown_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.sweeper.abort();

        let providers: Vec<_> = {
            let mut entries = self.entries.lock().await;
            let mut providers = std::mem::take(&mut entries.retired);
            for (_, slot) in entries.slots.drain() {
                if let Slot::Ready { provider, .. } = slot {
                    providers.push(provider);
                }
            }
            providers
        };

        tracing::info!(count = providers.len(), "shutting down providers");
        let mut shutdowns = JoinSet::new();
        for provider in providers {
            shutdowns.spawn(async move { provider.shutdown().await });
        }
        while shutdowns.join_next().await.is_some() {}
    }
}

async fn sweep(entries: &Mutex<Entries>, ttl: Option<Duration>) -> usize {
    let (expired, retired) = {
        let mut entries = entries.lock().await;
        let expired_keys: Vec<_> = match ttl {
            Some(ttl) => entries
                .slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready { created_at, .. } if created_at.elapsed() >= ttl => {
                        Some(key.clone())
                    }
                    _ => None,
                })
                .collect(),
            None => Vec::new(),
        };

        let mut expired = Vec::with_capacity(expired_keys.len());
        for key in expired_keys {
            if let Some(Slot::Ready { provider, .. }) = entries.slots.remove(&key) {
                tracing::debug!(provider = %key, "provider expired");
                expired.push(provider);
            }
        }
        (expired, std::mem::take(&mut entries.retired))
    };

    let evicted = expired.len();
    for provider in expired.into_iter().chain(retired) {
        provider.shutdown().await;
    }
    evicted
}
