//! Pooled transport connections with rotation.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use push_core::TransportError;
use push_transport::{Connector, PushOptions, SignalSender, Transport};
use tokio::sync::{Mutex, Notify, RwLock};

/// Base delay between connect attempts; grows linearly per attempt.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle of one pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Connected,
    /// At least one send is using the connection.
    Active,
    /// Connecting failed, or the last send failed with an auth error.
    Error,
}

/// A transport connection plus the bookkeeping needed to retire it safely.
pub struct Connection {
    id: u64,
    transport: OnceLock<Arc<dyn Transport>>,
    state: Mutex<ConnectionState>,
    leases: AtomicUsize,
    idle: Notify,
}

impl Connection {
    fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            transport: OnceLock::new(),
            state: Mutex::new(ConnectionState::Uninitialized),
            leases: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    /// Pool-unique connection number.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    /// Open the transport. Connection failures are retried up to the
    /// options' retry limit; auth and other errors fail at once.
    async fn connect(
        &self,
        connector: &dyn Connector,
        options: &PushOptions,
        signals: &SignalSender,
    ) -> Result<(), TransportError> {
        *self.state.lock().await = ConnectionState::Connecting;

        let retries = options.connection_retry_limit();
        let mut attempt = 0;
        let result = loop {
            match connector.connect(options, signals.clone()).await {
                Err(TransportError::Connection(reason)) if attempt < retries => {
                    attempt += 1;
                    tracing::warn!(connection = self.id, attempt, retries, %reason, "connect failed, retrying");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                other => break other,
            }
        };

        let mut state = self.state.lock().await;
        match result {
            Ok(transport) => {
                if let Err(extra) = self.transport.set(transport) {
                    extra.shutdown().await;
                }
                *state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                *state = ConnectionState::Error;
                Err(e)
            }
        }
    }

    /// Record the result of a send on this connection.
    pub async fn record(&self, result: Result<(), &TransportError>) {
        let mut state = self.state.lock().await;
        *state = match result {
            Err(e) if e.is_auth() => ConnectionState::Error,
            _ if self.leases.load(Ordering::SeqCst) > 1 => ConnectionState::Active,
            _ => ConnectionState::Connected,
        };
    }

    /// Wait until no send holds a lease on this connection.
    async fn drain(&self) {
        loop {
            let idle = self.idle.notified();
            if self.leases.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    async fn close(&self, drain_timeout: Duration) {
        if tokio::time::timeout(drain_timeout, self.drain()).await.is_err() {
            tracing::warn!(
                connection = self.id,
                in_flight = self.leases.load(Ordering::SeqCst),
                "connection still busy after drain timeout, closing anyway"
            );
        }
        if let Some(transport) = self.transport.get() {
            transport.shutdown().await;
        }
        *self.state.lock().await = ConnectionState::Uninitialized;
    }
}

/// Exclusive use of a connection for one send.
///
/// The connection is not shut down while any lease on it is alive.
pub struct Lease {
    connection: Arc<Connection>,
    transport: Arc<dyn Transport>,
}

impl Lease {
    /// `None` when the connection never came up.
    fn new(connection: Arc<Connection>) -> Option<Self> {
        let transport = connection.transport.get()?.clone();
        connection.leases.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut state) = connection.state.try_lock() {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Active;
            }
        }
        Some(Self {
            connection,
            transport,
        })
    }

    /// The leased connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl Deref for Lease {
    type Target = dyn Transport;

    fn deref(&self) -> &Self::Target {
        &*self.transport
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.connection.leases.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.connection.idle.notify_waiters();
        }
    }
}

/// Ordered set of connections used round-robin.
///
/// Leases are taken under a slot's read lock, and connections are only
/// retired after taking its write lock, so a retired connection's lease
/// count covers every send that can still reach it.
pub struct ConnectionPool {
    slots: Vec<RwLock<Arc<Connection>>>,
    cursor: AtomicUsize,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Open `size` connections. Fails, closing what was opened, if any
    /// connection cannot be established.
    pub async fn open(
        connector: &dyn Connector,
        options: &PushOptions,
        size: usize,
        signals: &SignalSender,
    ) -> Result<Self, TransportError> {
        let mut slots: Vec<RwLock<Arc<Connection>>> = Vec::with_capacity(size.max(1));
        for id in 0..size.max(1) as u64 {
            let connection = Connection::new(id);
            if let Err(e) = connection.connect(connector, options, signals).await {
                for slot in &slots {
                    slot.read().await.close(Duration::ZERO).await;
                }
                return Err(e);
            }
            slots.push(RwLock::new(connection));
        }

        Ok(Self {
            next_id: AtomicU64::new(slots.len() as u64),
            slots,
            cursor: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool has no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Lease the next connection in round-robin order. `None` once closed.
    pub async fn next(&self) -> Option<Lease> {
        if self.slots.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::SeqCst) % self.slots.len();
        let slot = self.slots[index].read().await;
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        Lease::new(slot.clone())
    }

    /// Current state of every slot.
    pub async fn states(&self) -> Vec<ConnectionState> {
        let mut states = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            states.push(slot.read().await.state().await);
        }
        states
    }

    /// Connection ids in slot order.
    pub async fn ids(&self) -> Vec<u64> {
        let mut ids = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            ids.push(slot.read().await.id);
        }
        ids
    }

    /// Replace every connection with a fresh one opened from the same
    /// options. Sends already holding a lease finish on the old connection
    /// before it is shut down. Returns how many slots were replaced.
    pub async fn rotate(
        &self,
        connector: &dyn Connector,
        options: &PushOptions,
        signals: &SignalSender,
        drain_timeout: Duration,
    ) -> usize {
        let mut rotated = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }

            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let fresh = Connection::new(id);
            if let Err(e) = fresh.connect(connector, options, signals).await {
                tracing::warn!(slot = index, error = %e, "rotation failed, keeping old connection");
                continue;
            }

            let old = std::mem::replace(&mut *slot.write().await, fresh);
            tracing::debug!(slot = index, old = old.id, new = id, "connection rotated");
            old.close(drain_timeout).await;
            rotated += 1;
        }
        rotated
    }

    /// Stop handing out connections, let in-flight sends finish, then close
    /// every connection. Idempotent.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for slot in &self.slots {
            // Waits out any lease taken before the pool was closed.
            let connection = slot.write().await.clone();
            connection.close(drain_timeout).await;
        }
    }

    /// Whether [`ConnectionPool::shutdown`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use push_core::ApnsToken;
    use push_transport::{ApnsAuth, ApnsOptions, Delivery, Message, Recipient, WebPushMessage};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Fake {
        sends: AtomicUsize,
        closed: AtomicBool,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait::async_trait]
    impl Transport for Fake {
        async fn send(&self, _m: &Message, r: &Recipient) -> Result<Delivery, TransportError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Connection("closed".into()));
            }
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(Delivery::default().sent(r.targets().remove(0), None))
        }

        async fn shutdown(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        opened: std::sync::Mutex<Vec<Arc<Fake>>>,
        gate: Option<Arc<Notify>>,
        fail: AtomicBool,
        /// Connection errors returned before the first success.
        failures: AtomicUsize,
        attempts: AtomicUsize,
        connect_gate: Option<Arc<Notify>>,
    }

    #[async_trait::async_trait]
    impl Connector for FakeConnector {
        async fn connect(
            &self,
            _options: &PushOptions,
            _signals: SignalSender,
        ) -> Result<Arc<dyn Transport>, TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.connect_gate {
                gate.notified().await;
            }
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(TransportError::Connection("refused".into()));
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::Auth("bad key".into()));
            }
            let fake = Arc::new(Fake {
                gate: self.gate.clone(),
                ..Default::default()
            });
            self.opened.lock().unwrap().push(fake.clone());
            Ok(fake)
        }
    }

    fn options() -> PushOptions {
        options_with_retries(None)
    }

    fn options_with_retries(retries: Option<u32>) -> PushOptions {
        PushOptions::Apns(ApnsOptions {
            auth: ApnsAuth::Token(ApnsToken::default()),
            production: false,
            bundle_id: None,
            connection_retry_limit: retries,
            max_connections: 2,
            concurrency: None,
        })
    }

    fn message() -> Message {
        Message::WebPush(WebPushMessage {
            title: None,
            body: None,
            url: None,
        })
    }

    #[tokio::test]
    async fn test_round_robin() {
        let connector = FakeConnector::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = ConnectionPool::open(&connector, &options(), 2, &tx).await.unwrap();

        let picks: Vec<u64> = lease_ids(&pool, 4).await;
        assert_eq!(picks, vec![0, 1, 0, 1]);
    }

    async fn lease_ids(pool: &ConnectionPool, n: usize) -> Vec<u64> {
        let mut ids = Vec::new();
        for _ in 0..n {
            ids.push(pool.next().await.unwrap().connection().id());
        }
        ids
    }

    #[tokio::test]
    async fn test_open_failure() {
        let connector = FakeConnector::default();
        connector.fail.store(true, Ordering::SeqCst);
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = ConnectionPool::open(&connector, &options(), 2, &tx).await;
        assert!(matches!(result, Err(TransportError::Auth(_))));
    }

    #[tokio::test]
    async fn test_rotation_finishes_in_flight_send() {
        let gate = Arc::new(Notify::new());
        let connector = Arc::new(FakeConnector {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = Arc::new(ConnectionPool::open(&*connector, &options(), 1, &tx).await.unwrap());

        let lease = pool.next().await.unwrap();
        let old_id = lease.connection().id();
        let send = tokio::spawn(async move {
            let result = lease.send(&message(), &Recipient::Token("tok".into())).await;
            drop(lease);
            result
        });

        let rotating = {
            let pool = pool.clone();
            let connector = connector.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                pool.rotate(&*connector, &options(), &tx, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_ne!(pool.ids().await, vec![old_id]);
        let old = connector.opened.lock().unwrap()[0].clone();
        assert!(!old.closed.load(Ordering::SeqCst));

        gate.notify_waiters();
        let delivery = send.await.unwrap().unwrap();
        assert_eq!(delivery.sent.len(), 1);
        assert_eq!(rotating.await.unwrap(), 1);
        assert!(old.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let connector = FakeConnector::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = ConnectionPool::open(&connector, &options(), 2, &tx).await.unwrap();

        pool.shutdown(Duration::from_secs(1)).await;
        pool.shutdown(Duration::from_secs(1)).await;

        assert!(pool.next().await.is_none());
        assert!(
            connector
                .opened
                .lock()
                .unwrap()
                .iter()
                .all(|c| c.closed.load(Ordering::SeqCst))
        );
        assert_eq!(
            pool.states().await,
            vec![ConnectionState::Uninitialized, ConnectionState::Uninitialized]
        );
    }

    #[tokio::test]
    async fn test_open_retries_connection_failures() {
        let connector = FakeConnector {
            failures: AtomicUsize::new(2),
            ..Default::default()
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = ConnectionPool::open(&connector, &options_with_retries(Some(2)), 1, &tx)
            .await
            .unwrap();
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(pool.states().await, vec![ConnectionState::Connected]);

        let connector = FakeConnector {
            failures: AtomicUsize::new(2),
            ..Default::default()
        };
        let result = ConnectionPool::open(&connector, &options_with_retries(Some(1)), 1, &tx).await;
        assert!(matches!(result, Err(TransportError::Connection(_))));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let connector = FakeConnector::default();
        connector.fail.store(true, Ordering::SeqCst);
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = ConnectionPool::open(&connector, &options_with_retries(Some(5)), 1, &tx).await;
        assert!(matches!(result, Err(TransportError::Auth(_))));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rotation_keeps_old_connection_after_retries() {
        let connector = FakeConnector::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let retrying = options_with_retries(Some(1));
        let pool = ConnectionPool::open(&connector, &retrying, 1, &tx).await.unwrap();

        connector.failures.store(2, Ordering::SeqCst);
        let rotated = pool.rotate(&connector, &retrying, &tx, Duration::from_secs(1)).await;
        assert_eq!(rotated, 0);
        assert_eq!(pool.ids().await, vec![0]);
        assert!(pool.next().await.is_some());

        let rotated = pool.rotate(&connector, &retrying, &tx, Duration::from_secs(1)).await;
        assert_eq!(rotated, 1);
        assert_ne!(pool.ids().await, vec![0]);
    }

    #[tokio::test]
    async fn test_connection_states() {
        let gate = Arc::new(Notify::new());
        let connector = Arc::new(FakeConnector {
            connect_gate: Some(gate.clone()),
            ..Default::default()
        });
        let (tx, _rx) = mpsc::unbounded_channel();

        let connection = Connection::new(7);
        assert_eq!(connection.state().await, ConnectionState::Uninitialized);
        assert!(Lease::new(connection.clone()).is_none());

        let connecting = {
            let connection = connection.clone();
            let connector = connector.clone();
            tokio::spawn(async move { connection.connect(&*connector, &options(), &tx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connection.state().await, ConnectionState::Connecting);

        gate.notify_one();
        connecting.await.unwrap().unwrap();
        assert_eq!(connection.state().await, ConnectionState::Connected);

        let lease = Lease::new(connection.clone()).unwrap();
        assert_eq!(connection.state().await, ConnectionState::Active);
        drop(lease);

        connection.close(Duration::from_secs(1)).await;
        assert_eq!(connection.state().await, ConnectionState::Uninitialized);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rotation_and_shutdown_never_close_a_leased_connection() {
        let connector = Arc::new(FakeConnector::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = Arc::new(ConnectionPool::open(&*connector, &options(), 2, &tx).await.unwrap());
        let failures = Arc::new(AtomicUsize::new(0));
        let sends = Arc::new(AtomicUsize::new(0));

        let mut senders = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let failures = failures.clone();
            let sends = sends.clone();
            senders.push(tokio::spawn(async move {
                while let Some(lease) = pool.next().await {
                    match lease.send(&message(), &Recipient::Token("tok".into())).await {
                        Ok(_) => sends.fetch_add(1, Ordering::SeqCst),
                        Err(_) => failures.fetch_add(1, Ordering::SeqCst),
                    };
                    drop(lease);
                    tokio::task::yield_now().await;
                }
            }));
        }

        for _ in 0..300 {
            pool.rotate(&*connector, &options(), &tx, Duration::from_secs(5))
                .await;
        }
        pool.shutdown(Duration::from_secs(5)).await;
        for sender in senders {
            sender.await.unwrap();
        }

        assert_eq!(failures.load(Ordering::SeqCst), 0);
        assert!(sends.load(Ordering::SeqCst) > 0);
        assert!(
            connector
                .opened
                .lock()
                .unwrap()
                .iter()
                .all(|c| c.closed.load(Ordering::SeqCst))
        );
    }
}
