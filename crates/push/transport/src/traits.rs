//! Transport capability traits.

use std::sync::Arc;

use push_core::{RecipientError, TransportError};
use tokio::sync::mpsc;

use crate::{Message, PlatformKind, PushOptions};

/// Who a message is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// A single device token (or channel URI / web subscription).
    Token(String),
    /// Every device subscribed to a topic.
    Topic(String),
    /// A set of registration tokens sent in one request.
    Tokens(Vec<String>),
}

impl Recipient {
    /// Individual targets, in the order the transport reports them.
    pub fn targets(&self) -> Vec<String> {
        match self {
            Self::Token(t) | Self::Topic(t) => vec![t.clone()],
            Self::Tokens(ts) => ts.clone(),
        }
    }

    /// Number of individual targets.
    pub fn len(&self) -> usize {
        match self {
            Self::Token(_) | Self::Topic(_) => 1,
            Self::Tokens(ts) => ts.len(),
        }
    }

    /// Whether there is nobody to send to.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A recipient that accepted the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub recipient: String,
    /// Identifier assigned by the push service.
    pub message_id: Option<String>,
}

/// A recipient the push service refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failed {
    pub recipient: String,
    pub error: RecipientError,
    pub description: Option<String>,
}

/// Per-recipient outcome of one send call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub sent: Vec<Sent>,
    pub failed: Vec<Failed>,
}

impl Delivery {
    /// Record a successful recipient.
    pub fn sent(mut self, recipient: impl Into<String>, message_id: Option<String>) -> Self {
        self.sent.push(Sent {
            recipient: recipient.into(),
            message_id,
        });
        self
    }

    /// Record a failed recipient.
    pub fn failed(mut self, recipient: impl Into<String>, error: RecipientError) -> Self {
        self.failed.push(Failed {
            recipient: recipient.into(),
            error,
            description: None,
        });
        self
    }
}

/// Out-of-band notices a connection raises on its own.
#[derive(Debug, Clone)]
pub enum TransportSignal {
    Connected,
    Disconnected,
    /// Delivery receipt for an earlier message.
    Receipt {
        message_id: String,
        from: String,
        category: Option<String>,
        data: serde_json::Value,
    },
    /// Message originating from a device.
    Upstream {
        message_id: String,
        from: String,
        category: Option<String>,
        data: serde_json::Value,
    },
    /// Connection level failure outside any send call.
    Error(TransportError),
}

/// Channel a connection uses to raise [`TransportSignal`]s.
pub type SignalSender = mpsc::UnboundedSender<TransportSignal>;

/// One live connection to a push service.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a message.
    ///
    /// Returns the per-recipient outcome, or an error when the call failed
    /// as a whole. Retries, if any, happen inside the transport.
    async fn send(&self, message: &Message, recipient: &Recipient)
    -> Result<Delivery, TransportError>;

    /// Close the connection. Called once, after in-flight sends finish.
    async fn shutdown(&self);
}

/// Opens transport connections.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection configured by `options`.
    async fn connect(
        &self,
        options: &PushOptions,
        signals: SignalSender,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Routes connection requests to the connector registered for each platform.
#[derive(Default, Clone)]
pub struct ConnectorSet {
    connectors: Vec<(PlatformKind, Arc<dyn Connector>)>,
}

impl ConnectorSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the connector for a platform, replacing any previous one.
    pub fn with(mut self, kind: PlatformKind, connector: Arc<dyn Connector>) -> Self {
        self.connectors.retain(|(k, _)| *k != kind);
        self.connectors.push((kind, connector));
        self
    }
}

#[async_trait::async_trait]
impl Connector for ConnectorSet {
    async fn connect(
        &self,
        options: &PushOptions,
        signals: SignalSender,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let kind = options.kind();
        let connector = self
            .connectors
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, c)| c.clone())
            .ok_or_else(|| {
                TransportError::Connection(format!("no transport registered for {kind}"))
            })?;

        connector.connect(options, signals).await
    }
}
