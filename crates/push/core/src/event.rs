//! Normalized provider events.

use std::sync::Arc;

use crate::{DeviceType, Notification, RecipientError, TransportError};

/// Uniform event emitted by every provider, whatever its transport.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// A recipient accepted the notification.
    Transmitted {
        notification: Arc<Notification>,
        /// Identifier assigned by the push service.
        message_id: Option<String>,
        recipient: Option<String>,
    },
    /// Delivery to one recipient failed.
    TransmissionError {
        error: RecipientError,
        notification: Arc<Notification>,
        recipient: String,
        description: Option<String>,
    },
    /// Tokens that are permanently invalid; their installations should be
    /// deactivated.
    DevicesGone {
        tokens: Vec<String>,
        notification: Option<Arc<Notification>>,
    },
    /// The provider itself failed (credentials or connection).
    Fatal { error: TransportError },
    /// A persistent connection came up.
    Connected,
    /// A persistent connection went down.
    Disconnected,
    /// Delivery receipt from the connection server.
    Receipt {
        message_id: String,
        /// Device id split off a `messageId:deviceId` receipt id.
        device_id: Option<String>,
        from: String,
        category: Option<String>,
        data: serde_json::Value,
    },
    /// Message sent upstream by a device.
    Upstream {
        message_id: String,
        from: String,
        category: Option<String>,
        data: serde_json::Value,
    },
}

impl ProviderEvent {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Transmitted { .. } => "transmitted",
            Self::TransmissionError { .. } => "transmissionError",
            Self::DevicesGone { .. } => "devicesGone",
            Self::Fatal { .. } => "error",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Receipt { .. } => "receipt",
            Self::Upstream { .. } => "upstream",
        }
    }
}

/// A provider event annotated with the tenant it belongs to.
#[derive(Debug, Clone)]
pub struct DispatchEvent {
    pub app_id: String,
    pub device_type: DeviceType,
    pub event: ProviderEvent,
}
