//! Error taxonomy shared by every layer of the dispatch core.
//!
//! All errors are `Clone`: a single failed provider construction is handed
//! to every caller that was waiting on it.

use crate::ProviderKey;

/// Failure reported by a transport for a whole send call or connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Credentials were refused; the provider must be rebuilt.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The connection broke or could not be established.
    #[error("connection failed: {0}")]
    Connection(String),
    /// The push service refused the request as a whole.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Authentication failures invalidate the cached provider.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Errors that concern the provider rather than a single request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Connection(_))
    }
}

/// Failure affecting exactly one recipient.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecipientError {
    /// The token is no longer registered with the push service.
    #[error("recipient is no longer registered")]
    Unregistered,
    /// The push service rejected this recipient.
    #[error("{0}")]
    Rejected(String),
    /// The token could not be turned into an address.
    #[error("invalid device token: {0}")]
    InvalidToken(String),
    /// The whole send call failed and took this recipient with it.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RecipientError {
    /// Whether the installation behind this recipient should be deactivated.
    pub fn is_device_gone(&self) -> bool {
        matches!(self, Self::Unregistered)
    }
}

/// Errors surfaced by dispatch operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    /// The notification or target failed validation; never retried.
    #[error("invalid notification: {0}")]
    Validation(String),
    /// An application or installation does not exist.
    #[error("{kind} {id:?} not found")]
    NotFound {
        /// What was looked up.
        kind: &'static str,
        /// The identifier that was not found.
        id: String,
    },
    /// A provider could not be set up; nothing was cached.
    #[error("cannot set up provider {key}: {reason}")]
    Construction {
        /// The provider that failed to build.
        key: ProviderKey,
        /// Human readable cause.
        reason: String,
    },
    /// The transport failed the whole request.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A store collaborator failed.
    #[error("lookup failed: {0}")]
    Lookup(String),
    /// The manager or queue no longer accepts work.
    #[error("dispatch is shutting down")]
    ShuttingDown,
    /// A completion was dropped without being fired.
    #[error("work item dropped before completion")]
    Dropped,
}

impl DispatchError {
    /// Shorthand for a missing application.
    pub fn app_not_found(app_id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "application",
            id: app_id.into(),
        }
    }

    /// Shorthand for a missing installation.
    pub fn installation_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "installation",
            id: id.into(),
        }
    }

    /// Shorthand for a construction failure.
    pub fn construction(key: &ProviderKey, reason: impl std::fmt::Display) -> Self {
        Self::Construction {
            key: key.clone(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeviceType;

    #[test]
    fn test_fatal_classes() {
        assert!(TransportError::Auth("401".into()).is_auth());
        assert!(TransportError::Connection("reset".into()).is_fatal());
        assert!(!TransportError::Connection("reset".into()).is_auth());
        assert!(!TransportError::Rejected("bad payload".into()).is_fatal());
    }

    #[test]
    fn test_messages() {
        let key = ProviderKey::new("acme", DeviceType::Ios);
        let err = DispatchError::construction(&key, "no credentials");
        assert_eq!(
            err.to_string(),
            "cannot set up provider acme:ios: no credentials"
        );
        assert_eq!(
            DispatchError::app_not_found("nope").to_string(),
            "application \"nope\" not found"
        );
    }
}
