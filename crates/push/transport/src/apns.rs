//! APNs transport using the a2 crate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use a2::NotificationBuilder as _;
use base64::Engine as _;
use push_core::{RecipientError, TransportError};

use crate::{
    ApnsAuth, ApnsMessage, ApnsOptions, Connector, Delivery, Message, PushOptions, Recipient,
    SignalSender, Transport,
};

/// Opens HTTP/2 connections to APNs.
#[derive(Debug, Default, Clone)]
pub struct ApnsConnector;

#[async_trait::async_trait]
impl Connector for ApnsConnector {
    async fn connect(
        &self,
        options: &PushOptions,
        _signals: SignalSender,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let PushOptions::Apns(options) = options else {
            return Err(TransportError::Connection(format!(
                "APNs connector cannot open {} connections",
                options.kind()
            )));
        };

        Ok(Arc::new(ApnsTransport::new(options)?))
    }
}

/// One APNs client.
pub struct ApnsTransport {
    client: a2::Client,
    closed: AtomicBool,
}

impl ApnsTransport {
    /// Create a client for the configured endpoint and credentials.
    pub fn new(options: &ApnsOptions) -> Result<Self, TransportError> {
        let endpoint = if options.production {
            a2::Endpoint::Production
        } else {
            a2::Endpoint::Sandbox
        };
        let config = a2::ClientConfig::new(endpoint);

        let client = match &options.auth {
            ApnsAuth::Token(token) => {
                let mut pem = std::io::Cursor::new(token.key.as_bytes());
                a2::Client::token(&mut pem, &token.key_id, &token.team_id, config)
                    .map_err(|e| TransportError::Auth(format!("invalid APNs signing key: {e}")))?
            }
            ApnsAuth::Certificate {
                cert: Some(cert),
                passphrase,
                ..
            } => {
                let der = base64::engine::general_purpose::STANDARD
                    .decode(cert.trim())
                    .map_err(|e| TransportError::Auth(format!("APNs certificate is not base64: {e}")))?;
                let mut cursor = std::io::Cursor::new(der);
                a2::Client::certificate(&mut cursor, passphrase.as_deref().unwrap_or(""), config)
                    .map_err(|e| TransportError::Auth(format!("invalid APNs certificate: {e}")))?
            }
            ApnsAuth::Certificate { cert: None, .. } => {
                return Err(TransportError::Auth(
                    "APNs certificate bundle required alongside the key".into(),
                ));
            }
        };

        Ok(Self {
            client,
            closed: AtomicBool::new(false),
        })
    }

    async fn send_one(&self, message: &ApnsMessage, token: &str) -> Result<Delivery, TransportError> {
        let mut builder = a2::DefaultNotificationBuilder::new();
        if let Some(title) = &message.title {
            builder = builder.set_title(title);
        }
        if let Some(body) = message.body.as_ref().or(message.alert.as_ref()) {
            builder = builder.set_body(body);
        }
        if let Some(sound) = &message.sound {
            builder = builder.set_sound(sound);
        }
        if let Some(badge) = message.badge {
            builder = builder.set_badge(badge);
        }
        if let Some(category) = &message.category {
            builder = builder.set_category(category);
        }
        if let Some(image) = &message.launch_image {
            builder = builder.set_launch_image(image);
        }
        if let Some(loc_key) = &message.loc_key {
            builder = builder.set_loc_key(loc_key);
        }
        if let Some(title_loc_key) = &message.title_loc_key {
            builder = builder.set_title_loc_key(title_loc_key);
        }
        if let Some(action_loc_key) = &message.action_loc_key {
            builder = builder.set_action_loc_key(action_loc_key);
        }
        if message.content_available {
            builder = builder.set_content_available();
        }
        if message.mutable_content {
            builder = builder.set_mutable_content();
        }

        let priority = match message.priority {
            Some(5) => Some(a2::Priority::Normal),
            Some(_) => Some(a2::Priority::High),
            None => None,
        };

        let mut payload = builder.build(
            token,
            a2::NotificationOptions {
                apns_topic: message.topic.as_deref(),
                apns_expiration: message.expiry,
                apns_priority: priority,
                apns_collapse_id: message
                    .collapse_id
                    .as_deref()
                    .and_then(|id| a2::CollapseId::new(id).ok()),
                ..Default::default()
            },
        );

        for (key, value) in &message.payload {
            payload
                .add_custom_data(key, value)
                .map_err(|e| TransportError::Rejected(format!("bad custom data {key:?}: {e}")))?;
        }

        match self.client.send(payload).await {
            Ok(response) => Ok(Delivery::default().sent(token, response.apns_id)),
            Err(a2::Error::ResponseError(response)) => {
                let reason = response
                    .error
                    .as_ref()
                    .map(|body| format!("{:?}", body.reason))
                    .unwrap_or_else(|| response.code.to_string());

                match response.code {
                    410 => Ok(Delivery::default().failed(token, RecipientError::Unregistered)),
                    403 => Err(TransportError::Auth(reason)),
                    500..=599 => Err(TransportError::Connection(reason)),
                    _ => Ok(Delivery::default().failed(token, RecipientError::Rejected(reason))),
                }
            }
            Err(e) => Err(TransportError::Connection(e.to_string())),
        }
    }
}

#[async_trait::async_trait]
impl Transport for ApnsTransport {
    async fn send(
        &self,
        message: &Message,
        recipient: &Recipient,
    ) -> Result<Delivery, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Connection("APNs client is shut down".into()));
        }
        let Message::Apns(message) = message else {
            return Err(TransportError::Rejected(
                "APNs transport only sends APNs messages".into(),
            ));
        };

        let mut delivery = Delivery::default();
        for token in recipient.targets() {
            let one = self.send_one(message, &token).await?;
            delivery.sent.extend(one.sent);
            delivery.failed.extend(one.failed);
        }

        Ok(delivery)
    }

    async fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("APNs client closed");
        }
    }
}
