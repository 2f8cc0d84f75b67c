//! Generic notification model and per-device-type validation.

use std::collections::BTreeMap;

use crate::{DeviceType, DispatchError};

/// Kind of WNS notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WnsType {
    /// Toast with a title and a text line.
    Toast,
    /// Live tile update (not supported).
    Tile,
    /// Badge update (not supported).
    Badge,
    /// Raw data delivered to the app.
    Raw,
}

/// A platform-neutral notification.
///
/// Every field is optional; each platform copies the fields it knows about
/// and leaves absent ones out of the message. Anything without a dedicated
/// field travels in [`Notification::custom`].
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Notification {
    /// Device type of the target, filled in from the installation.
    pub device_type: Option<DeviceType>,
    /// Device token of the target, filled in from the installation.
    pub device_token: Option<String>,

    // Display
    pub alert: Option<String>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub message: Option<String>,
    pub sound: Option<String>,
    pub badge: Option<u32>,
    pub category: Option<String>,
    pub thread_id: Option<String>,
    pub launch_image: Option<String>,
    pub action: Option<String>,

    // Localization
    pub loc_key: Option<String>,
    pub loc_args: Option<Vec<String>>,
    pub title_loc_key: Option<String>,
    pub title_loc_args: Option<Vec<String>>,
    pub action_loc_key: Option<String>,

    // Delivery
    /// APNs style priority (10 immediate, 5 power saving).
    pub priority: Option<u8>,
    /// Seconds the notification stays valid.
    pub expiration_interval: Option<u64>,
    /// Absolute expiry; takes precedence over the interval.
    pub expiration_time: Option<chrono::DateTime<chrono::Utc>>,
    pub collapse_id: Option<String>,
    pub collapse_key: Option<String>,
    /// Overrides `collapse_key` on FCM.
    pub group_id: Option<String>,
    pub content_available: Option<bool>,
    pub mutable_content: Option<bool>,
    pub url_args: Option<Vec<String>>,
    pub mdm: Option<String>,
    pub dry_run: Option<bool>,
    pub delay_while_idle: Option<bool>,

    // Android
    pub message_id: Option<String>,
    pub device_id: Option<String>,
    pub message_icon: Option<String>,
    pub android_badge: Option<u32>,
    pub tag: Option<String>,
    pub color: Option<String>,
    /// Attach a display block so the OS shows the notification itself.
    pub auto_notify: Option<bool>,
    pub push: Option<serde_json::Value>,
    pub live: Option<serde_json::Value>,
    pub track_id: Option<String>,
    pub media_type: Option<String>,
    pub media_url: Option<String>,
    pub click_url: Option<String>,

    // Windows / web
    pub wns_type: Option<WnsType>,
    pub url: Option<String>,

    /// Structured payload forwarded to the app.
    pub data: Option<serde_json::Value>,
    /// Send batch this notification belongs to; a cancelled batch is skipped.
    pub batch_id: Option<String>,
    /// Extra key/value pairs passed through verbatim.
    pub custom: BTreeMap<String, serde_json::Value>,
}

impl Notification {
    /// Notification with just an alert text.
    pub fn alert(text: impl Into<String>) -> Self {
        Self {
            alert: Some(text.into()),
            ..Default::default()
        }
    }

    /// Copy addressed to one installation. The original is left untouched.
    pub fn addressed_to(&self, device_type: DeviceType, device_token: Option<&str>) -> Self {
        let mut copy = self.clone();
        copy.device_type = Some(device_type);
        if let Some(token) = device_token {
            copy.device_token = Some(token.to_string());
        }
        copy
    }

    /// Seconds until the notification expires, `None` for the transport default.
    ///
    /// Zero means the notification expires immediately.
    pub fn ttl_from_now(&self) -> Option<u64> {
        if let Some(at) = self.expiration_time {
            let remaining = (at - chrono::Utc::now()).num_seconds();
            return Some(remaining.max(0) as u64);
        }
        self.expiration_interval
    }

    /// Text shown as the body on Android: `message`, falling back to `body`.
    pub fn android_text(&self) -> Option<&str> {
        self.message.as_deref().or(self.body.as_deref())
    }

    /// Check the fields required for the notification's device type,
    /// including the device token.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.device_token.as_deref().is_none_or(str::is_empty) {
            return Err(DispatchError::Validation("deviceToken is required".into()));
        }
        self.validate_content()
    }

    /// Check the content fields required for the device type, without
    /// requiring a device token (token lists are validated separately).
    pub fn validate_content(&self) -> Result<(), DispatchError> {
        let Some(device_type) = self.device_type else {
            return Err(DispatchError::Validation("deviceType is required".into()));
        };

        let ok = match device_type {
            DeviceType::Ios => {
                self.alert.is_some()
                    || self.title.is_some()
                    || self.body.is_some()
                    || self.badge.is_some()
                    || self.content_available == Some(true)
            }
            DeviceType::Android | DeviceType::AndroidXcs => {
                self.message.is_some()
                    || self.body.is_some()
                    || self.title.is_some()
                    || self.data.is_some()
            }
            DeviceType::Windows => return self.validate_wns(),
            DeviceType::Web => self.alert.is_some(),
        };

        if ok {
            Ok(())
        } else {
            Err(DispatchError::Validation(format!(
                "notification has no content for {device_type}"
            )))
        }
    }

    fn validate_wns(&self) -> Result<(), DispatchError> {
        match self.wns_type {
            Some(WnsType::Toast) if self.title.is_some() || self.body.is_some() => Ok(()),
            Some(WnsType::Toast) => Err(DispatchError::Validation(
                "toast notification needs a title or body".into(),
            )),
            Some(WnsType::Raw) if self.data.is_some() => Ok(()),
            Some(WnsType::Raw) => Err(DispatchError::Validation(
                "raw notification needs data".into(),
            )),
            Some(other) => Err(DispatchError::Validation(format!(
                "unsupported WNS notification type {other:?}"
            ))),
            None => Err(DispatchError::Validation("wnsType is required".into())),
        }
    }
}
