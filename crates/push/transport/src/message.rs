//! Platform-shaped messages handed to transports.
//!
//! Each shape lists exactly the fields its platform understands. Absent
//! fields are skipped when serialized, never sent as empty values.

use std::collections::BTreeMap;

use push_core::RecipientError;

/// A message in the shape of one push service.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Apns(ApnsMessage),
    Fcm(FcmMessage),
    Xcs(XcsMessage),
    Wns(WnsMessage),
    WebPush(WebPushMessage),
}

impl Message {
    /// Identifier the dispatcher assigned, when the platform carries one.
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::Fcm(m) => m.message_id.as_deref(),
            Self::Xcs(m) => Some(&m.message_id),
            _ => None,
        }
    }
}

/// APNs alert payload.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApnsMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub badge: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loc_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loc_args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title_loc_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title_loc_args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_loc_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launch_image: Option<String>,
    /// Unix timestamp after which APNs discards the notification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collapse_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub content_available: bool,
    pub mutable_content: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mdm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Custom keys placed at the payload root.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub payload: BTreeMap<String, serde_json::Value>,
}

/// FCM delivery priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FcmPriority {
    Normal,
    High,
}

/// Display block the Android OS renders on its own.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct AndroidDisplay {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub badge: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// FCM HTTP message.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FcmMessage {
    pub priority: FcmPriority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_live: Option<u64>,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collapse_key: Option<String>,
    pub delay_while_idle: bool,
    /// `messageId:deviceId:counter`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub data: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<AndroidDisplay>,
}

/// FCM message sent over the XMPP connection server.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct XcsMessage {
    /// `messageId:deviceId`, echoed back in receipts.
    pub message_id: String,
    /// 2 for high, 1 for normal.
    pub priority: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_live: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collapse_key: Option<String>,
    pub dry_run: bool,
    pub delay_while_idle: bool,
    pub delivery_receipt_requested: bool,
    pub data: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<AndroidDisplay>,
}

/// WNS notification body.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WnsMessage {
    /// ToastText02 template.
    Toast {
        #[serde(skip_serializing_if = "Option::is_none")]
        text1: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        text2: Option<String>,
    },
    /// Raw JSON payload.
    Raw { payload: String },
}

/// Web Push payload.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct WebPushMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Browser push subscription, carried as the device token.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WebSubscription {
    pub endpoint: String,
    pub keys: WebSubscriptionKeys,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WebSubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

impl WebSubscription {
    /// Parse a device token holding a JSON subscription.
    pub fn parse(token: &str) -> Result<Self, RecipientError> {
        let sub: Self = serde_json::from_str(token)
            .map_err(|e| RecipientError::InvalidToken(format!("bad web subscription: {e}")))?;
        if sub.endpoint.is_empty() {
            return Err(RecipientError::InvalidToken(
                "web subscription has no endpoint".into(),
            ));
        }
        Ok(sub)
    }
}

/// Check a WNS channel URI: `http(s)://<host>.notify.windows.com/<path>`,
/// path at most 500 characters.
pub fn validate_wns_channel(uri: &str) -> Result<(), RecipientError> {
    let invalid = || RecipientError::InvalidToken(format!("not a WNS channel URI: {uri}"));

    let rest = uri
        .strip_prefix("https://")
        .or_else(|| uri.strip_prefix("http://"))
        .ok_or_else(invalid)?;
    let (host, path) = rest.split_once('/').ok_or_else(invalid)?;

    let host_ok = host
        .strip_suffix(".notify.windows.com")
        .is_some_and(|prefix| {
            !prefix.is_empty()
                && prefix
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        });
    let path_ok = path.chars().count() <= 500 && !path.chars().any(char::is_whitespace);

    if host_ok && path_ok {
        Ok(())
    } else {
        Err(invalid())
    }
}
