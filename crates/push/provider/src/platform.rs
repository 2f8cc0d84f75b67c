//! Per-platform message shaping and addressing.
//!
//! Every builder copies only the notification fields its platform knows,
//! and only when they are present.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use push_core::{Notification, RecipientError, WnsType};
use push_transport::{
    AndroidDisplay, ApnsMessage, ApnsOptions, FcmMessage, FcmPriority, Message, PlatformKind,
    PushOptions, Recipient, WebPushMessage, WebSubscription, WnsMessage, XcsMessage,
    validate_wns_channel,
};
use serde_json::Value;

/// What the provider should do with one slice of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Planned {
    /// Hand `message` to the transport for `recipient`.
    Send { message: Message, recipient: Recipient },
    /// Fail `recipient` without a transport call.
    Reject {
        recipient: String,
        error: RecipientError,
    },
}

/// Message builder for one platform variant.
#[derive(Debug)]
pub struct Platform {
    options: PushOptions,
    counter: AtomicU64,
}

impl Platform {
    pub fn new(options: PushOptions) -> Self {
        Self {
            options,
            counter: AtomicU64::new(0),
        }
    }

    /// Platform family.
    pub fn kind(&self) -> PlatformKind {
        self.options.kind()
    }

    /// Whether the platform sends a whole token set in one request.
    pub fn batches(&self) -> bool {
        matches!(self.options, PushOptions::Fcm(_))
    }

    /// Split a request into work: one item for the whole set on batching
    /// platforms, one item per target elsewhere.
    pub fn plan(&self, notification: &Notification, recipient: Recipient) -> Vec<Planned> {
        if recipient.is_empty() {
            return Vec::new();
        }

        match &self.options {
            PushOptions::Fcm(_) => vec![Planned::Send {
                message: Message::Fcm(self.fcm(notification)),
                recipient,
            }],
            PushOptions::Apns(options) => {
                let message = Message::Apns(apns(options, notification));
                per_target(recipient, |_| Ok(message.clone()))
            }
            PushOptions::Xcs(_) => {
                let message = Message::Xcs(xcs(notification));
                per_target(recipient, |_| Ok(message.clone()))
            }
            PushOptions::Wns(_) => {
                let message = wns(notification).map(Message::Wns);
                per_target(recipient, |target| {
                    validate_wns_channel(target)?;
                    message.clone()
                })
            }
            PushOptions::WebPush(_) => {
                let message = Message::WebPush(web(notification));
                per_target(recipient, |target| {
                    WebSubscription::parse(target)?;
                    Ok(message.clone())
                })
            }
        }
    }

    fn fcm(&self, n: &Notification) -> FcmMessage {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst) + 1;

        let mut data = android_data(n);
        put(&mut data, "sound", n.sound.as_ref());
        put(&mut data, "color", n.color.as_ref());
        put(&mut data, "tag", n.tag.as_ref());
        put(&mut data, "mediaType", n.media_type.as_ref());
        put(&mut data, "mediaUrl", n.media_url.as_ref());
        put(&mut data, "clickUrl", n.click_url.as_ref());

        let notification = n.auto_notify.unwrap_or(false).then(|| AndroidDisplay {
            title: n.title.clone().or_else(|| n.android_text().map(str::to_string)),
            body: n.body.clone().or_else(|| n.message.clone()),
            icon: n.message_icon.clone(),
            badge: n.android_badge,
            sound: n.sound.clone(),
            tag: n.tag.clone(),
            color: n.color.clone(),
        });

        FcmMessage {
            priority: if n.priority == Some(10) {
                FcmPriority::High
            } else {
                FcmPriority::Normal
            },
            time_to_live: n.ttl_from_now(),
            dry_run: n.dry_run.unwrap_or(false),
            collapse_key: n.group_id.clone().or_else(|| n.collapse_key.clone()),
            delay_while_idle: n.delay_while_idle.unwrap_or(false),
            message_id: Some(format!(
                "{}:{}:{counter}",
                n.message_id.as_deref().unwrap_or_default(),
                n.device_id.as_deref().unwrap_or_default(),
            )),
            data,
            notification,
        }
    }
}

fn per_target(
    recipient: Recipient,
    mut build: impl FnMut(&str) -> Result<Message, RecipientError>,
) -> Vec<Planned> {
    let single = |target: String| -> Recipient {
        match &recipient {
            Recipient::Topic(_) => Recipient::Topic(target),
            _ => Recipient::Token(target),
        }
    };

    recipient
        .targets()
        .into_iter()
        .map(|target| match build(&target) {
            Ok(message) => Planned::Send {
                message,
                recipient: single(target),
            },
            Err(error) => Planned::Reject {
                recipient: target,
                error,
            },
        })
        .collect()
}

fn put<T: serde::Serialize>(data: &mut BTreeMap<String, Value>, key: &str, value: Option<T>) {
    if let Some(value) = value.and_then(|v| serde_json::to_value(v).ok()) {
        data.insert(key.to_string(), value);
    }
}

/// Data keys shared by both Android transports.
fn android_data(n: &Notification) -> BTreeMap<String, Value> {
    let mut data = BTreeMap::new();
    put(&mut data, "title", n.title.as_ref());
    put(&mut data, "message", n.android_text());
    put(&mut data, "messageId", n.message_id.as_ref());
    put(&mut data, "deviceId", n.device_id.as_ref());
    put(&mut data, "push", n.push.as_ref());
    put(&mut data, "data", n.data.as_ref());
    put(&mut data, "live", n.live.as_ref());
    put(&mut data, "androidBadge", n.android_badge);
    put(&mut data, "trackId", n.track_id.as_ref());
    for (key, value) in &n.custom {
        data.insert(key.clone(), value.clone());
    }
    data
}

fn apns(options: &ApnsOptions, n: &Notification) -> ApnsMessage {
    let content_available = n.content_available.unwrap_or(false);

    let mut payload = n.custom.clone();
    if let Some(data) = &n.data {
        payload.insert("data".into(), data.clone());
    }

    ApnsMessage {
        alert: n.alert.clone(),
        title: n.title.clone(),
        body: n.body.clone(),
        sound: n.sound.clone(),
        badge: n.badge,
        loc_key: n.loc_key.clone(),
        loc_args: n.loc_args.clone(),
        title_loc_key: n.title_loc_key.clone(),
        title_loc_args: n.title_loc_args.clone(),
        action: n.action.clone(),
        action_loc_key: n.action_loc_key.clone(),
        launch_image: n.launch_image.clone(),
        expiry: n
            .ttl_from_now()
            .map(|ttl| chrono::Utc::now().timestamp().max(0) as u64 + ttl),
        priority: if content_available { Some(5) } else { n.priority },
        category: n.category.clone(),
        collapse_id: n.collapse_id.clone(),
        thread_id: n.thread_id.clone(),
        content_available,
        mutable_content: n.mutable_content.unwrap_or(false),
        url_args: n.url_args.clone(),
        mdm: n.mdm.clone(),
        topic: options.bundle_id.clone(),
        payload,
    }
}

fn xcs(n: &Notification) -> XcsMessage {
    let notification = n.message_icon.as_ref().map(|icon| {
        let (title, body) = match &n.title {
            Some(title) => (Some(title.clone()), n.body.clone().or_else(|| n.message.clone())),
            None => (n.android_text().map(str::to_string), None),
        };
        AndroidDisplay {
            title,
            body,
            icon: Some(icon.clone()),
            badge: n.android_badge,
            sound: n.sound.clone(),
            tag: n.tag.clone(),
            color: n.color.clone(),
        }
    });

    XcsMessage {
        message_id: format!(
            "{}:{}",
            n.message_id.as_deref().unwrap_or_default(),
            n.device_id.as_deref().unwrap_or_default(),
        ),
        priority: if n.priority == Some(10) { 2 } else { 1 },
        time_to_live: n.ttl_from_now(),
        collapse_key: n.collapse_key.clone(),
        dry_run: n.dry_run.unwrap_or(false),
        delay_while_idle: n.delay_while_idle.unwrap_or(false),
        delivery_receipt_requested: true,
        data: android_data(n),
        notification,
    }
}

fn wns(n: &Notification) -> Result<WnsMessage, RecipientError> {
    match n.wns_type {
        Some(WnsType::Toast) => Ok(WnsMessage::Toast {
            text1: n.title.clone(),
            text2: n.body.clone().or_else(|| n.message.clone()),
        }),
        Some(WnsType::Raw) => {
            let payload = serde_json::to_string(n.data.as_ref().unwrap_or(&Value::Null))
                .map_err(|e| RecipientError::Rejected(format!("cannot encode raw payload: {e}")))?;
            Ok(WnsMessage::Raw { payload })
        }
        other => Err(RecipientError::Rejected(format!(
            "unsupported WNS notification type {other:?}"
        ))),
    }
}

fn web(n: &Notification) -> WebPushMessage {
    WebPushMessage {
        title: n.alert.clone(),
        body: n.body.clone().or_else(|| n.alert.clone()),
        url: n.url.clone(),
    }
}
