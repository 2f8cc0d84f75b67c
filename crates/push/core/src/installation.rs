//! Installations, applications and per-platform push settings.

use crate::DeviceType;

/// A device registered to receive notifications for an application.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Installation {
    /// Installation identifier.
    pub id: String,
    /// Owning application.
    pub app_id: String,
    /// Device type the token belongs to.
    pub device_type: DeviceType,
    /// Push token, channel URI or web subscription.
    pub device_token: String,
    /// User the installation is bound to.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Installation status, e.g. "active".
    #[serde(default)]
    pub status: Option<String>,
}

/// Filter for selecting installations. Absent fields match everything.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstallationQuery {
    pub app_id: Option<String>,
    pub device_type: Option<DeviceType>,
    pub user_id: Option<String>,
    pub status: Option<String>,
}

impl InstallationQuery {
    /// Whether an installation satisfies every present field.
    pub fn matches(&self, installation: &Installation) -> bool {
        fn field<T: PartialEq>(want: &Option<T>, have: &T) -> bool {
            want.as_ref().is_none_or(|w| w == have)
        }

        field(&self.app_id, &installation.app_id)
            && field(&self.device_type, &installation.device_type)
            && self
                .user_id
                .as_ref()
                .is_none_or(|u| installation.user_id.as_ref() == Some(u))
            && self
                .status
                .as_ref()
                .is_none_or(|s| installation.status.as_ref() == Some(s))
    }
}

/// A tenant application.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    /// Application identifier.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Push credentials; an application without them cannot push.
    #[serde(default)]
    pub push_settings: Option<PushSettings>,
}

/// Per-platform push credentials and tuning for one application.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PushSettings {
    pub apns: Option<ApnsSettings>,
    pub gcm: Option<GcmSettings>,
    pub wns: Option<WnsSettings>,
    pub web: Option<WebSettings>,
    /// Transport used for `android` installations.
    pub android_provider: Option<AndroidProvider>,
}

/// Transport choice for Android devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AndroidProvider {
    /// FCM over HTTP.
    Android,
    /// FCM over the XMPP connection server.
    AndroidXcs,
}

/// APNs credentials.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApnsSettings {
    /// PKCS#12 certificate bundle, base64 or PEM depending on the connector.
    pub cert: Option<String>,
    /// Private key paired with the certificate.
    pub key: Option<String>,
    /// Passphrase for the certificate bundle.
    pub passphrase: Option<String>,
    /// Token based authentication.
    pub token: Option<ApnsToken>,
    /// Use the production gateway instead of the sandbox.
    pub production: bool,
    /// Topic attached to every notification.
    pub bundle_id: Option<String>,
    pub connection_retry_limit: Option<u32>,
    /// Number of pooled connections; defaults to one.
    pub max_connections: Option<usize>,
    /// Queue concurrency bound.
    pub concurrency: Option<usize>,
}

/// APNs `.p8` signing key.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApnsToken {
    /// PEM contents of the signing key.
    pub key: String,
    pub key_id: String,
    pub team_id: String,
}

/// FCM credentials, shared by the HTTP and XMPP transports.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GcmSettings {
    pub server_api_key: Option<String>,
    /// Required by the XMPP transport.
    pub sender_id: Option<String>,
    /// Queue concurrency bound.
    pub concurrency: Option<usize>,
}

/// WNS client credentials.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WnsSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub concurrency: Option<usize>,
}

/// VAPID details for Web Push.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebSettings {
    pub mailto: Option<String>,
    pub public_key: Option<String>,
    pub private_key: Option<String>,
    pub concurrency: Option<usize>,
}
