//! Device types and provider cache keys.

use std::fmt;
use std::str::FromStr;

/// Kind of device an installation was registered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceType {
    /// Apple devices, delivered through APNs.
    Ios,
    /// Android devices, delivered through FCM HTTP by default.
    Android,
    /// Android devices delivered over the XMPP connection server.
    AndroidXcs,
    /// Windows devices, delivered through WNS.
    Windows,
    /// Browsers, delivered through Web Push.
    Web,
}

impl DeviceType {
    /// Wire name of the device type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ios => "ios",
            Self::Android => "android",
            Self::AndroidXcs => "androidXcs",
            Self::Windows => "windows",
            Self::Web => "web",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown device type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown device type {0:?}")]
pub struct UnknownDeviceType(pub String);

impl FromStr for DeviceType {
    type Err = UnknownDeviceType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ios" => Ok(Self::Ios),
            "android" => Ok(Self::Android),
            "androidXcs" => Ok(Self::AndroidXcs),
            "windows" => Ok(Self::Windows),
            "web" => Ok(Self::Web),
            other => Err(UnknownDeviceType(other.to_string())),
        }
    }
}

/// Identifies one cached provider: an application and a device type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ProviderKey {
    /// Application (tenant) identifier.
    pub app_id: String,
    /// Device type served by the provider.
    pub device_type: DeviceType,
}

impl ProviderKey {
    /// Create a new key.
    pub fn new(app_id: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            app_id: app_id.into(),
            device_type,
        }
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.app_id, self.device_type)
    }
}
