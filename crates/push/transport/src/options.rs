//! Transport options resolved once from an application's push settings.

use std::fmt;

use push_core::{
    AndroidProvider, ApnsSettings, ApnsToken, DeviceType, GcmSettings, PushSettings, WebSettings,
    WnsSettings,
};

const DEFAULT_WEB_MAILTO: &str = "mailto:push@localhost";

/// Push service family a provider talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformKind {
    Apns,
    Fcm,
    Xcs,
    Wns,
    WebPush,
}

impl PlatformKind {
    /// Short lowercase name, used in metric paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Apns => "apns",
            Self::Fcm => "gcm",
            Self::Xcs => "xcs",
            Self::Wns => "wns",
            Self::WebPush => "web",
        }
    }
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings were missing or incomplete for the requested device type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OptionsError {
    #[error("no {0} settings configured")]
    Missing(&'static str),
    #[error("{platform} setting {field} is required")]
    Required {
        platform: &'static str,
        field: &'static str,
    },
    #[error("APNs certificate or token not set, either set one of token, cert/key fields")]
    ApnsCredentials,
}

/// APNs authentication material.
#[derive(Debug, Clone, PartialEq)]
pub enum ApnsAuth {
    /// `.p8` signing key.
    Token(ApnsToken),
    /// Client certificate and/or private key.
    Certificate {
        cert: Option<String>,
        key: Option<String>,
        passphrase: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApnsOptions {
    pub auth: ApnsAuth,
    pub production: bool,
    pub bundle_id: Option<String>,
    pub connection_retry_limit: Option<u32>,
    pub max_connections: usize,
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FcmOptions {
    pub server_api_key: String,
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct XcsOptions {
    pub sender_id: String,
    pub server_api_key: String,
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WnsOptions {
    pub client_id: String,
    pub client_secret: String,
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebPushOptions {
    pub mailto: String,
    pub public_key: String,
    pub private_key: String,
    pub concurrency: Option<usize>,
}

/// Immutable transport configuration for one provider.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOptions {
    Apns(ApnsOptions),
    Fcm(FcmOptions),
    Xcs(XcsOptions),
    Wns(WnsOptions),
    WebPush(WebPushOptions),
}

impl PushOptions {
    /// Pick the platform for a device type and pull its options out of the
    /// application's settings.
    pub fn resolve(device_type: DeviceType, settings: &PushSettings) -> Result<Self, OptionsError> {
        match device_type {
            DeviceType::Ios => apns(settings.apns.as_ref()).map(Self::Apns),
            DeviceType::Android => match settings.android_provider {
                Some(AndroidProvider::AndroidXcs) => xcs(settings.gcm.as_ref()).map(Self::Xcs),
                _ => fcm(settings.gcm.as_ref()).map(Self::Fcm),
            },
            DeviceType::AndroidXcs => xcs(settings.gcm.as_ref()).map(Self::Xcs),
            DeviceType::Windows => wns(settings.wns.as_ref()).map(Self::Wns),
            DeviceType::Web => web(settings.web.as_ref()).map(Self::WebPush),
        }
    }

    /// Platform family.
    pub fn kind(&self) -> PlatformKind {
        match self {
            Self::Apns(_) => PlatformKind::Apns,
            Self::Fcm(_) => PlatformKind::Fcm,
            Self::Xcs(_) => PlatformKind::Xcs,
            Self::Wns(_) => PlatformKind::Wns,
            Self::WebPush(_) => PlatformKind::WebPush,
        }
    }

    /// Configured queue concurrency, if any.
    pub fn concurrency(&self) -> Option<usize> {
        match self {
            Self::Apns(o) => o.concurrency,
            Self::Fcm(o) => o.concurrency,
            Self::Xcs(o) => o.concurrency,
            Self::Wns(o) => o.concurrency,
            Self::WebPush(o) => o.concurrency,
        }
    }

    /// Extra connect attempts after a connection failure.
    pub fn connection_retry_limit(&self) -> u32 {
        match self {
            Self::Apns(o) => o.connection_retry_limit.unwrap_or(0),
            _ => 0,
        }
    }

    /// Number of pooled connections.
    pub fn pool_size(&self) -> usize {
        match self {
            Self::Apns(o) => o.max_connections.max(1),
            _ => 1,
        }
    }
}

fn required(
    value: Option<&String>,
    platform: &'static str,
    field: &'static str,
) -> Result<String, OptionsError> {
    value
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or(OptionsError::Required { platform, field })
}

fn apns(settings: Option<&ApnsSettings>) -> Result<ApnsOptions, OptionsError> {
    let s = settings.ok_or(OptionsError::Missing("apns"))?;

    let auth = match (&s.token, &s.cert, &s.key) {
        (Some(token), _, _) => ApnsAuth::Token(token.clone()),
        (None, None, None) => return Err(OptionsError::ApnsCredentials),
        (None, cert, key) => ApnsAuth::Certificate {
            cert: cert.clone(),
            key: key.clone(),
            passphrase: s.passphrase.clone(),
        },
    };

    Ok(ApnsOptions {
        auth,
        production: s.production,
        bundle_id: s.bundle_id.clone(),
        connection_retry_limit: s.connection_retry_limit,
        max_connections: s.max_connections.unwrap_or(1),
        concurrency: s.concurrency,
    })
}

fn fcm(settings: Option<&GcmSettings>) -> Result<FcmOptions, OptionsError> {
    let s = settings.ok_or(OptionsError::Missing("gcm"))?;
    Ok(FcmOptions {
        server_api_key: required(s.server_api_key.as_ref(), "gcm", "serverApiKey")?,
        concurrency: s.concurrency,
    })
}

fn xcs(settings: Option<&GcmSettings>) -> Result<XcsOptions, OptionsError> {
    let s = settings.ok_or(OptionsError::Missing("gcm"))?;
    Ok(XcsOptions {
        sender_id: required(s.sender_id.as_ref(), "gcm", "senderId")?,
        server_api_key: required(s.server_api_key.as_ref(), "gcm", "serverApiKey")?,
        concurrency: s.concurrency,
    })
}

fn wns(settings: Option<&WnsSettings>) -> Result<WnsOptions, OptionsError> {
    let s = settings.ok_or(OptionsError::Missing("wns"))?;
    Ok(WnsOptions {
        client_id: required(s.client_id.as_ref(), "wns", "clientId")?,
        client_secret: required(s.client_secret.as_ref(), "wns", "clientSecret")?,
        concurrency: s.concurrency,
    })
}

fn web(settings: Option<&WebSettings>) -> Result<WebPushOptions, OptionsError> {
    let s = settings.ok_or(OptionsError::Missing("web"))?;
    Ok(WebPushOptions {
        mailto: s
            .mailto
            .clone()
            .unwrap_or_else(|| DEFAULT_WEB_MAILTO.to_string()),
        public_key: required(s.public_key.as_ref(), "web", "publicKey")?,
        private_key: required(s.private_key.as_ref(), "web", "privateKey")?,
        concurrency: s.concurrency,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apns_requires_credentials() {
        let settings = PushSettings {
            apns: Some(ApnsSettings::default()),
            ..Default::default()
        };
        assert_eq!(
            PushOptions::resolve(DeviceType::Ios, &settings),
            Err(OptionsError::ApnsCredentials)
        );

        let settings = PushSettings {
            apns: Some(ApnsSettings {
                key: Some("pem".into()),
                max_connections: Some(3),
                connection_retry_limit: Some(4),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = PushOptions::resolve(DeviceType::Ios, &settings).unwrap();
        assert_eq!(options.kind(), PlatformKind::Apns);
        assert_eq!(options.pool_size(), 3);
        assert_eq!(options.connection_retry_limit(), 4);
    }

    #[test]
    fn test_android_provider_override() {
        let gcm = GcmSettings {
            server_api_key: Some("key".into()),
            sender_id: Some("1234".into()),
            concurrency: Some(10),
        };
        let mut settings = PushSettings {
            gcm: Some(gcm),
            ..Default::default()
        };

        let options = PushOptions::resolve(DeviceType::Android, &settings).unwrap();
        assert_eq!(options.kind(), PlatformKind::Fcm);
        assert_eq!(options.concurrency(), Some(10));
        assert_eq!(options.connection_retry_limit(), 0);

        settings.android_provider = Some(AndroidProvider::AndroidXcs);
        let options = PushOptions::resolve(DeviceType::Android, &settings).unwrap();
        assert_eq!(options.kind(), PlatformKind::Xcs);
    }

    #[test]
    fn test_xcs_needs_sender_id() {
        let settings = PushSettings {
            gcm: Some(GcmSettings {
                server_api_key: Some("key".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            PushOptions::resolve(DeviceType::AndroidXcs, &settings),
            Err(OptionsError::Required {
                platform: "gcm",
                field: "senderId"
            })
        );
    }

    #[test]
    fn test_missing_block() {
        let settings = PushSettings::default();
        assert_eq!(
            PushOptions::resolve(DeviceType::Windows, &settings),
            Err(OptionsError::Missing("wns"))
        );
    }

    #[test]
    fn test_web_default_mailto() {
        let settings = PushSettings {
            web: Some(WebSettings {
                public_key: Some("pub".into()),
                private_key: Some("priv".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let PushOptions::WebPush(options) = PushOptions::resolve(DeviceType::Web, &settings).unwrap()
        else {
            panic!("expected web push options");
        };
        assert_eq!(options.mailto, DEFAULT_WEB_MAILTO);
    }
}
