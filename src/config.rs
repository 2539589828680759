//! Konfiguration des Call Session Coordinators
//!
//! Werte kommen aus Umgebungsvariablen, mit Defaults für die lokale
//! Entwicklung.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Default Signaling URL (kann über `SIGNALING_URL` überschrieben werden)
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid signaling URL '{url}': {reason}")]
    InvalidSignalingUrl { url: String, reason: String },

    #[error("Invalid value for {name}: {value}")]
    InvalidNumber { name: &'static str, value: String },
}

/// Ein STUN/TURN Server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ],
        username: String::new(),
        credential: String::new(),
    }]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub signaling_url: Url,
    pub ice_servers: Vec<IceServerConfig>,
    /// Watchdog für `connecting`; `None` deaktiviert
    pub setup_timeout: Option<Duration>,
    /// Watchdog für `ringing`; `None` deaktiviert
    pub ring_timeout: Option<Duration>,
    /// Obergrenze für den Mikrofon-Zugriff
    pub media_timeout: Duration,
    pub event_log_capacity: usize,
}

impl CoordinatorConfig {
    /// Standardwerte für eine gegebene Signaling URL
    pub fn with_signaling_url(signaling_url: Url) -> Self {
        Self {
            signaling_url,
            ice_servers: default_ice_servers(),
            setup_timeout: Some(Duration::from_secs(45)),
            ring_timeout: Some(Duration::from_secs(60)),
            media_timeout: Duration::from_secs(10),
            event_log_capacity: crate::event_log::DEFAULT_CAPACITY,
        }
    }

    /// Standardwerte für die lokale Entwicklung, ohne Umgebung
    pub fn local() -> Result<Self, ConfigError> {
        Self::from_lookup(|_| None)
    }

    /// Lädt die Konfiguration aus der Prozess-Umgebung
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Lädt die Konfiguration über eine beliebige Lookup-Funktion
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_url = lookup("SIGNALING_URL");
        let signaling_url =
            parse_signaling_url(raw_url.as_deref().unwrap_or(DEFAULT_SIGNALING_URL))?;
        let mut config = Self::with_signaling_url(signaling_url);

        let mut ice_servers = Vec::new();
        if let Some(urls) = lookup("STUN_URLS") {
            let list: Vec<String> = urls
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !list.is_empty() {
                ice_servers.push(IceServerConfig {
                    urls: list,
                    username: String::new(),
                    credential: String::new(),
                });
            }
        }
        if let (Some(url), Some(username), Some(credential)) = (
            lookup("TURN_URL"),
            lookup("TURN_USERNAME"),
            lookup("TURN_PASSWORD"),
        ) {
            ice_servers.push(IceServerConfig {
                urls: vec![url],
                username,
                credential,
            });
        }
        if !ice_servers.is_empty() {
            config.ice_servers = ice_servers;
        }

        if let Some(secs) = lookup_secs(&lookup, "CALL_SETUP_TIMEOUT_SECS")? {
            config.setup_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = lookup_secs(&lookup, "CALL_RING_TIMEOUT_SECS")? {
            config.ring_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = lookup_secs(&lookup, "MEDIA_TIMEOUT_SECS")? {
            config.media_timeout = Duration::from_secs(secs.max(1));
        }

        Ok(config)
    }

    /// Endpoint für den WebSocket-Handshake inkl. Bearer Token
    pub fn signaling_endpoint(&self, token: &str) -> Url {
        signaling_endpoint(&self.signaling_url, token)
    }
}

/// Hängt `/ws` und den Token als Query-Parameter an die Basis-URL
pub fn signaling_endpoint(base: &Url, token: &str) -> Url {
    let mut url = base.clone();
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut().clear().append_pair("token", token);
    url
}

/// Parst die Signaling URL; `http(s)` wird zu `ws(s)`
fn parse_signaling_url(raw: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidSignalingUrl {
        url: raw.to_string(),
        reason,
    };

    let rewritten = if let Some(rest) = raw.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = raw.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        raw.to_string()
    };

    let url = Url::parse(&rewritten).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(invalid(format!("unsupported scheme '{}'", other))),
    }
}

fn lookup_secs<F>(lookup: &F, name: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
        None => Ok(None),
    }
}

// ============================================================================
// TESTS
// ============================================================================
