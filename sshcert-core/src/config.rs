use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub issuance: IssuanceConfig,
    #[serde(default)]
    pub state: StateConfig,
}

/// How to reach the certificate authority.
///
/// `Debug` is manually implemented to redact the access token.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(rename = "type", default = "default_connection_kind")]
    pub kind: String,
    /// Base URL of the authority, e.g. `https://tpp.example.com`.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub access_token: Option<Zeroizing<String>>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            kind: default_connection_kind(),
            url: String::new(),
            access_token: None,
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("kind", &self.kind)
            .field("url", &self.url)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[redacted]"),
            )
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

impl ConnectionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Bounds on the pickup wait after a request has been submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuanceConfig {
    #[serde(default = "default_retrieve_timeout_secs")]
    pub retrieve_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            retrieve_timeout_secs: default_retrieve_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl IssuanceConfig {
    pub fn retrieve_timeout(&self) -> Duration {
        Duration::from_secs(self.retrieve_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    /// Directory holding per-certificate state files.  Defaults to
    /// `$XDG_DATA_HOME/sshcert/state`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_connection_kind() -> String {
    "tpp".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_retrieve_timeout_secs() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    2000
}
