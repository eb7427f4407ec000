use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::body::DEFAULT_REPLAY_LIMIT;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct Settings {
    #[serde(default)]
    pub local: LocalSettings,
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// How ordinary proxy requests reach their origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    Smart,
    Direct,
    Remote,
}

/// How CONNECT tunnels reach their target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ConnectMode {
    Smart,
    Direct,
    Remote,
    Intercept,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct LocalSettings {
    #[serde(default = "default_local_listen")]
    pub listen: SocketAddr,
    /// Base URL of the relay; the connect endpoint is `<remote>/c`.
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Holds `blocklist`, `certs/` and the CA pair.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_fetch")]
    pub fetch: FetchMode,
    #[serde(default = "default_connect")]
    pub connect: ConnectMode,
    /// Range file replacing the compiled-in domestic table.
    #[serde(default)]
    pub geoip_table: Option<PathBuf>,
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    #[serde(default)]
    pub ca_key: Option<PathBuf>,
    #[serde(default = "default_max_replay")]
    pub max_replay_body_bytes: usize,
    #[serde(default = "default_direct_timeout")]
    pub direct_timeout_ms: u64,
    #[serde(default = "default_relay_timeout")]
    pub relay_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct RelaySettings {
    #[serde(default = "default_relay_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_ms: u64,
    /// Shared secret for the envelope transform. Both ends must agree.
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingSettings {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Daily-rotated log file; stderr when unset.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_local_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 1984))
}

fn default_remote() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_work_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".egress"))
        .unwrap_or_else(|| PathBuf::from(".egress"))
}

fn default_fetch() -> FetchMode {
    FetchMode::Smart
}

fn default_connect() -> ConnectMode {
    ConnectMode::Smart
}

fn default_max_replay() -> usize {
    DEFAULT_REPLAY_LIMIT
}

fn default_direct_timeout() -> u64 {
    3000
}

fn default_relay_timeout() -> u64 {
    10000
}

fn default_relay_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_dial_timeout() -> u64 {
    10000
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            listen: default_local_listen(),
            remote: default_remote(),
            work_dir: default_work_dir(),
            fetch: default_fetch(),
            connect: default_connect(),
            geoip_table: None,
            ca_cert: None,
            ca_key: None,
            max_replay_body_bytes: default_max_replay(),
            direct_timeout_ms: default_direct_timeout(),
            relay_timeout_ms: default_relay_timeout(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            listen: default_relay_listen(),
            dial_timeout_ms: default_dial_timeout(),
            secret: None,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            file: None,
        }
    }
}

impl LocalSettings {
    pub fn blocklist_path(&self) -> PathBuf {
        self.work_dir.join("blocklist")
    }

    pub fn cert_dir(&self) -> PathBuf {
        self.work_dir.join("certs")
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.ca_cert
            .clone()
            .unwrap_or_else(|| self.work_dir.join("ca.crt"))
    }

    pub fn ca_key_path(&self) -> PathBuf {
        self.ca_key
            .clone()
            .unwrap_or_else(|| self.work_dir.join("ca.key"))
    }

    pub fn direct_timeout(&self) -> Duration {
        Duration::from_millis(self.direct_timeout_ms)
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_timeout_ms)
    }
}

impl RelaySettings {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}
