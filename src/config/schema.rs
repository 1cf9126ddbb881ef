use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::Secret;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub connect: ConnectConfig,
    pub auth: AuthConfig,
    pub idmap: IdmapRangeConfig,
    pub logging: LoggingConfig,
    /// Trusted domains pinned by hand, merged ahead of anything the trust
    /// walker discovers.
    pub static_domains: Vec<StaticDomainConfig>,
}

/// Daemon-wide timing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// How often cached directory answers are revalidated, seconds.
    pub cache_refresh_secs: u64,
    /// Window after daemon start during which a failed domain is retried
    /// aggressively, seconds.
    pub startup_grace_secs: u64,
    /// Probe interval used inside the startup grace window, seconds.
    pub startup_probe_secs: u64,
    /// How often the trust walker rescans, seconds.
    pub trust_rescan_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cache_refresh_secs: 300,
            startup_grace_secs: 30,
            startup_probe_secs: 10,
            trust_rescan_secs: 300,
        }
    }
}

impl ServerConfig {
    pub fn cache_refresh(&self) -> Duration {
        Duration::from_secs(self.cache_refresh_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_secs(self.startup_grace_secs)
    }

    pub fn startup_probe(&self) -> Duration {
        Duration::from_secs(self.startup_probe_secs)
    }

    pub fn trust_rescan(&self) -> Duration {
        Duration::from_secs(self.trust_rescan_secs)
    }
}

/// Controller discovery and connection establishment knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Per-socket connect deadline, seconds.
    pub timeout_secs: u64,
    /// Full establish attempts over the candidate list before the domain is
    /// declared offline.
    pub cycles: u32,
    /// Broadcast discovery polls one reply per interval, this many times.
    pub broadcast_polls: u32,
    pub broadcast_poll_ms: u64,
    /// How long a failed candidate stays in the negative cache, seconds.
    pub negative_cache_secs: u64,
    /// Ports raced per candidate address, preferred first.
    pub ports: Vec<u16>,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 5,
            cycles: 3,
            broadcast_polls: 5,
            broadcast_poll_ms: 500,
            negative_cache_secs: 120,
            ports: vec![445, 139],
        }
    }
}

impl ConnectConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn broadcast_poll(&self) -> Duration {
        Duration::from_millis(self.broadcast_poll_ms)
    }

    pub fn negative_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_cache_secs)
    }
}

/// Identities the daemon can authenticate as, strongest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Primary domain NetBIOS name.
    pub domain: String,
    /// Kerberos realm; also gates whether Kerberos is attempted at all.
    pub realm: Option<String>,
    pub kerberos: bool,
    /// Machine trust account name, normally `HOSTNAME$`.
    pub machine_account: Option<String>,
    pub machine_secret: Secret,
    /// Optional service account for the NTLM fallback.
    pub service_user: Option<String>,
    pub service_secret: Secret,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            realm: None,
            kerberos: true,
            machine_account: None,
            machine_secret: Secret::default(),
            service_user: None,
            service_secret: Secret::default(),
        }
    }
}

impl AuthConfig {
    pub fn machine_account_or_default(&self) -> String {
        match &self.machine_account {
            Some(name) => name.clone(),
            None => format!("{}$", whoami::fallible::hostname().unwrap_or_default().to_uppercase()),
        }
    }

    pub fn has_service_account(&self) -> bool {
        self.service_user.as_deref().is_some_and(|u| !u.is_empty())
    }
}

/// Allocation ranges for the idmap store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdmapRangeConfig {
    pub uid_low: u32,
    pub uid_high: u32,
    pub gid_low: u32,
    pub gid_high: u32,
    /// Store path override; defaults to the state directory.
    pub path: Option<PathBuf>,
}

impl Default for IdmapRangeConfig {
    fn default() -> Self {
        Self {
            uid_low: 10_000,
            uid_high: 20_000,
            gid_low: 10_000,
            gid_high: 20_000,
            path: None,
        }
    }
}

/// A trusted domain pinned in config rather than discovered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticDomainConfig {
    pub name: String,
    pub alt_name: Option<String>,
    pub sid: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    pub filter: Option<String>,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Compact,
            filter: None,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    pub format: LogFormat,
    pub rotation: LogRotation,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            format: LogFormat::Json,
            rotation: LogRotation::Daily,
        }
    }
}
