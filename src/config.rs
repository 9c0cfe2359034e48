//! Configuration types.
//!
//! The relay configuration (endpoint mapping + allow-list) comes from a JSON
//! file and is loaded once at startup. Server settings come from environment
//! variables. Both are plain values handed to the components that need them;
//! nothing here is mutated after startup.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::ConfigError;

/// Environment variable overriding the relay config path.
pub const CONFIG_FILE_ENV: &str = "EMAIL_CONFIG_FILE";

/// Relay config path used when `EMAIL_CONFIG_FILE` is unset.
pub const DEFAULT_CONFIG_FILE: &str = "email_config.json";

const DEFAULT_BIND: &str = "0.0.0.0:25";
const DEFAULT_HOSTNAME: &str = "localhost";
const DEFAULT_MAX_MESSAGE_BYTES: usize = 32 * 1024 * 1024;
const DEFAULT_DRAIN_SECS: u64 = 10;

// ── Endpoint mapping ────────────────────────────────────────────────

/// Recipient address → webhook URL. Keys are stored lower-cased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointMapping {
    endpoints: HashMap<String, String>,
}

impl EndpointMapping {
    /// Look up the webhook for a recipient, ignoring case.
    pub fn endpoint_for(&self, recipient: &str) -> Option<&str> {
        self.endpoints
            .get(&recipient.to_lowercase())
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Entries sorted by address, for stable display.
    pub fn entries(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<_> = self
            .endpoints
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        entries.sort_unstable();
        entries
    }
}

impl<K, V> FromIterator<(K, V)> for EndpointMapping
where
    K: AsRef<str>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut endpoints = HashMap::new();
        for (address, url) in iter {
            let key = address.as_ref().to_lowercase();
            let url = url.into();
            if let Some(previous) = endpoints.insert(key.clone(), url.clone()) {
                warn!(
                    address = %key,
                    replaced = %previous,
                    endpoint = %url,
                    "Duplicate endpoint mapping (case-insensitive), last entry wins"
                );
            }
        }
        Self { endpoints }
    }
}

// ── Allow-list ──────────────────────────────────────────────────────

/// Sender addresses permitted to submit mail. Membership is exact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    senders: HashSet<String>,
}

impl AllowList {
    pub fn contains(&self, sender: &str) -> bool {
        self.senders.contains(sender)
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Senders sorted, for stable display.
    pub fn senders(&self) -> Vec<&str> {
        let mut senders: Vec<_> = self.senders.iter().map(String::as_str).collect();
        senders.sort_unstable();
        senders
    }
}

impl<S: Into<String>> FromIterator<S> for AllowList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            senders: iter.into_iter().map(Into::into).collect(),
        }
    }
}

// ── Relay configuration ─────────────────────────────────────────────

/// On-disk shape of the relay config file.
#[derive(Debug, Default, Deserialize)]
struct RelayConfigFile {
    #[serde(default)]
    email_endpoints: BTreeMap<String, String>,
    #[serde(default)]
    allowed_senders: Vec<String>,
}

/// Endpoint mapping and allow-list, constructed once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayConfig {
    pub endpoints: EndpointMapping,
    pub allowed_senders: AllowList,
}

impl RelayConfig {
    pub fn new(endpoints: EndpointMapping, allowed_senders: AllowList) -> Self {
        Self {
            endpoints,
            allowed_senders,
        }
    }

    /// Parse a config document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let file: RelayConfigFile =
            serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        Ok(Self {
            endpoints: file.email_endpoints.into_iter().collect(),
            allowed_senders: file.allowed_senders.into_iter().collect(),
        })
    }

    /// Load the config file at `path`.
    ///
    /// A missing file is reported as [`ConfigError::MissingFile`]; see
    /// [`RelayConfig::load_or_default`] for the startup behaviour.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = match std::fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::MissingFile(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_json(&json)
    }

    /// Load the config file, degrading to an empty config when it is absent.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::MissingFile(path)) => {
                warn!(path = %path.display(), "Configuration file not found, continuing with empty config");
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Config path from `EMAIL_CONFIG_FILE`, or the default file name.
    pub fn path_from_env() -> PathBuf {
        std::env::var(CONFIG_FILE_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
    }
}

// ── Server settings ─────────────────────────────────────────────────

/// What happens to in-flight message tasks when the process is interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Exit at once; scheduled tasks are abandoned.
    Immediate,
    /// Wait up to `timeout` for scheduled tasks, then exit.
    Drain { timeout: Duration },
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self::Drain {
            timeout: Duration::from_secs(DEFAULT_DRAIN_SECS),
        }
    }
}

impl ShutdownPolicy {
    fn from_secs(secs: u64) -> Self {
        if secs == 0 {
            Self::Immediate
        } else {
            Self::Drain {
                timeout: Duration::from_secs(secs),
            }
        }
    }
}

/// Listener and runtime settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listener socket.
    pub bind: SocketAddr,
    /// Name announced in the SMTP greeting.
    pub hostname: String,
    /// Threads in the webhook worker pool.
    pub webhook_workers: usize,
    /// Largest DATA payload accepted.
    pub max_message_bytes: usize,
    pub shutdown: ShutdownPolicy,
    /// Directory holding the audit log files.
    pub log_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 25)),
            hostname: DEFAULT_HOSTNAME.to_string(),
            webhook_workers: default_webhook_workers(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            shutdown: ShutdownPolicy::default(),
            log_dir: PathBuf::from("."),
        }
    }
}

impl ServerConfig {
    /// Build settings from `MAILHOOK_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable lookup.
    pub fn from_vars<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_raw = var("MAILHOOK_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind_raw
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue {
                key: "MAILHOOK_BIND".into(),
                message: format!("{bind_raw:?}: {e}"),
            })?;

        let hostname = var("MAILHOOK_HOSTNAME").unwrap_or_else(|| DEFAULT_HOSTNAME.to_string());

        let webhook_workers = match parse_var::<usize>(&var, "MAILHOOK_WEBHOOK_WORKERS")? {
            Some(0) => {
                return Err(ConfigError::InvalidValue {
                    key: "MAILHOOK_WEBHOOK_WORKERS".into(),
                    message: "must be at least 1".into(),
                });
            }
            Some(n) => n,
            None => default_webhook_workers(),
        };

        let max_message_bytes = parse_var(&var, "MAILHOOK_MAX_MESSAGE_BYTES")?
            .unwrap_or(DEFAULT_MAX_MESSAGE_BYTES);

        let shutdown = parse_var::<u64>(&var, "MAILHOOK_SHUTDOWN_DRAIN_SECS")?
            .map(ShutdownPolicy::from_secs)
            .unwrap_or_default();

        let log_dir = var("MAILHOOK_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            bind,
            hostname,
            webhook_workers,
            max_message_bytes,
            shutdown,
            log_dir,
        })
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    var(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            })
        })
        .transpose()
}

/// Same sizing rule as a default thread-pool executor: cpus + 4, capped at 32.
fn default_webhook_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus + 4).min(32)
}
