use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::domain::QuayError;

/// Runtime configuration. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub queue: QueueSettings,
    pub claim: ClaimSettings,
    pub store: StoreSettings,
    pub reaper: ReaperSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Prefix of every backing queue name.
    pub prefix: String,
    /// How long a polled hint stays invisible before it reappears.
    pub hint_lease_secs: u64,
    pub signed_url_ttl_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            prefix: "quay".to_string(),
            hint_lease_secs: 300,
            signed_url_ttl_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClaimSettings {
    pub claim_timeout_secs: u64,
    /// Sleep after a polling pass that found nothing.
    pub idle_poll_interval_ms: u64,
    /// Polls per queue per pass before moving to the next tier.
    pub max_polls_per_queue: u32,
}

impl Default for ClaimSettings {
    fn default() -> Self {
        Self {
            claim_timeout_secs: 20 * 60,
            idle_poll_interval_ms: 200,
            max_polls_per_queue: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Read-modify-write attempts before giving up with a conflict.
    pub max_modify_attempts: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            max_modify_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReaperSettings {
    pub interval_secs: u64,
    /// Per-task errors tolerated before a sweep gives up.
    pub error_limit: usize,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            error_limit: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub format: LogFormat,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            filter: "info".to_string(),
        }
    }
}

impl Settings {
    /// Defaults when `path` is `None`, otherwise the TOML file at `path`.
    pub fn load(path: Option<&Path>) -> Result<Self, QuayError> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)
                    .map_err(|e| QuayError::Config(format!("{}: {e}", p.display())))?;
                Self::from_toml_str(&data)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml_str(data: &str) -> Result<Self, QuayError> {
        toml::from_str(data).map_err(|e| QuayError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), QuayError> {
        let checks = [
            (self.queue.prefix.is_empty(), "queue.prefix must not be empty"),
            (self.queue.hint_lease_secs == 0, "queue.hint_lease_secs must be positive"),
            (self.claim.claim_timeout_secs == 0, "claim.claim_timeout_secs must be positive"),
            (self.claim.max_polls_per_queue == 0, "claim.max_polls_per_queue must be positive"),
            (self.store.max_modify_attempts == 0, "store.max_modify_attempts must be positive"),
            (self.reaper.interval_secs == 0, "reaper.interval_secs must be positive"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, msg)) => Err(QuayError::Config(msg.to_string())),
            None => Ok(()),
        }
    }

    pub fn claim_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.claim.claim_timeout_secs as i64)
    }

    pub fn hint_lease(&self) -> Duration {
        Duration::from_secs(self.queue.hint_lease_secs)
    }

    pub fn signed_url_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.queue.signed_url_ttl_secs as i64)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.claim.idle_poll_interval_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper.interval_secs)
    }
}
