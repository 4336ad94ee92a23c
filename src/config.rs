use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_url: String,
    pub client_secret_path: String,
    pub log_level: String,
    pub scheduler: SchedulerSettings,
    pub sync: SyncSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Short delay used when a notification asks for an update. Bursts within it coalesce into one run.
    pub soon_delay_secs: u64,
    pub steady_interval_secs: u64,
    /// A pending job firing within this window is no longer cancellable.
    pub cancel_guard_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Notifications this close to the first dated event, or to listener start, are catch-up traffic.
    pub catch_up_threshold_ms: i64,
    pub new_mailbox_message_limit: usize,
    pub fetch_ceiling: usize,
    pub label: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:mailpulse.db?mode=rwc".to_string(),
            client_secret_path: "credentials.json".to_string(),
            log_level: "info".to_string(),
            scheduler: SchedulerSettings::default(),
            sync: SyncSettings::default(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            soon_delay_secs: 3,
            steady_interval_secs: 60 * 15,
            cancel_guard_ms: 500,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            catch_up_threshold_ms: 10_000,
            new_mailbox_message_limit: 50,
            fetch_ceiling: 170,
            label: crate::models::LABEL_INBOX.to_string(),
        }
    }
}

impl SchedulerSettings {
    pub fn soon_delay(&self) -> Duration {
        Duration::from_secs(self.soon_delay_secs)
    }

    pub fn steady_interval(&self) -> Duration {
        Duration::from_secs(self.steady_interval_secs)
    }

    pub fn cancel_guard(&self) -> Duration {
        Duration::from_millis(self.cancel_guard_ms)
    }
}

impl Config {
    /// Reads `settings.toml`. A missing file means defaults; a malformed one is an error
    /// for the caller to report once logging is up.
    pub fn load() -> Result<Self, toml::de::Error> {
        Self::load_from(SETTINGS_FILE)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, toml::de::Error> {
        match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn tracing_level(&self) -> tracing::Level {
        self.log_level.parse().unwrap_or(tracing::Level::INFO)
    }
}
