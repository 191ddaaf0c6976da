use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::{debug, info};

use crate::channel::ReconnectPolicy;
use crate::error::{
    ConfigError, CreateDirSnafu, EncodeSnafu, InvalidSnafu, NoConfigDirSnafu, ParseSnafu,
    ReadSnafu, WriteSnafu,
};
use crate::validation;

// Default configuration
pub const DEFAULT_PUSH_URL: &str = "wss://push.rentchat.app/socket";
pub const PUSH_URL_ENV: &str = "RENTCHAT_PUSH_URL";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub push_url: String,
    pub message_page_size: usize,
    pub conversation_page_size: usize,
    /// Messages kept per thread before the oldest are evicted.
    pub retention: usize,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_max_attempts: Option<u32>,
    pub refresh_interval_secs: u64,
    pub notification_limit: usize,
    /// Notification type → locally chosen alert cue.
    pub alert_cues: HashMap<String, String>,
    pub log_filter: String,
    pub log_to_file: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            push_url: DEFAULT_PUSH_URL.to_string(),
            message_page_size: 20,
            conversation_page_size: 20,
            retention: crate::message_store::DEFAULT_RETENTION,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            reconnect_max_attempts: None,
            refresh_interval_secs: 60,
            notification_limit: crate::notifications::DEFAULT_NOTIFICATION_LIMIT,
            alert_cues: HashMap::new(),
            log_filter: "info".to_string(),
            log_to_file: false,
        }
    }
}

impl SyncConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(self.reconnect_base_ms),
            max: Duration::from_millis(self.reconnect_max_ms),
            max_attempts: self.reconnect_max_attempts,
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    /// Replace the push URL when an override is present and non-empty.
    pub fn with_push_url_override(mut self, push_url: Option<String>) -> Self {
        if let Some(url) = push_url.filter(|u| !u.trim().is_empty()) {
            debug!(%url, "push url overridden");
            self.push_url = url.trim().to_string();
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let stage = "validate_config";
        if let Err(details) = validation::validate_push_url(&self.push_url) {
            return InvalidSnafu {
                stage,
                field: "push_url",
                details,
            }
            .fail();
        }

        let sizes = [
            ("message_page_size", self.message_page_size),
            ("conversation_page_size", self.conversation_page_size),
            ("retention", self.retention),
            ("notification_limit", self.notification_limit),
        ];
        for (field, value) in sizes {
            if value == 0 {
                return InvalidSnafu {
                    stage,
                    field,
                    details: "must be greater than 0",
                }
                .fail();
            }
        }

        if self.reconnect_base_ms == 0 || self.reconnect_max_ms < self.reconnect_base_ms {
            return InvalidSnafu {
                stage,
                field: "reconnect_max_ms",
                details: format!(
                    "need 0 < base ({}) <= max ({})",
                    self.reconnect_base_ms, self.reconnect_max_ms
                ),
            }
            .fail();
        }
        if self.refresh_interval_secs == 0 {
            return InvalidSnafu {
                stage,
                field: "refresh_interval_secs",
                details: "must be greater than 0",
            }
            .fail();
        }
        Ok(())
    }
}

pub fn config_path() -> Result<PathBuf, ConfigError> {
    let stage = "config_path";
    let proj = ProjectDirs::from("app", "rentchat", "rentchat-sync")
        .ok_or_else(|| NoConfigDirSnafu { stage }.build())?;
    let dir = proj.config_dir();
    fs::create_dir_all(dir).context(CreateDirSnafu {
        stage,
        path: dir.display().to_string(),
    })?;
    Ok(dir.join("settings.json"))
}

/// Load settings from the platform config dir. A missing file yields the
/// defaults; `RENTCHAT_PUSH_URL` overrides the push URL either way.
pub fn load_config() -> Result<SyncConfig, ConfigError> {
    let config = load_config_from(&config_path()?)?;
    let config = config.with_push_url_override(std::env::var(PUSH_URL_ENV).ok());
    config.validate()?;
    Ok(config)
}

pub fn load_config_from(path: &Path) -> Result<SyncConfig, ConfigError> {
    let stage = "load_config";
    if !path.exists() {
        info!(path = %path.display(), "no settings file, using defaults");
        return Ok(SyncConfig::default());
    }
    let content = fs::read_to_string(path).context(ReadSnafu {
        stage,
        path: path.display().to_string(),
    })?;
    serde_json::from_str(&content).context(ParseSnafu {
        stage,
        path: path.display().to_string(),
    })
}

pub fn save_config(config: &SyncConfig) -> Result<(), ConfigError> {
    save_config_to(config, &config_path()?)
}

pub fn save_config_to(config: &SyncConfig, path: &Path) -> Result<(), ConfigError> {
    let stage = "save_config";
    let data = serde_json::to_string_pretty(config).context(EncodeSnafu { stage })?;
    fs::write(path, data).context(WriteSnafu {
        stage,
        path: path.display().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_file(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rentchat-sync-{}-{}", name, std::process::id()));
        fs::create_dir_all(&dir).expect("scratch dir");
        dir.join("settings.json")
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.message_page_size, 20);
        assert_eq!(config.reconnect_policy().max, Duration::from_secs(30));
        assert_eq!(config.reconnect_policy().max_attempts, None);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"message_page_size": 50, "alert_cues": {"payment_received": "chime"}}"#)
                .expect("parses");
        assert_eq!(config.message_page_size, 50);
        assert_eq!(config.conversation_page_size, 20);
        assert_eq!(config.alert_cues.get("payment_received").map(String::as_str), Some("chime"));
    }

    #[test]
    fn test_save_and_load_file() {
        let path = scratch_file("save");
        let config = SyncConfig {
            retention: 500,
            log_to_file: true,
            ..SyncConfig::default()
        };
        save_config_to(&config, &path).expect("saves");
        assert_eq!(load_config_from(&path).expect("loads"), config);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let path = scratch_file("missing").with_file_name("absent.json");
        assert_eq!(load_config_from(&path).expect("defaults"), SyncConfig::default());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let path = scratch_file("corrupt");
        fs::write(&path, "{ not json").expect("writes");
        assert!(matches!(load_config_from(&path), Err(ConfigError::Parse { .. })));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_push_url_override() {
        let config = SyncConfig::default().with_push_url_override(Some("ws://127.0.0.1:9000".into()));
        assert_eq!(config.push_url, "ws://127.0.0.1:9000");
        let config = config.with_push_url_override(Some("  ".into()));
        assert_eq!(config.push_url, "ws://127.0.0.1:9000");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad_url = SyncConfig {
            push_url: "http://nope".into(),
            ..SyncConfig::default()
        };
        assert!(matches!(
            bad_url.validate(),
            Err(ConfigError::Invalid { field: "push_url", .. })
        ));

        let zero_page = SyncConfig {
            message_page_size: 0,
            ..SyncConfig::default()
        };
        assert!(zero_page.validate().is_err());

        let inverted = SyncConfig {
            reconnect_base_ms: 5_000,
            reconnect_max_ms: 1_000,
            ..SyncConfig::default()
        };
        assert!(inverted.validate().is_err());
    }
}
