//! Process configuration.
//!
//! All settings are environment-driven and read once at startup:
//! - `RECONNECT_INTERVAL` — delay before a generic reconnect attempt, in ms
//! - `MAX_RECONNECT_RETRIES` — shared retry budget per session
//! - `WAGATE_DATABASE_PATH` — sqlite location, default `~/.wagate/sqlite.db`
//! - `WAGATE_DEFAULT_SESSION` — session id created on a fresh database

use std::path::PathBuf;
use std::time::Duration;

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database path
    pub database_path: PathBuf,
    /// Delay between a transient disconnect and the next connection attempt
    pub reconnect_interval: Duration,
    /// Retry budget shared by all non-terminal disconnect codes
    pub max_reconnect_retries: u32,
    /// Well-known session id created when no sessions are persisted
    pub default_session_id: String,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: home.join(".wagate/sqlite.db"),
            reconnect_interval: Duration::ZERO,
            max_reconnect_retries: 5,
            default_session_id: "default".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the environment, falling back to defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let database_path = std::env::var("WAGATE_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.database_path);

        let reconnect_interval = env_u64("RECONNECT_INTERVAL")
            .map(Duration::from_millis)
            .unwrap_or(defaults.reconnect_interval);

        let max_reconnect_retries = env_u64("MAX_RECONNECT_RETRIES")
            .map(|n| n as u32)
            .unwrap_or(defaults.max_reconnect_retries);

        let default_session_id =
            std::env::var("WAGATE_DEFAULT_SESSION").unwrap_or(defaults.default_session_id);

        Self {
            database_path,
            reconnect_interval,
            max_reconnect_retries,
            default_session_id,
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert!(config.database_path.ends_with("sqlite.db"));
        assert_eq!(config.reconnect_interval, Duration::ZERO);
        assert_eq!(config.max_reconnect_retries, 5);
        assert_eq!(config.default_session_id, "default");
    }
}
