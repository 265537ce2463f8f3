use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::warn;

use sketch_gateway::presence::PresenceConfig;

/// Service keys that ship in sample configs and must never run in production.
const PLACEHOLDER_KEYS: &[&str] = &["changeme", "change-me", "dev-secret-change-me", "your-service-key"];

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub service_key: String,
    pub presence: PresenceConfig,
    pub message_history: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Missing values fall back to defaults,
    /// except the service key, which is required.
    pub fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let service_key = get("SKETCH_SERVICE_KEY").unwrap_or_default();
        let trimmed = service_key.trim();
        if trimmed.is_empty() {
            bail!("SKETCH_SERVICE_KEY must be set");
        }
        if PLACEHOLDER_KEYS.contains(&trimmed.to_ascii_lowercase().as_str()) {
            bail!("SKETCH_SERVICE_KEY is still a placeholder value");
        }

        let presence = PresenceConfig {
            heartbeat_interval: secs(&get, "SKETCH_HEARTBEAT_SECS", 5)?,
            away_after: secs(&get, "SKETCH_AWAY_AFTER_SECS", 5 * 60)?,
            inactive_after: secs(&get, "SKETCH_INACTIVE_AFTER_SECS", 15 * 60)?,
            sweep_interval: secs(&get, "SKETCH_SWEEP_INTERVAL_SECS", 30)?,
            grace_window: secs(&get, "SKETCH_GRACE_SECS", 15 * 60)?,
        };
        if presence.sweep_interval.is_zero() {
            bail!("SKETCH_SWEEP_INTERVAL_SECS must be greater than zero");
        }
        if presence.away_after >= presence.inactive_after {
            warn!("Away threshold is not below the inactivity threshold; participants will never show as away");
        }

        Ok(Self {
            host: get("SKETCH_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse(&get, "SKETCH_PORT", 3000)?,
            db_path: PathBuf::from(get("SKETCH_DB_PATH").unwrap_or_else(|| "sketch.db".into())),
            service_key: trimmed.to_string(),
            presence,
            message_history: parse(&get, "SKETCH_MESSAGE_HISTORY", 100)?,
        })
    }
}

fn parse<F, T>(get: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value '{}'", name, raw)),
        None => Ok(default),
    }
}

fn secs<F>(get: &F, name: &str, default: u64) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parse(get, name, default).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_only_the_key_is_set() {
        let config = config(&[("SKETCH_SERVICE_KEY", "a-real-key")]).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.db_path, PathBuf::from("sketch.db"));
        assert_eq!(config.presence.away_after, Duration::from_secs(300));
        assert_eq!(config.presence.inactive_after, Duration::from_secs(900));
        assert_eq!(config.presence.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.message_history, 100);
    }

    #[test]
    fn missing_or_placeholder_key_is_fatal() {
        assert!(config(&[]).is_err());
        assert!(config(&[("SKETCH_SERVICE_KEY", "  ")]).is_err());
        assert!(config(&[("SKETCH_SERVICE_KEY", "CHANGEME")]).is_err());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config(&[
            ("SKETCH_SERVICE_KEY", "k"),
            ("SKETCH_PORT", "8081"),
            ("SKETCH_GRACE_SECS", "60"),
            ("SKETCH_MESSAGE_HISTORY", "20"),
        ])
        .unwrap();
        assert_eq!(config.port, 8081);
        assert_eq!(config.presence.grace_window, Duration::from_secs(60));
        assert_eq!(config.message_history, 20);
    }

    #[test]
    fn bad_numbers_and_zero_sweep_are_rejected() {
        assert!(config(&[("SKETCH_SERVICE_KEY", "k"), ("SKETCH_PORT", "http")]).is_err());
        assert!(config(&[("SKETCH_SERVICE_KEY", "k"), ("SKETCH_SWEEP_INTERVAL_SECS", "0")]).is_err());
    }
}
