use crate::REPLAY_CAPACITY_MIN;
use crate::learner::Kind;
use std::path::PathBuf;

/// anything wrong with configuration is fatal at startup and nowhere else.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown learner kind: {0}")]
    UnknownKind(String),
    #[error("learner kind enabled twice: {0}")]
    DuplicateKind(Kind),
    #[error("no learners enabled")]
    NothingEnabled,
    #[error("{0} must be at least {1}")]
    TooSmall(&'static str, u64),
    #[error("unreadable config file: {0}")]
    Unreadable(#[from] std::io::Error),
    #[error("malformed config file: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("bad value for {0}: {1}")]
    BadValue(&'static str, String),
}

/// runtime configuration, env-first with an optional JSON file override.
/// defaults match the documented option table.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub enabled: Vec<Kind>,
    pub state_dir: PathBuf,
    pub periodic_save_minutes: u64,
    pub move_timeout_seconds: u64,
    pub stop_timeout_seconds: u64,
    pub async_io: bool,
    pub replay_capacity: usize,
    pub a3c_workers: usize,
    pub a3c_sync_frequency: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: Kind::ALL.to_vec(),
            state_dir: PathBuf::from("./state"),
            periodic_save_minutes: crate::PERIODIC_SAVE_MINUTES,
            move_timeout_seconds: crate::MOVE_TIMEOUT_SECONDS,
            stop_timeout_seconds: crate::STOP_TIMEOUT_SECONDS,
            async_io: true,
            replay_capacity: crate::REPLAY_CAPACITY,
            a3c_workers: (num_cpus::get() / 2).max(2),
            a3c_sync_frequency: crate::A3C_SYNC_FREQUENCY,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// defaults overridden by ROBOCHESS_* environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(enabled) = std::env::var("ROBOCHESS_ENABLED") {
            config.enabled = enabled
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse().map_err(|_| ConfigError::UnknownKind(s.to_string())))
                .collect::<Result<_, _>>()?;
        }
        if let Ok(dir) = std::env::var("ROBOCHESS_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }
        config.periodic_save_minutes =
            parse_env("ROBOCHESS_PERIODIC_SAVE_MINUTES", config.periodic_save_minutes)?;
        config.move_timeout_seconds =
            parse_env("ROBOCHESS_MOVE_TIMEOUT_SECONDS", config.move_timeout_seconds)?;
        config.stop_timeout_seconds =
            parse_env("ROBOCHESS_STOP_TIMEOUT_SECONDS", config.stop_timeout_seconds)?;
        config.async_io = parse_env("ROBOCHESS_ASYNC_IO", config.async_io)?;
        config.replay_capacity = parse_env("ROBOCHESS_REPLAY_CAPACITY", config.replay_capacity)?;
        config.a3c_workers = parse_env("ROBOCHESS_A3C_WORKERS", config.a3c_workers)?;
        config.a3c_sync_frequency =
            parse_env("ROBOCHESS_A3C_SYNC_FREQUENCY", config.a3c_sync_frequency)?;
        if let Ok(level) = std::env::var("ROBOCHESS_LOG_LEVEL") {
            config.log_level = level;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled.is_empty() {
            return Err(ConfigError::NothingEnabled);
        }
        let mut seen = std::collections::BTreeSet::new();
        for kind in &self.enabled {
            if !seen.insert(kind) {
                return Err(ConfigError::DuplicateKind(*kind));
            }
        }
        if self.periodic_save_minutes < 1 {
            return Err(ConfigError::TooSmall("periodicSaveMinutes", 1));
        }
        if self.move_timeout_seconds < 1 {
            return Err(ConfigError::TooSmall("moveTimeoutSeconds", 1));
        }
        if self.stop_timeout_seconds < 1 {
            return Err(ConfigError::TooSmall("stopTimeoutSeconds", 1));
        }
        if self.replay_capacity < REPLAY_CAPACITY_MIN {
            return Err(ConfigError::TooSmall(
                "replayCapacity",
                REPLAY_CAPACITY_MIN as u64,
            ));
        }
        if self.a3c_sync_frequency < 1 {
            return Err(ConfigError::TooSmall("a3c.syncFrequency", 1));
        }
        Ok(())
    }

    pub fn level(&self) -> log::LevelFilter {
        match self.log_level.as_str() {
            "error" => log::LevelFilter::Error,
            "warn" => log::LevelFilter::Warn,
            "debug" => log::LevelFilter::Debug,
            "trace" => log::LevelFilter::Trace,
            _ => log::LevelFilter::Info,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, fallback: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(fallback),
        Ok(text) => text
            .parse()
            .map_err(|_| ConfigError::BadValue(name, text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn duplicate_kinds_rejected() {
        let mut config = Config::default();
        config.enabled = vec![Kind::QTable, Kind::QTable];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateKind(Kind::QTable))
        ));
    }

    #[test]
    fn empty_stable_rejected() {
        let mut config = Config::default();
        config.enabled.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NothingEnabled)));
    }

    #[test]
    fn bounds_enforced() {
        let mut config = Config::default();
        config.replay_capacity = 10;
        assert!(matches!(config.validate(), Err(ConfigError::TooSmall(_, _))));
        let mut config = Config::default();
        config.periodic_save_minutes = 0;
        assert!(matches!(config.validate(), Err(ConfigError::TooSmall(_, _))));
    }

    #[test]
    fn file_roundtrip() {
        let config = Config::default();
        let text = serde_json::to_string(&config).expect("serialize");
        let back: Config = serde_json::from_str(&text).expect("deserialize");
        assert!(back.enabled == config.enabled);
        assert!(back.replay_capacity == config.replay_capacity);
    }
}
