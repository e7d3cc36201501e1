//! Shard Configuration
//!
//! Loaded from TOML with environment overrides for the recovery knobs
//! operators tune most:
//!
//! - `SHARD_RECOVERY_CHUNK_SIZE` (bytes)
//! - `SHARD_RECOVERY_MAX_CONCURRENT_CHUNKS`
//! - `SHARD_RECOVERY_ACTION_TIMEOUT_MS`

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Error type for configuration loading
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    InvalidEnv { key: &'static str, value: String },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "config parse error: {}", e),
            ConfigError::InvalidEnv { key, value } => {
                write!(f, "invalid value for {}: {:?}", key, value)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Top-level configuration of a shard copy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    pub recovery: RecoveryConfig,
    pub translog: TranslogConfig,
}

/// Peer recovery tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Size of one file chunk (default: 512KB)
    pub chunk_size_bytes: usize,
    /// File chunks in flight at once (default: 2)
    pub max_concurrent_file_chunks: usize,
    /// Timeout for each source-to-target action (default: 30s)
    #[serde(with = "duration_millis")]
    pub internal_action_timeout: Duration,
    /// Operations per translog batch (default: 1000)
    pub translog_ops_batch_size: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            chunk_size_bytes: 512 * 1024,
            max_concurrent_file_chunks: 2,
            internal_action_timeout: Duration::from_secs(30),
            translog_ops_batch_size: 1000,
        }
    }
}

impl RecoveryConfig {
    /// Configuration for tests (tiny chunks so every file spans several)
    pub fn test() -> Self {
        RecoveryConfig {
            chunk_size_bytes: 64,
            max_concurrent_file_chunks: 3,
            internal_action_timeout: Duration::from_secs(5),
            translog_ops_batch_size: 7,
        }
    }
}

/// When translog appends are fsynced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranslogDurability {
    /// Before every write is acknowledged
    Request,
    /// Only on explicit sync and generation roll
    Async,
}

/// Translog and flush tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslogConfig {
    pub durability: TranslogDurability,
    /// Uncommitted operations that trigger an automatic flush (default: 10,000)
    pub flush_threshold_ops: usize,
}

impl Default for TranslogConfig {
    fn default() -> Self {
        TranslogConfig {
            durability: TranslogDurability::Request,
            flush_threshold_ops: 10_000,
        }
    }
}

impl ShardConfig {
    /// Configuration for tests
    pub fn test() -> Self {
        ShardConfig {
            recovery: RecoveryConfig::test(),
            translog: TranslogConfig {
                durability: TranslogDurability::Request,
                flush_threshold_ops: 50,
            },
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: ShardConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: ShardConfig = toml::from_str(&contents)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = ShardConfig::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (normally the process environment)
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(
            key: &'static str,
            value: Option<String>,
        ) -> Result<Option<T>, ConfigError> {
            match value {
                None => Ok(None),
                Some(v) => v
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| ConfigError::InvalidEnv { key, value: v }),
            }
        }

        const CHUNK_SIZE: &str = "SHARD_RECOVERY_CHUNK_SIZE";
        const MAX_CHUNKS: &str = "SHARD_RECOVERY_MAX_CONCURRENT_CHUNKS";
        const TIMEOUT_MS: &str = "SHARD_RECOVERY_ACTION_TIMEOUT_MS";

        if let Some(v) = parse::<usize>(CHUNK_SIZE, lookup(CHUNK_SIZE))? {
            self.recovery.chunk_size_bytes = v;
        }
        if let Some(v) = parse::<usize>(MAX_CHUNKS, lookup(MAX_CHUNKS))? {
            self.recovery.max_concurrent_file_chunks = v;
        }
        if let Some(v) = parse::<u64>(TIMEOUT_MS, lookup(TIMEOUT_MS))? {
            self.recovery.internal_action_timeout = Duration::from_millis(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.recovery.chunk_size_bytes == 0 {
            return Err(ConfigError::Invalid("chunk_size_bytes must be > 0".into()));
        }
        if self.recovery.max_concurrent_file_chunks == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_file_chunks must be > 0".into(),
            ));
        }
        if self.recovery.internal_action_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "internal_action_timeout must be > 0".into(),
            ));
        }
        if self.recovery.translog_ops_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "translog_ops_batch_size must be > 0".into(),
            ));
        }
        if self.translog.flush_threshold_ops == 0 {
            return Err(ConfigError::Invalid("flush_threshold_ops must be > 0".into()));
        }
        Ok(())
    }
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ShardConfig::default();
        assert_eq!(config.recovery.chunk_size_bytes, 512 * 1024);
        assert_eq!(config.recovery.max_concurrent_file_chunks, 2);
        assert_eq!(config.recovery.internal_action_timeout, Duration::from_secs(30));
        assert_eq!(config.translog.durability, TranslogDurability::Request);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ShardConfig::from_toml_str(
            r#"
            [recovery]
            chunk_size_bytes = 1024
            internal_action_timeout = 250

            [translog]
            durability = "async"
            "#,
        )
        .unwrap();
        assert_eq!(config.recovery.chunk_size_bytes, 1024);
        assert_eq!(config.recovery.internal_action_timeout, Duration::from_millis(250));
        assert_eq!(config.recovery.max_concurrent_file_chunks, 2);
        assert_eq!(config.translog.durability, TranslogDurability::Async);
        assert_eq!(config.translog.flush_threshold_ops, 10_000);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SHARD_RECOVERY_CHUNK_SIZE", "4096"),
            ("SHARD_RECOVERY_ACTION_TIMEOUT_MS", "1500"),
        ]
        .into_iter()
        .collect();
        let mut config = ShardConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.recovery.chunk_size_bytes, 4096);
        assert_eq!(config.recovery.internal_action_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_bad_env_value_rejected() {
        let mut config = ShardConfig::default();
        let err = config
            .apply_overrides(|key| {
                (key == "SHARD_RECOVERY_MAX_CONCURRENT_CHUNKS").then(|| "many".to_string())
            })
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_zero_values_rejected() {
        assert!(ShardConfig::from_toml_str("[recovery]\nmax_concurrent_file_chunks = 0").is_err());
        assert!(ShardConfig::from_toml_str("[translog]\nflush_threshold_ops = 0").is_err());
    }
}
