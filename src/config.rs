//! Transaction and cleanup configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::redaction::RedactionLevel;
use crate::store::Keyspace;

/// Upper bound on the ATR id space
pub const MAX_ATRS: usize = 1024;

/// Durability requirement for transactional writes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurabilityLevel {
    /// In memory on the active node only
    None,
    /// In memory on a majority of replicas
    #[default]
    Majority,
    /// Majority in memory, persisted on the active node
    MajorityAndPersistToActive,
    /// Persisted on a majority of replicas
    PersistToMajority,
}

impl DurabilityLevel {
    /// Short form recorded in ATR entries
    pub fn short_code(&self) -> &'static str {
        match self {
            Self::None => "n",
            Self::Majority => "m",
            Self::MajorityAndPersistToActive => "pa",
            Self::PersistToMajority => "pm",
        }
    }

    /// Parse the short form, defaulting to `Majority` for unknown codes
    pub fn from_short_code(code: &str) -> Self {
        match code {
            "n" => Self::None,
            "pa" => Self::MajorityAndPersistToActive,
            "pm" => Self::PersistToMajority,
            _ => Self::Majority,
        }
    }
}

/// Configuration shared by every transaction run through one `Transactions` instance
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Wall-clock budget of a whole transaction, across attempts
    #[serde(with = "millis")]
    pub expiration: Duration,
    /// Per-operation timeout handed to the store
    #[serde(with = "opt_millis")]
    pub key_value_timeout: Option<Duration>,
    /// Durability of staged and unstaged writes
    pub durability: DurabilityLevel,
    /// Every assigned ATR is visited once per window
    #[serde(with = "millis")]
    pub cleanup_window: Duration,
    /// Run the lost-transaction sweepers
    pub cleanup_lost_attempts: bool,
    /// Where ATRs live; defaults to the first mutated document's bucket default collection
    pub metadata_collection: Option<Keyspace>,
    /// Size of the ATR id space
    pub num_atrs: usize,
    /// Log redaction of user data
    pub redaction: RedactionLevel,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            expiration: Duration::from_secs(15),
            key_value_timeout: None,
            durability: DurabilityLevel::Majority,
            cleanup_window: Duration::from_secs(60),
            cleanup_lost_attempts: true,
            metadata_collection: None,
            num_atrs: MAX_ATRS,
            redaction: RedactionLevel::None,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A value is out of range
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: Box<str>,
    },
    /// Config could not be parsed
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    /// Config file could not be read
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransactionConfig {
    /// Check ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.expiration.is_zero() {
            return Err(ConfigError::Invalid {
                field: "expiration",
                reason: "must be greater than zero".into(),
            });
        }
        if self.cleanup_window.is_zero() {
            return Err(ConfigError::Invalid {
                field: "cleanup_window",
                reason: "must be greater than zero".into(),
            });
        }
        if self.num_atrs == 0 || self.num_atrs > MAX_ATRS {
            return Err(ConfigError::Invalid {
                field: "num_atrs",
                reason: format!("must be within 1..={MAX_ATRS}").into(),
            });
        }
        Ok(())
    }

    /// Parse and validate a JSON config
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|v| v.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = TransactionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.expiration, Duration::from_secs(15));
        assert_eq!(config.num_atrs, 1024);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = TransactionConfig::from_json_str(r#"{"expiration": 2500, "durability": "none"}"#).unwrap();
        assert_eq!(config.expiration, Duration::from_millis(2500));
        assert_eq!(config.durability, DurabilityLevel::None);
        assert_eq!(config.cleanup_window, Duration::from_secs(60));
    }

    #[test]
    fn test_rejects_out_of_range() {
        let err = TransactionConfig::from_json_str(r#"{"num_atrs": 4096}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "num_atrs", .. }));

        let err = TransactionConfig::from_json_str(r#"{"cleanup_window": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "cleanup_window", .. }));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"metadata_collection": {{"bucket": "meta", "scope": "txn", "collection": "atrs"}}, "key_value_timeout": 750}}"#
        )
        .unwrap();

        let config = TransactionConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.metadata_collection, Some(Keyspace::new("meta", "txn", "atrs")));
        assert_eq!(config.key_value_timeout, Some(Duration::from_millis(750)));
    }

    #[test]
    fn test_durability_short_codes() {
        for level in [
            DurabilityLevel::None,
            DurabilityLevel::Majority,
            DurabilityLevel::MajorityAndPersistToActive,
            DurabilityLevel::PersistToMajority,
        ] {
            assert_eq!(DurabilityLevel::from_short_code(level.short_code()), level);
        }
    }
}
