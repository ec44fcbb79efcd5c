//! Shared serialization/deserialization utilities for configuration
//!
//! This module provides common serde helpers used across configuration types.

/// Helper module for Duration serialization as seconds
///
/// This module serializes `std::time::Duration` as a u64 representing
/// seconds, which is more human-readable in TOML configuration files
/// than the derived `{secs, nanos}` pair.
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Config {
///     #[serde(with = "hawser_core::config::serde_utils::duration_secs")]
///     heartbeat_interval: Duration,
/// }
/// ```
pub mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize a Duration as seconds (u64)
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    /// Deserialize a Duration from seconds (u64)
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct TestConfig {
        #[serde(with = "duration_secs")]
        interval: Duration,
    }

    #[test]
    fn test_duration_secs_serialize() {
        let config = TestConfig {
            interval: Duration::from_secs(30),
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"interval":30}"#);
    }

    #[test]
    fn test_duration_secs_deserialize() {
        let json = r#"{"interval":300}"#;
        let config: TestConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.interval, Duration::from_secs(300));
    }

    #[test]
    fn test_duration_secs_roundtrip() {
        let original = TestConfig {
            interval: Duration::from_secs(21600),
        };
        let json = serde_json::to_string(&original).unwrap();
        let parsed: TestConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(original, parsed);
    }
}
