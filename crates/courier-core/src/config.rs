use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, CoreErrorKind, CoreResult};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_LOG_FILTER: &str = "info";

pub const ENV_DEFAULT_TIMEOUT_MS: &str = "COURIER_DEFAULT_TIMEOUT_MS";
pub const ENV_DISCOVERY_TIMEOUT_MS: &str = "COURIER_DISCOVERY_TIMEOUT_MS";
pub const ENV_LOG: &str = "COURIER_LOG";

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemotingConfig {
    /// Applied to invocations whose service and descriptor specify no timeout.
    #[serde(rename = "default_timeout_ms", with = "millis")]
    pub default_timeout: Duration,
    #[serde(rename = "discovery_timeout_ms", with = "millis")]
    pub discovery_timeout: Duration,
    pub log_filter: String,
}

impl Default for RemotingConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl RemotingConfig {
    pub fn from_json(json: &str) -> CoreResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|error| {
            CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("invalid remoting config: {error}"),
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> CoreResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `lookup`, which plays the role of the environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> CoreResult<Self> {
        let mut config = Self::default();
        if let Some(value) = lookup(ENV_DEFAULT_TIMEOUT_MS) {
            config.default_timeout = parse_millis(ENV_DEFAULT_TIMEOUT_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_DISCOVERY_TIMEOUT_MS) {
            config.discovery_timeout = parse_millis(ENV_DISCOVERY_TIMEOUT_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_LOG)
            && !value.trim().is_empty()
        {
            config.log_filter = value;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.default_timeout.is_zero() {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "default timeout must be greater than zero",
            ));
        }
        if self.discovery_timeout.is_zero() {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "discovery timeout must be greater than zero",
            ));
        }
        Ok(())
    }
}

fn parse_millis(key: &str, value: &str) -> CoreResult<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|error| {
            CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("{key} must be a whole number of milliseconds: {error}"),
            )
        })
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::{ENV_DEFAULT_TIMEOUT_MS, ENV_LOG, RemotingConfig};
    use crate::models::CoreErrorKind;

    #[test]
    fn json_fields_are_optional() {
        let config = RemotingConfig::from_json(r#"{"default_timeout_ms": 1500}"#).unwrap();
        assert_eq!(config.default_timeout, Duration::from_millis(1500));
        assert_eq!(config.discovery_timeout, super::DEFAULT_DISCOVERY_TIMEOUT);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn lookup_overrides_defaults() {
        let env: HashMap<&str, &str> =
            HashMap::from([(ENV_DEFAULT_TIMEOUT_MS, "250"), (ENV_LOG, "courier_core=debug")]);
        let config =
            RemotingConfig::from_lookup(|key| env.get(key).map(|value| value.to_string())).unwrap();

        assert_eq!(config.default_timeout, Duration::from_millis(250));
        assert_eq!(config.log_filter, "courier_core=debug");
    }

    #[test]
    fn zero_or_garbage_timeouts_are_rejected() {
        let zero = RemotingConfig::from_json(r#"{"default_timeout_ms": 0}"#).unwrap_err();
        assert_eq!(zero.kind, CoreErrorKind::InvalidInput);

        let garbage = RemotingConfig::from_lookup(|key| {
            (key == ENV_DEFAULT_TIMEOUT_MS).then(|| "soon".to_string())
        })
        .unwrap_err();
        assert_eq!(garbage.kind, CoreErrorKind::InvalidInput);
    }
}
