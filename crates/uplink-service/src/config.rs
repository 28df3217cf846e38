use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::calls::{CallPolicy, ErrorKind, RetryPolicy};

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: match env::var("STATSD_SERVER") {
                Ok(metrics_statsd) => Some(metrics_statsd),
                Err(_) => None,
            },
            prefix: "uplink".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Fine-tuning for how calls of one operation are dispatched.
///
/// Durations accept human-readable values such as `500ms` or `4s`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CallPolicyConfig {
    /// Total number of attempts per call, including the first.
    pub max_attempts: u32,

    /// Backoff before the first retry; doubles per subsequent retry.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound on the backoff between attempts.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Deadline for each individual attempt.
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Duration,

    /// Time-to-live for cached responses. Zero disables caching.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,

    /// Maximum number of responses kept in the cache.
    pub cache_capacity: u64,

    /// Error kinds that are retried.
    pub retry_on: Vec<ErrorKind>,
}

impl Default for CallPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
            attempt_timeout: Duration::from_secs(30),
            cache_ttl: Duration::ZERO,
            cache_capacity: 10 * 1024,
            retry_on: vec![ErrorKind::Timeout, ErrorKind::Transient],
        }
    }
}

impl From<&CallPolicyConfig> for CallPolicy {
    fn from(config: &CallPolicyConfig) -> Self {
        CallPolicy {
            retry: RetryPolicy {
                max_attempts: config.max_attempts,
                base_delay: config.base_delay,
                max_delay: config.max_delay,
                attempt_timeout: config.attempt_timeout,
                retry_on: config.retry_on.clone(),
            },
            cache_ttl: config.cache_ttl,
            cache_capacity: config.cache_capacity,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub logging: Logging,

    /// Metrics configuration.
    pub metrics: Metrics,

    /// Baseline policy for operations without an explicit entry in
    /// `policies`.
    pub default_policy: CallPolicyConfig,

    /// Per-operation policy overrides, keyed by operation name.
    pub policies: BTreeMap<String, CallPolicyConfig>,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// The dispatch policy for the given operation.
    pub fn policy(&self, operation: &str) -> CallPolicy {
        self.policies
            .get(operation)
            .unwrap_or(&self.default_policy)
            .into()
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_durations() {
        // It should be possible to set individual policies in reasonable
        // units without affecting other operations' default values.
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.default_policy.base_delay, Duration::from_millis(500));
        assert_eq!(cfg.default_policy.max_delay, Duration::from_secs(4));

        let yaml = r#"
            policies:
              moderate:
                attempt_timeout: 5s
                cache_ttl: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        let moderate = &cfg.policies["moderate"];
        assert_eq!(moderate.attempt_timeout, Duration::from_secs(5));
        assert_eq!(moderate.cache_ttl, Duration::from_secs(3600));
        // Unset fields fall back to the defaults.
        assert_eq!(moderate.max_attempts, 3);
        assert_eq!(moderate.base_delay, Duration::from_millis(500));

        let policy = cfg.policy("moderate");
        assert_eq!(policy.retry.attempt_timeout, Duration::from_secs(5));
        assert_eq!(policy.cache_ttl, Duration::from_secs(3600));

        // Operations without an override use the baseline.
        let policy = cfg.policy("generate");
        assert_eq!(policy.retry.attempt_timeout, Duration::from_secs(30));
        assert_eq!(policy.cache_ttl, Duration::ZERO);
    }

    #[test]
    fn test_retry_kinds() {
        let yaml = r#"
            default_policy:
              retry_on: ["timeout"]
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.default_policy.retry_on, vec![ErrorKind::Timeout]);
    }

    #[test]
    fn test_logging_level() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            policies:
              moderate:
                not_a_setting: 12
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }
}
