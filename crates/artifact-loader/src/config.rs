use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::loader::{MAX_CACHE_BYTES, MAX_THREADS};

/// What happens to a request for a key that is already being computed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// The request is silently dropped, only the listener of the first request is notified.
    #[default]
    Drop,
    /// The listener is attached to the computation in flight and notified along with the
    /// listener of the first request.
    FanOut,
}

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
    /// The log level for the loader.
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
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "artifact_loader".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Configuration of a [`Loader`](crate::Loader).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The number of worker threads computing artifacts.
    ///
    /// Values above [`MAX_THREADS`] are clamped down.
    pub max_threads: usize,

    /// The capacity of the in-memory cache, in bytes.
    ///
    /// Values above [`MAX_CACHE_BYTES`] are clamped down.
    pub max_cache_bytes: u64,

    /// How requests for keys that are already being computed are handled.
    pub duplicate_policy: DuplicatePolicy,

    /// The name given to the worker threads.
    pub thread_name: String,

    /// The time after which idle worker threads are stopped.
    #[serde(with = "humantime_serde")]
    pub worker_keep_alive: Duration,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_threads: MAX_THREADS,
            max_cache_bytes: MAX_CACHE_BYTES,
            duplicate_policy: DuplicatePolicy::default(),
            thread_name: "artifact-loader".into(),
            worker_keep_alive: Duration::from_secs(10),
            logging: Logging::default(),
            metrics: Metrics::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from the YAML file at `path`, or returns the defaults.
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
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.max_threads, 4);
        assert_eq!(cfg.max_cache_bytes, 8 * 1024 * 1024);
        assert_eq!(cfg.duplicate_policy, DuplicatePolicy::Drop);
        assert_eq!(cfg.worker_keep_alive, Duration::from_secs(10));
        assert_eq!(cfg.logging.level, LevelFilter::INFO);
    }

    #[test]
    fn test_partial_config() {
        let yaml = r#"
            max_threads: 2
            duplicate_policy: fan_out
            worker_keep_alive: 1m
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.max_threads, 2);
        assert_eq!(cfg.max_cache_bytes, MAX_CACHE_BYTES);
        assert_eq!(cfg.duplicate_policy, DuplicatePolicy::FanOut);
        assert_eq!(cfg.worker_keep_alive, Duration::from_secs(60));
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert!(cfg.logging.enable_backtraces);
        assert_eq!(cfg.thread_name, "artifact-loader");
    }

    #[test]
    fn test_invalid_level() {
        let yaml = r#"
            logging:
              level: loud
        "#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            not_a_setting: 1h
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
