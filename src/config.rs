use crate::application::policy::CapturePolicy;
use crate::error::ConfigError;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Timing and retry settings for the orchestration engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub capture: CapturePolicy,
    /// Pause before resuming after a recoverable processing failure.
    pub resume_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capture: CapturePolicy::default(),
            resume_delay: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivityConfig {
    pub stall_timeout: Duration,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TerminalConfig {
    pub engine: EngineConfig,
    pub connectivity: ConnectivityConfig,
    /// JSON file holding the remembered reader. In memory when unset.
    pub reader_store: Option<PathBuf>,
}

impl TerminalConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_map(&env::vars().collect())
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let max_attempts = parse(
            vars,
            "PAYDESK_CAPTURE_MAX_ATTEMPTS",
            defaults.engine.capture.max_attempts,
        )?;
        if max_attempts == 0 {
            return Err(ConfigError::MustBePositive {
                key: "PAYDESK_CAPTURE_MAX_ATTEMPTS".to_string(),
            });
        }

        Ok(Self {
            engine: EngineConfig {
                capture: CapturePolicy {
                    max_attempts,
                    delay: millis(
                        vars,
                        "PAYDESK_CAPTURE_RETRY_DELAY_MS",
                        defaults.engine.capture.delay,
                    )?,
                },
                resume_delay: millis(vars, "PAYDESK_RESUME_DELAY_MS", defaults.engine.resume_delay)?,
            },
            connectivity: ConnectivityConfig {
                stall_timeout: millis(
                    vars,
                    "PAYDESK_DISCOVERY_STALL_MS",
                    defaults.connectivity.stall_timeout,
                )?,
            },
            reader_store: optional(vars, "PAYDESK_READER_STORE").map(PathBuf::from),
        })
    }
}

fn optional(vars: &HashMap<String, String>, key: &str) -> Option<String> {
    vars.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse<T: FromStr>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T, ConfigError> {
    match optional(vars, key) {
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

fn millis(vars: &HashMap<String, String>, key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse(vars, key, default_ms).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = TerminalConfig::from_map(&HashMap::new()).unwrap();
        assert_eq!(config.engine.capture.max_attempts, 5);
        assert_eq!(config.engine.capture.delay, Duration::from_secs(1));
        assert_eq!(config.engine.resume_delay, Duration::from_secs(3));
        assert_eq!(config.connectivity.stall_timeout, Duration::from_secs(10));
        assert_eq!(config.reader_store, None);
    }

    #[test]
    fn test_overrides() {
        let config = TerminalConfig::from_map(&vars(&[
            ("PAYDESK_CAPTURE_MAX_ATTEMPTS", "3"),
            ("PAYDESK_CAPTURE_RETRY_DELAY_MS", "250"),
            ("PAYDESK_RESUME_DELAY_MS", "10"),
            ("PAYDESK_DISCOVERY_STALL_MS", "500"),
            ("PAYDESK_READER_STORE", "/tmp/reader.json"),
        ]))
        .unwrap();

        assert_eq!(config.engine.capture.max_attempts, 3);
        assert_eq!(config.engine.capture.delay, Duration::from_millis(250));
        assert_eq!(config.engine.resume_delay, Duration::from_millis(10));
        assert_eq!(config.connectivity.stall_timeout, Duration::from_millis(500));
        assert_eq!(config.reader_store, Some(PathBuf::from("/tmp/reader.json")));
    }

    #[test]
    fn test_invalid_value_is_rejected() {
        let err = TerminalConfig::from_map(&vars(&[("PAYDESK_RESUME_DELAY_MS", "soon")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "PAYDESK_RESUME_DELAY_MS".to_string(),
                value: "soon".to_string(),
            }
        );
    }

    #[test]
    fn test_zero_capture_attempts_is_rejected() {
        let err = TerminalConfig::from_map(&vars(&[("PAYDESK_CAPTURE_MAX_ATTEMPTS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MustBePositive { .. }));
    }
}
