//! Configuration types
//!
//! Every tunable the core services read lives here. Files are TOML; durations
//! are written as integer milliseconds (`*_ms` keys).

use crate::{ConfigError, FleetResult, ScreenBounds};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod duration_ms_vec {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &[Duration], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(v.iter().map(|d| d.as_millis() as u64))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Duration>, D::Error> {
        Ok(Vec::<u64>::deserialize(d)?
            .into_iter()
            .map(Duration::from_millis)
            .collect())
    }
}

// ============================================================================
// BACKOFF POLICY
// ============================================================================

/// Delay between a failed delivery attempt and the next one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Fixed schedule; the last entry repeats.
    Schedule {
        #[serde(rename = "delays_ms", with = "duration_ms_vec")]
        delays: Vec<Duration>,
        #[serde(rename = "max_delay_ms", with = "duration_ms")]
        max_delay: Duration,
    },
    /// `initial * multiplier^(n-1)`.
    Exponential {
        #[serde(rename = "initial_ms", with = "duration_ms")]
        initial: Duration,
        multiplier: f64,
        #[serde(rename = "max_delay_ms", with = "duration_ms")]
        max_delay: Duration,
    },
}

impl BackoffPolicy {
    pub fn schedule(delays: Vec<Duration>, max_delay: Duration) -> Self {
        BackoffPolicy::Schedule { delays, max_delay }
    }

    pub fn exponential(initial: Duration, multiplier: f64, max_delay: Duration) -> Self {
        BackoffPolicy::Exponential {
            initial,
            multiplier,
            max_delay,
        }
    }

    /// Delay before retry number `retry` (1-based: the first retry is 1).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let n = retry.max(1);
        match self {
            BackoffPolicy::Schedule { delays, max_delay } => {
                let idx = (n as usize - 1).min(delays.len().saturating_sub(1));
                delays
                    .get(idx)
                    .copied()
                    .unwrap_or(Duration::ZERO)
                    .min(*max_delay)
            }
            BackoffPolicy::Exponential {
                initial,
                multiplier,
                max_delay,
            } => {
                let factor = multiplier.powi(n as i32 - 1);
                let millis = (initial.as_millis() as f64 * factor).min(max_delay.as_millis() as f64);
                Duration::from_millis(millis.max(0.0) as u64)
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            BackoffPolicy::Schedule { delays, max_delay } => {
                if delays.is_empty() {
                    return Err(invalid("backoff.delays_ms", "[]", "schedule must not be empty"));
                }
                if max_delay.is_zero() {
                    return Err(invalid("backoff.max_delay_ms", "0", "must be positive"));
                }
            }
            BackoffPolicy::Exponential {
                initial,
                multiplier,
                max_delay,
            } => {
                if initial.is_zero() {
                    return Err(invalid("backoff.initial_ms", "0", "must be positive"));
                }
                if *multiplier < 1.0 {
                    return Err(invalid(
                        "backoff.multiplier",
                        &multiplier.to_string(),
                        "must be at least 1.0",
                    ));
                }
                if max_delay < initial {
                    return Err(invalid(
                        "backoff.max_delay_ms",
                        &format!("{:?}", max_delay),
                        "must not be below initial_ms",
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::schedule(
            vec![
                Duration::from_secs(5),
                Duration::from_secs(15),
                Duration::from_secs(45),
            ],
            Duration::from_secs(300),
        )
    }
}

// ============================================================================
// SECTIONS
// ============================================================================

/// Locations of every shared document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub contracts: PathBuf,
    pub status: PathBuf,
    pub queue: PathBuf,
    pub dead_letters: PathBuf,
    pub registry: PathBuf,
    pub inbox_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let root = PathBuf::from("runtime");
        Self {
            contracts: root.join("contracts.json"),
            status: root.join("status.json"),
            queue: root.join("queue.json"),
            dead_letters: root.join("dead_letters.json"),
            registry: root.join("agents.json"),
            inbox_root: root.join("inboxes"),
        }
    }
}

/// Delivery adapter and verification timings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    #[serde(rename = "verification_timeout_ms", with = "duration_ms")]
    pub verification_timeout: Duration,
    #[serde(rename = "verification_poll_interval_ms", with = "duration_ms")]
    pub verification_poll_interval: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            verification_timeout: Duration::from_secs(10),
            verification_poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub default_max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: crate::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractsConfig {
    /// Read-validate-write attempts before a claim/complete gives up
    pub max_cas_retries: u32,
}

impl Default for ContractsConfig {
    fn default() -> Self {
        Self { max_cas_retries: 5 }
    }
}

/// Staleness thresholds. Both bounds are inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(rename = "healthy_within_ms", with = "duration_ms")]
    pub healthy_within: Duration,
    #[serde(rename = "stale_within_ms", with = "duration_ms")]
    pub stale_within: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            healthy_within: Duration::from_secs(30 * 60),
            stale_within: Duration::from_secs(2 * 60 * 60),
        }
    }
}

// ============================================================================
// MASTER CONFIG
// ============================================================================

/// Master configuration struct.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub paths: PathsConfig,
    pub delivery: DeliveryConfig,
    pub backoff: BackoffPolicy,
    pub queue: QueueConfig,
    pub contracts: ContractsConfig,
    pub monitor: MonitorConfig,
    pub screen: ScreenBounds,
}

impl FleetConfig {
    /// Parse a TOML document. Missing sections take their defaults.
    pub fn from_toml_str(s: &str) -> FleetResult<Self> {
        let config: FleetConfig = toml::from_str(s).map_err(|e| ConfigError::Unreadable {
            path: "<inline>".to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, then overlay `FLEET_*` environment variables.
    pub fn load(path: &Path) -> FleetResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config: FleetConfig = toml::from_str(&text).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config = config.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    ///
    /// Environment variables:
    /// - `FLEET_CONTRACTS_PATH`, `FLEET_STATUS_PATH`, `FLEET_QUEUE_PATH`,
    ///   `FLEET_DEAD_LETTERS_PATH`, `FLEET_REGISTRY_PATH`, `FLEET_INBOX_ROOT`
    /// - `FLEET_DELIVERY_TIMEOUT_SECS` (default: 30)
    /// - `FLEET_VERIFICATION_TIMEOUT_SECS` (default: 10)
    /// - `FLEET_MAX_ATTEMPTS` (default: 3)
    /// - `FLEET_MAX_CAS_RETRIES` (default: 5)
    /// - `FLEET_HEALTHY_WITHIN_SECS` (default: 1800)
    /// - `FLEET_STALE_WITHIN_SECS` (default: 7200)
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        fn var<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|s| s.parse().ok())
        }

        if let Some(p) = var::<PathBuf>("FLEET_CONTRACTS_PATH") {
            self.paths.contracts = p;
        }
        if let Some(p) = var::<PathBuf>("FLEET_STATUS_PATH") {
            self.paths.status = p;
        }
        if let Some(p) = var::<PathBuf>("FLEET_QUEUE_PATH") {
            self.paths.queue = p;
        }
        if let Some(p) = var::<PathBuf>("FLEET_DEAD_LETTERS_PATH") {
            self.paths.dead_letters = p;
        }
        if let Some(p) = var::<PathBuf>("FLEET_REGISTRY_PATH") {
            self.paths.registry = p;
        }
        if let Some(p) = var::<PathBuf>("FLEET_INBOX_ROOT") {
            self.paths.inbox_root = p;
        }
        if let Some(secs) = var::<u64>("FLEET_DELIVERY_TIMEOUT_SECS") {
            self.delivery.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = var::<u64>("FLEET_VERIFICATION_TIMEOUT_SECS") {
            self.delivery.verification_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = var::<u32>("FLEET_MAX_ATTEMPTS") {
            self.queue.default_max_attempts = n;
        }
        if let Some(n) = var::<u32>("FLEET_MAX_CAS_RETRIES") {
            self.contracts.max_cas_retries = n;
        }
        if let Some(secs) = var::<u64>("FLEET_HEALTHY_WITHIN_SECS") {
            self.monitor.healthy_within = Duration::from_secs(secs);
        }
        if let Some(secs) = var::<u64>("FLEET_STALE_WITHIN_SECS") {
            self.monitor.stale_within = Duration::from_secs(secs);
        }
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - all timeouts and poll intervals are positive
    /// - the backoff policy is well formed
    /// - `default_max_attempts` and `max_cas_retries` are at least 1
    /// - `stale_within >= healthy_within`
    /// - the screen envelope is non-degenerate
    pub fn validate(&self) -> FleetResult<()> {
        if self.delivery.timeout.is_zero() {
            return Err(invalid("delivery.timeout_ms", "0", "must be positive").into());
        }
        if self.delivery.verification_timeout.is_zero() {
            return Err(invalid("delivery.verification_timeout_ms", "0", "must be positive").into());
        }
        if self.delivery.verification_poll_interval.is_zero() {
            return Err(
                invalid("delivery.verification_poll_interval_ms", "0", "must be positive").into(),
            );
        }

        self.backoff.validate()?;

        if self.queue.default_max_attempts == 0 {
            return Err(invalid("queue.default_max_attempts", "0", "must be at least 1").into());
        }
        if self.contracts.max_cas_retries == 0 {
            return Err(invalid("contracts.max_cas_retries", "0", "must be at least 1").into());
        }

        if self.monitor.healthy_within.is_zero() {
            return Err(invalid("monitor.healthy_within_ms", "0", "must be positive").into());
        }
        if self.monitor.stale_within < self.monitor.healthy_within {
            return Err(invalid(
                "monitor.stale_within_ms",
                &format!("{:?}", self.monitor.stale_within),
                "must not be below healthy_within_ms",
            )
            .into());
        }

        if !self.screen.is_valid() {
            return Err(invalid(
                "screen",
                &format!("{:?}", self.screen),
                "min corner must be strictly below max corner",
            )
            .into());
        }

        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FleetError;

    #[test]
    fn test_default_config_is_valid() {
        assert!(FleetConfig::default().validate().is_ok());
    }

    #[test]
    fn test_default_backoff_schedule() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(15));
        assert_eq!(policy.delay_for(3), Duration::from_secs(45));
        // Last entry repeats
        assert_eq!(policy.delay_for(9), Duration::from_secs(45));
        // Zero is treated as the first retry
        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
    }

    #[test]
    fn test_exponential_backoff_caps() {
        let policy = BackoffPolicy::exponential(
            Duration::from_millis(100),
            2.0,
            Duration::from_millis(500),
        );
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
    }

    #[test]
    fn test_schedule_capped_by_max_delay() {
        let policy = BackoffPolicy::schedule(
            vec![Duration::from_secs(1), Duration::from_secs(100)],
            Duration::from_secs(10),
        );
        assert_eq!(policy.delay_for(2), Duration::from_secs(10));
    }

    #[test]
    fn test_from_toml_partial() {
        let config = FleetConfig::from_toml_str(
            r#"
            [paths]
            contracts = "/srv/fleet/contracts.json"

            [delivery]
            timeout_ms = 5000

            [backoff]
            kind = "exponential"
            initial_ms = 1000
            multiplier = 3.0
            max_delay_ms = 60000

            [monitor]
            healthy_within_ms = 60000
            stale_within_ms = 120000
            "#,
        )
        .unwrap();
        assert_eq!(config.paths.contracts, PathBuf::from("/srv/fleet/contracts.json"));
        assert_eq!(config.paths.queue, PathsConfig::default().queue);
        assert_eq!(config.delivery.timeout, Duration::from_secs(5));
        assert_eq!(config.delivery.verification_timeout, Duration::from_secs(10));
        assert_eq!(config.backoff.delay_for(2), Duration::from_secs(3));
        assert_eq!(config.monitor.healthy_within, Duration::from_secs(60));
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let mut config = FleetConfig::default();
        config.monitor.stale_within = Duration::from_secs(1);
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            FleetError::Config(ConfigError::InvalidValue { ref field, .. }) if field == "monitor.stale_within_ms"
        ));
    }

    #[test]
    fn test_validate_rejects_empty_schedule() {
        let mut config = FleetConfig::default();
        config.backoff = BackoffPolicy::schedule(vec![], Duration::from_secs(1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_cas_retries() {
        let mut config = FleetConfig::default();
        config.contracts.max_cas_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_rejects_garbage() {
        let err = FleetConfig::from_toml_str("delivery = 3").unwrap_err();
        assert!(matches!(err, FleetError::Config(ConfigError::Unreadable { .. })));
    }
}
