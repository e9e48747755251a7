use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::engine::retry::RetryPolicy;
use crate::utils::plan_limits::TierLimits;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} has an invalid value: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Tunables for the reconciliation engine itself. Everything here has a
/// default so tests and local runs can use `EngineConfig::default()`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tier_limits: TierLimits,
    /// Read-check-increment budget for the capacity gate.
    pub capacity_retry: RetryPolicy,
    /// Per-group budget for a cascade write.
    pub cascade_retry: RetryPolicy,
    /// Read-compute-CAS budget for tier transitions.
    pub tier_cas_retry: RetryPolicy,
    /// Claims older than this with no `applied_at` may be taken over.
    pub event_claim_timeout: Duration,
    pub audit_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tier_limits: TierLimits::default(),
            capacity_retry: RetryPolicy {
                max_attempts: 8,
                initial_delay: Duration::from_millis(2),
                max_delay: Duration::from_millis(50),
                backoff_multiplier: 2.0,
            },
            cascade_retry: RetryPolicy {
                max_attempts: 5,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(5),
                backoff_multiplier: 2.0,
            },
            tier_cas_retry: RetryPolicy {
                max_attempts: 10,
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(200),
                backoff_multiplier: 2.0,
            },
            event_claim_timeout: Duration::from_secs(30 * 60),
            audit_interval: Duration::from_secs(300),
        }
    }
}

pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub webhook_secret: String,
    pub webhook_tolerance: Duration,
    pub sentry_dsn: Option<String>,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok(); // Load .env file

        let database_url = required("DATABASE_URL")?;
        let webhook_secret = required("BILLING_WEBHOOK_SECRET")?;
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let sentry_dsn = env::var("SENTRY_DSN").ok().filter(|v| !v.trim().is_empty());

        let defaults = EngineConfig::default();
        let tier_limits = TierLimits {
            free_max_members: parsed("FREE_MAX_MEMBERS", defaults.tier_limits.free_max_members)?,
            trial_max_members: parsed(
                "TRIAL_MAX_MEMBERS",
                defaults.tier_limits.trial_max_members,
            )?,
            free_monthly_event_quota: parsed(
                "FREE_MONTHLY_EVENT_QUOTA",
                defaults.tier_limits.free_monthly_event_quota,
            )?,
            trial_monthly_event_quota: parsed(
                "TRIAL_MONTHLY_EVENT_QUOTA",
                defaults.tier_limits.trial_monthly_event_quota,
            )?,
        };

        let cascade_initial_ms: u64 = parsed(
            "CASCADE_INITIAL_BACKOFF_MS",
            defaults.cascade_retry.initial_delay.as_millis() as u64,
        )?;

        let engine = EngineConfig {
            tier_limits,
            capacity_retry: RetryPolicy {
                max_attempts: parsed("CAPACITY_MAX_ATTEMPTS", defaults.capacity_retry.max_attempts)?,
                ..defaults.capacity_retry.clone()
            },
            cascade_retry: RetryPolicy {
                max_attempts: parsed("CASCADE_MAX_ATTEMPTS", defaults.cascade_retry.max_attempts)?,
                initial_delay: Duration::from_millis(cascade_initial_ms),
                ..defaults.cascade_retry.clone()
            },
            tier_cas_retry: RetryPolicy {
                max_attempts: parsed("TIER_CAS_MAX_ATTEMPTS", defaults.tier_cas_retry.max_attempts)?,
                ..defaults.tier_cas_retry.clone()
            },
            event_claim_timeout: Duration::from_secs(parsed(
                "EVENT_CLAIM_TIMEOUT_SECONDS",
                defaults.event_claim_timeout.as_secs(),
            )?),
            audit_interval: Duration::from_secs(parsed(
                "AUDIT_INTERVAL_SECONDS",
                defaults.audit_interval.as_secs(),
            )?),
        };

        Ok(Config {
            database_url,
            bind_addr,
            webhook_secret,
            webhook_tolerance: Duration::from_secs(parsed("WEBHOOK_TOLERANCE_SECONDS", 300u64)?),
            sentry_dsn,
            engine,
        })
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(key))
}

fn parsed<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse::<T>()
                .map_err(|_| ConfigError::Invalid { key, value: raw })
        }
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsed_falls_back_to_default_when_unset() {
        let value: i64 = parsed("SUBSCRIPTION_ENGINE_TEST_UNSET_KEY", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn parsed_rejects_garbage() {
        env::set_var("SUBSCRIPTION_ENGINE_TEST_GARBAGE_KEY", "ten");
        let err = parsed::<i64>("SUBSCRIPTION_ENGINE_TEST_GARBAGE_KEY", 1).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        env::remove_var("SUBSCRIPTION_ENGINE_TEST_GARBAGE_KEY");
    }

    #[test]
    fn default_capacity_budget_is_bounded() {
        let cfg = EngineConfig::default();
        assert!(cfg.capacity_retry.max_attempts > 0);
        assert!(cfg.capacity_retry.max_delay <= Duration::from_secs(1));
    }
}
