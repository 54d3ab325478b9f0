//! Deployment configuration for the settlement engine.
//!
//! Loaded from `<store root>/config.toml`. A missing file means defaults;
//! unknown keys are rejected so a typo'd cap never silently falls back.
//! The config is constructed once and passed explicitly — there is no
//! module-level singleton to mutate behind a caller's back.

use crate::core::error::TidepoolError;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LedgerConfig {
    /// Pending reservations older than this are eligible for the expiry sweep.
    pub reservation_ttl_secs: u64,
    /// Cooldown between rule approval and the earliest non-emergency activation.
    pub rule_cooldown_secs: u64,
    /// Distribution pools below this are rejected before any computation.
    pub min_pool_micro: i64,
    /// Payout fee in basis points of the requested amount.
    pub payout_fee_bps: i64,
    /// Bounded retry attempts for treasury compare-and-swap.
    pub treasury_cas_attempts: u32,
    /// Daily cap applied when an account has no explicit spending limit.
    pub default_daily_cap_micro: i64,
    /// Budget window length; daily caps roll over on this cadence.
    pub budget_window_secs: u64,
    /// Bounded retry attempts for on-chain deposit verification.
    pub deposit_verify_attempts: u32,
    /// Base backoff between verification retries (doubles per attempt).
    pub deposit_backoff_ms: u64,
    /// Which payment adapter normalizes inbound webhook payloads.
    pub payment_provider: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_secs: 900,
            rule_cooldown_secs: 86_400,
            min_pool_micro: 1_000,
            payout_fee_bps: 250,
            treasury_cas_attempts: 5,
            default_daily_cap_micro: 25_000_000,
            budget_window_secs: 86_400,
            deposit_verify_attempts: 4,
            deposit_backoff_ms: 250,
            payment_provider: "paddle".to_string(),
        }
    }
}

impl LedgerConfig {
    pub fn load(root: &Path) -> Result<Self, TidepoolError> {
        let path = root.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).map_err(TidepoolError::IoError)?;
        let config: LedgerConfig = toml::from_str(&content).map_err(|e| {
            TidepoolError::ConfigError(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TidepoolError> {
        if self.min_pool_micro < 0 {
            return Err(TidepoolError::ConfigError(
                "min_pool_micro must be non-negative".to_string(),
            ));
        }
        if self.treasury_cas_attempts == 0 {
            return Err(TidepoolError::ConfigError(
                "treasury_cas_attempts must be at least 1".to_string(),
            ));
        }
        if self.deposit_verify_attempts == 0 {
            return Err(TidepoolError::ConfigError(
                "deposit_verify_attempts must be at least 1".to_string(),
            ));
        }
        if self.budget_window_secs == 0 {
            return Err(TidepoolError::ConfigError(
                "budget_window_secs must be positive".to_string(),
            ));
        }
        match self.payment_provider.as_str() {
            "paddle" | "nowpayments" | "x402" => Ok(()),
            other => Err(TidepoolError::ConfigError(format!(
                "unknown payment_provider '{}'; expected paddle, nowpayments, or x402",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = LedgerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.payout_fee_bps, 250);
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let tmp = std::env::temp_dir().join(format!("tidepool_cfg_{}", ulid::Ulid::new()));
        std::fs::create_dir_all(&tmp).expect("tempdir");
        let config = LedgerConfig::load(&tmp).expect("defaults");
        assert_eq!(config.reservation_ttl_secs, 900);
        std::fs::remove_dir_all(&tmp).ok();
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let parsed: Result<LedgerConfig, _> = toml::from_str("mystery_knob = 7");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let config = LedgerConfig {
            payment_provider: "stripe".to_string(),
            ..LedgerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
