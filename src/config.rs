//! Startup configuration.
//!
//! Layered load: `config.toml` (optional) then `PERPBOT_`-prefixed
//! environment variables. Validation happens exactly once at startup;
//! an invalid configuration is fatal before the first cycle runs.
//!
//! `RiskLimits` lives here because it is also the payload of the runtime
//! configuration-update entry point; the admission controller's mutable
//! state is a separate value and never contains limits.

use crate::error::{BotError, Result};
use crate::regime::RegimeConfig;
use crate::risk::correlation::CorrelationConfig;
use crate::risk::exit::ExitConfig;
use crate::risk::sizing::SizingConfig;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Per-mode trade ceilings for the admission controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModeLimits {
    pub hourly_limit: u32,
    /// `None` means unbounded (only meaningful for the elastic mode).
    #[serde(default)]
    pub daily_limit: Option<u32>,
}

/// Immutable admission-controller configuration.
///
/// `upgrade_pnl_pct > downgrade_pnl_pct` is enforced so the mode switch
/// cannot oscillate at a single boundary value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    pub conservative: ModeLimits,
    pub elastic: ModeLimits,
    /// Hard hourly ceiling that dominates both modes.
    pub absolute_hourly_max: u32,
    /// Daily P&L percent above which Conservative upgrades to Elastic.
    pub upgrade_pnl_pct: Decimal,
    /// Daily P&L percent below which Elastic downgrades to Conservative.
    pub downgrade_pnl_pct: Decimal,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            conservative: ModeLimits {
                hourly_limit: 4,
                daily_limit: Some(20),
            },
            elastic: ModeLimits {
                hourly_limit: 8,
                daily_limit: Some(50),
            },
            absolute_hourly_max: 10,
            upgrade_pnl_pct: dec!(0.5),
            downgrade_pnl_pct: dec!(0.2),
        }
    }
}

impl RiskLimits {
    pub fn validate(&self) -> Result<()> {
        if self.upgrade_pnl_pct <= self.downgrade_pnl_pct {
            return Err(BotError::Config(format!(
                "upgrade_pnl_pct ({}) must exceed downgrade_pnl_pct ({})",
                self.upgrade_pnl_pct, self.downgrade_pnl_pct
            )));
        }
        if self.absolute_hourly_max == 0 {
            return Err(BotError::Config(
                "absolute_hourly_max must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Scheduler and account settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Seconds between trading cycles.
    pub scan_interval_secs: u64,
    /// Starting balance used for total-P&L accounting. Must be positive.
    pub initial_balance: Decimal,
    /// Delay between successful executions within one cycle.
    pub execution_delay_ms: u64,
    /// How many recent cycle records feed the performance summary.
    pub performance_lookback: usize,
    /// How many symbols to take from the momentum ranking source.
    pub momentum_pool_limit: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            scan_interval_secs: 180,
            initial_balance: Decimal::ZERO,
            execution_delay_ms: 1000,
            performance_lookback: 100,
            momentum_pool_limit: 20,
        }
    }
}

/// Persistence locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Admission-controller state snapshot (JSON).
    pub admission_state_file: PathBuf,
    /// Per-cycle audit trail (JSONL, append-only).
    pub cycle_log_file: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            admission_state_file: PathBuf::from("data/admission_state.json"),
            cycle_log_file: PathBuf::from("data/cycle_log.jsonl"),
        }
    }
}

/// Full bot configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub engine: EngineSettings,
    pub limits: RiskLimits,
    pub sizing: SizingConfig,
    pub correlation: CorrelationConfig,
    pub exit: ExitConfig,
    pub regime: RegimeConfig,
    pub storage: StorageSettings,
}

impl BotConfig {
    /// Load from an optional TOML file layered with `PERPBOT_` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(p) = path {
            builder = builder.add_source(config::File::from(p));
        } else {
            builder = builder.add_source(config::File::with_name("config").required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("PERPBOT")
                .separator("__")
                .try_parsing(true),
        );

        let cfg: BotConfig = builder
            .build()
            .map_err(|e| BotError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| BotError::Config(e.to_string()))?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.initial_balance <= Decimal::ZERO {
            return Err(BotError::Config(
                "engine.initial_balance must be positive".into(),
            ));
        }
        if self.engine.scan_interval_secs == 0 {
            return Err(BotError::Config(
                "engine.scan_interval_secs must be positive".into(),
            ));
        }
        self.limits.validate()?;
        self.sizing.validate()?;
        self.correlation.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_limits_defaults() {
        let limits = RiskLimits::default();
        assert_eq!(limits.conservative.hourly_limit, 4);
        assert_eq!(limits.conservative.daily_limit, Some(20));
        assert_eq!(limits.elastic.hourly_limit, 8);
        assert_eq!(limits.absolute_hourly_max, 10);
        assert_eq!(limits.upgrade_pnl_pct, dec!(0.5));
        assert_eq!(limits.downgrade_pnl_pct, dec!(0.2));
        limits.validate().unwrap();
    }

    #[test]
    fn upgrade_must_exceed_downgrade() {
        let limits = RiskLimits {
            upgrade_pnl_pct: dec!(0.2),
            downgrade_pnl_pct: dec!(0.2),
            ..Default::default()
        };
        assert!(limits.validate().is_err());
    }

    #[test]
    fn initial_balance_is_required() {
        let cfg = BotConfig::default();
        assert!(cfg.validate().is_err());

        let mut cfg = BotConfig::default();
        cfg.engine.initial_balance = dec!(10000);
        cfg.validate().unwrap();
    }

    #[test]
    fn config_parses_from_toml() {
        let toml_str = r#"
[engine]
scan_interval_secs = 60
initial_balance = "5000"

[limits]
absolute_hourly_max = 6

[limits.elastic]
hourly_limit = 5
"#;
        let cfg: BotConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.engine.scan_interval_secs, 60);
        assert_eq!(cfg.engine.initial_balance, dec!(5000));
        assert_eq!(cfg.limits.absolute_hourly_max, 6);
        assert_eq!(cfg.limits.elastic.hourly_limit, 5);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.limits.conservative.hourly_limit, 4);
        cfg.validate().unwrap();
    }

    #[test]
    fn elastic_daily_limit_can_be_unbounded() {
        let toml_str = r#"
[limits.elastic]
hourly_limit = 8
"#;
        let cfg: BotConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.limits.elastic.daily_limit, None);
    }
}
