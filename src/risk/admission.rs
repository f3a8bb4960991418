//! Two-mode trade admission control with profit-driven hysteresis.
//!
//! The controller gates every new position open behind three ceilings: an
//! absolute hourly maximum that dominates everything, and per-mode hourly
//! and daily limits. The mode itself follows realized daily P&L: a good day
//! upgrades Conservative to Elastic, a drawdown downgrades it back. The
//! upgrade threshold sits strictly above the downgrade threshold so the
//! mode cannot thrash around a single boundary value.
//!
//! Counters reset on wall-clock hour and calendar-day boundaries; a new
//! trading day always starts Conservative regardless of where the previous
//! day ended. Mutable state is persisted after every consequential change
//! and restored on startup without ever touching the configured limits.

use chrono::{DateTime, Datelike, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::RiskLimits;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    Conservative,
    Elastic,
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Conservative => write!(f, "conservative"),
            TradingMode::Elastic => write!(f, "elastic"),
        }
    }
}

/// Mutable controller state, persisted across restarts.
///
/// Limits live in [`RiskLimits`] and are deliberately not part of this
/// struct: restoring a snapshot can never clobber configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionState {
    pub mode: TradingMode,
    pub daily_pnl: Decimal,
    /// Daily realized P&L as a percent of equity (0.5 means +0.5%).
    pub daily_pnl_pct: Decimal,
    pub hourly_count: u32,
    pub daily_count: u32,
    pub last_hourly_reset: DateTime<Utc>,
    pub last_daily_reset: DateTime<Utc>,
    pub last_mode_switch: Option<DateTime<Utc>>,
    pub upgrades_today: u32,
    pub downgrades_today: u32,
    pub rejections_today: u32,
}

impl AdmissionState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            mode: TradingMode::Conservative,
            daily_pnl: Decimal::ZERO,
            daily_pnl_pct: Decimal::ZERO,
            hourly_count: 0,
            daily_count: 0,
            last_hourly_reset: now,
            last_daily_reset: now,
            last_mode_switch: None,
            upgrades_today: 0,
            downgrades_today: 0,
            rejections_today: 0,
        }
    }
}

/// Outcome of an admission check. A refusal is expected control flow, not
/// an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdmissionVerdict {
    Permitted,
    Refused(String),
}

impl AdmissionVerdict {
    pub fn is_permitted(&self) -> bool {
        matches!(self, AdmissionVerdict::Permitted)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            AdmissionVerdict::Permitted => None,
            AdmissionVerdict::Refused(reason) => Some(reason),
        }
    }
}

/// A mode transition that fired during evaluation, for the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeTransition {
    pub from: TradingMode,
    pub to: TradingMode,
    pub daily_pnl_pct: Decimal,
    pub at: DateTime<Utc>,
}

/// Read-only metrics snapshot for monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionMetrics {
    pub mode: TradingMode,
    pub hourly_count: u32,
    pub daily_count: u32,
    pub daily_pnl_pct: Decimal,
    pub hourly_limit: u32,
    pub daily_limit: Option<u32>,
    pub absolute_hourly_max: u32,
    pub upgrades_today: u32,
    pub downgrades_today: u32,
    pub rejections_today: u32,
    /// Seconds until the hourly counter next resets.
    pub seconds_to_hourly_reset: u32,
}

pub struct AdmissionController {
    limits: RwLock<RiskLimits>,
    state: RwLock<AdmissionState>,
}

impl AdmissionController {
    pub fn new(limits: RiskLimits) -> Self {
        Self {
            limits: RwLock::new(limits),
            state: RwLock::new(AdmissionState::new(Utc::now())),
        }
    }

    /// Restore mutable state from a persisted snapshot. Configured limits
    /// are untouched.
    pub async fn restore(&self, snapshot: AdmissionState) {
        let mut state = self.state.write().await;
        *state = snapshot;
        info!(mode = %state.mode, hourly = state.hourly_count, daily = state.daily_count, "admission state restored");
    }

    /// Snapshot the mutable state for persistence.
    pub async fn snapshot(&self) -> AdmissionState {
        self.state.read().await.clone()
    }

    /// Replace the limits atomically. Invalid limits are rejected whole.
    pub async fn update_limits(&self, limits: RiskLimits) -> Result<()> {
        limits.validate()?;
        let mut current = self.limits.write().await;
        info!(?limits, "admission limits updated");
        *current = limits;
        Ok(())
    }

    pub async fn limits(&self) -> RiskLimits {
        self.limits.read().await.clone()
    }

    /// Fold realized P&L into today's tally.
    pub async fn record_pnl(&self, realized: Decimal, equity: Decimal) {
        let mut state = self.state.write().await;
        state.daily_pnl += realized;
        if equity > Decimal::ZERO {
            state.daily_pnl_pct = state.daily_pnl / equity * Decimal::ONE_HUNDRED;
        }
    }

    /// Evaluate mode transitions once per cycle, before any admission
    /// checks. Returns the transition if one fired.
    pub async fn evaluate_mode(&self, equity: Decimal) -> Option<ModeTransition> {
        self.evaluate_mode_at(equity, Utc::now()).await
    }

    pub async fn evaluate_mode_at(
        &self,
        equity: Decimal,
        now: DateTime<Utc>,
    ) -> Option<ModeTransition> {
        let limits = self.limits.read().await.clone();
        let mut state = self.state.write().await;
        apply_resets(&mut state, now);

        if equity > Decimal::ZERO {
            state.daily_pnl_pct = state.daily_pnl / equity * Decimal::ONE_HUNDRED;
        }

        let transition = match state.mode {
            TradingMode::Conservative if state.daily_pnl_pct > limits.upgrade_pnl_pct => {
                state.mode = TradingMode::Elastic;
                state.upgrades_today += 1;
                Some(TradingMode::Elastic)
            }
            TradingMode::Elastic if state.daily_pnl_pct < limits.downgrade_pnl_pct => {
                state.mode = TradingMode::Conservative;
                state.downgrades_today += 1;
                Some(TradingMode::Conservative)
            }
            _ => None,
        };

        transition.map(|to| {
            let from = match to {
                TradingMode::Elastic => TradingMode::Conservative,
                TradingMode::Conservative => TradingMode::Elastic,
            };
            state.last_mode_switch = Some(now);
            info!(%from, %to, pnl_pct = %state.daily_pnl_pct, "trading mode switched");
            ModeTransition {
                from,
                to,
                daily_pnl_pct: state.daily_pnl_pct,
                at: now,
            }
        })
    }

    /// Gate a new position open. Admission does not consume a counter
    /// slot; the caller calls [`record_trade`](Self::record_trade) after a
    /// confirmed execution.
    pub async fn check_admission(&self) -> AdmissionVerdict {
        self.check_admission_at(Utc::now()).await
    }

    pub async fn check_admission_at(&self, now: DateTime<Utc>) -> AdmissionVerdict {
        let limits = self.limits.read().await.clone();
        let mut state = self.state.write().await;
        apply_resets(&mut state, now);

        // The absolute ceiling dominates both modes.
        if state.hourly_count >= limits.absolute_hourly_max {
            state.rejections_today += 1;
            let reason = format!(
                "absolute hourly ceiling reached ({}/{})",
                state.hourly_count, limits.absolute_hourly_max
            );
            warn!(%reason, "open refused");
            return AdmissionVerdict::Refused(reason);
        }

        let mode_limits = match state.mode {
            TradingMode::Conservative => &limits.conservative,
            TradingMode::Elastic => &limits.elastic,
        };

        if state.hourly_count >= mode_limits.hourly_limit {
            state.rejections_today += 1;
            let reason = format!(
                "{} hourly limit reached ({}/{})",
                state.mode, state.hourly_count, mode_limits.hourly_limit
            );
            debug!(%reason, "open refused");
            return AdmissionVerdict::Refused(reason);
        }

        if let Some(daily_limit) = mode_limits.daily_limit {
            if state.daily_count >= daily_limit {
                state.rejections_today += 1;
                let reason = format!(
                    "{} daily limit reached ({}/{})",
                    state.mode, state.daily_count, daily_limit
                );
                debug!(%reason, "open refused");
                return AdmissionVerdict::Refused(reason);
            }
        }

        AdmissionVerdict::Permitted
    }

    /// Count a confirmed open against the hourly and daily windows.
    pub async fn record_trade(&self) {
        self.record_trade_at(Utc::now()).await;
    }

    pub async fn record_trade_at(&self, now: DateTime<Utc>) {
        let mut state = self.state.write().await;
        apply_resets(&mut state, now);
        state.hourly_count += 1;
        state.daily_count += 1;
    }

    pub async fn current_mode(&self) -> TradingMode {
        self.state.read().await.mode
    }

    pub async fn metrics(&self) -> AdmissionMetrics {
        self.metrics_at(Utc::now()).await
    }

    pub async fn metrics_at(&self, now: DateTime<Utc>) -> AdmissionMetrics {
        let limits = self.limits.read().await.clone();
        let state = self.state.read().await;
        let mode_limits = match state.mode {
            TradingMode::Conservative => &limits.conservative,
            TradingMode::Elastic => &limits.elastic,
        };
        AdmissionMetrics {
            mode: state.mode,
            hourly_count: state.hourly_count,
            daily_count: state.daily_count,
            daily_pnl_pct: state.daily_pnl_pct,
            hourly_limit: mode_limits.hourly_limit,
            daily_limit: mode_limits.daily_limit,
            absolute_hourly_max: limits.absolute_hourly_max,
            upgrades_today: state.upgrades_today,
            downgrades_today: state.downgrades_today,
            rejections_today: state.rejections_today,
            seconds_to_hourly_reset: 3600 - (now.minute() * 60 + now.second()),
        }
    }
}

/// Reset windows whose wall-clock boundary has been crossed. The daily
/// reset also forces Conservative: a new trading day always starts there.
fn apply_resets(state: &mut AdmissionState, now: DateTime<Utc>) {
    let last_hour = state.last_hourly_reset;
    if now.hour() != last_hour.hour() || now.ordinal() != last_hour.ordinal() || now.year() != last_hour.year() {
        state.hourly_count = 0;
        state.last_hourly_reset = now;
    }

    let last_day = state.last_daily_reset;
    if now.ordinal() != last_day.ordinal() || now.year() != last_day.year() {
        state.daily_count = 0;
        state.daily_pnl = Decimal::ZERO;
        state.daily_pnl_pct = Decimal::ZERO;
        state.upgrades_today = 0;
        state.downgrades_today = 0;
        state.rejections_today = 0;
        state.mode = TradingMode::Conservative;
        state.last_daily_reset = now;
        info!("daily admission reset, starting the day conservative");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModeLimits;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn controller() -> AdmissionController {
        AdmissionController::new(RiskLimits::default())
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, hour, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn fresh_controller_permits_opens() {
        let verdict = controller().check_admission_at(at(10, 0)).await;
        assert!(verdict.is_permitted());
    }

    #[tokio::test]
    async fn conservative_hourly_limit_refuses() {
        let c = controller();
        for _ in 0..4 {
            c.record_trade_at(at(10, 5)).await;
        }
        let verdict = c.check_admission_at(at(10, 30)).await;
        assert!(!verdict.is_permitted());
        assert!(verdict.reason().unwrap().contains("hourly"));
    }

    #[tokio::test]
    async fn absolute_ceiling_refuses_in_any_mode() {
        let c = controller();
        // Elastic mode via a strong profitable day.
        c.record_pnl(dec!(100), dec!(10000)).await;
        c.evaluate_mode_at(dec!(10000), at(9, 0)).await;
        assert_eq!(c.current_mode().await, TradingMode::Elastic);

        for _ in 0..10 {
            c.record_trade_at(at(9, 5)).await;
        }
        let verdict = c.check_admission_at(at(9, 30)).await;
        assert!(!verdict.is_permitted());
        assert!(verdict.reason().unwrap().contains("absolute"));
    }

    #[tokio::test]
    async fn hourly_counter_resets_on_hour_boundary() {
        let c = controller();
        for _ in 0..4 {
            c.record_trade_at(at(10, 50)).await;
        }
        assert!(!c.check_admission_at(at(10, 55)).await.is_permitted());
        // Next hour clears the hourly window but not the daily one.
        assert!(c.check_admission_at(at(11, 1)).await.is_permitted());
        let metrics = c.metrics_at(at(11, 2)).await;
        assert_eq!(metrics.daily_count, 4);
    }

    #[tokio::test]
    async fn upgrade_fires_once_until_downgraded() {
        let c = controller();
        c.record_pnl(dec!(100), dec!(10000)).await; // +1.0%
        let first = c.evaluate_mode_at(dec!(10000), at(9, 0)).await;
        assert!(first.is_some());
        assert_eq!(first.unwrap().to, TradingMode::Elastic);

        // Still profitable: no second upgrade.
        assert!(c.evaluate_mode_at(dec!(10000), at(9, 30)).await.is_none());

        // Drawdown below the downgrade threshold flips back.
        c.record_pnl(dec!(-90), dec!(10000)).await; // net +0.1%
        let down = c.evaluate_mode_at(dec!(10000), at(10, 0)).await;
        assert_eq!(down.unwrap().to, TradingMode::Conservative);
    }

    #[tokio::test]
    async fn hysteresis_band_holds_mode_steady() {
        let c = controller();
        c.record_pnl(dec!(100), dec!(10000)).await;
        c.evaluate_mode_at(dec!(10000), at(9, 0)).await;
        // Pull P&L into the band between downgrade (0.2) and upgrade (0.5).
        c.record_pnl(dec!(-70), dec!(10000)).await; // net +0.3%
        assert!(c.evaluate_mode_at(dec!(10000), at(9, 30)).await.is_none());
        assert_eq!(c.current_mode().await, TradingMode::Elastic);
    }

    #[tokio::test]
    async fn daily_rollover_forces_conservative_and_zeroes_tallies() {
        let c = controller();
        c.record_pnl(dec!(100), dec!(10000)).await;
        c.evaluate_mode_at(dec!(10000), at(9, 0)).await;
        for _ in 0..6 {
            c.record_trade_at(at(9, 10)).await;
        }
        assert_eq!(c.current_mode().await, TradingMode::Elastic);

        // Next calendar day.
        let next_day = Utc.with_ymd_and_hms(2026, 3, 11, 0, 5, 0).unwrap();
        assert!(c.check_admission_at(next_day).await.is_permitted());
        let metrics = c.metrics_at(next_day).await;
        assert_eq!(metrics.mode, TradingMode::Conservative);
        assert_eq!(metrics.hourly_count, 0);
        assert_eq!(metrics.daily_count, 0);
        assert_eq!(metrics.daily_pnl_pct, Decimal::ZERO);
        assert_eq!(metrics.upgrades_today, 0);
    }

    #[tokio::test]
    async fn elastic_daily_limit_may_be_unbounded() {
        let limits = RiskLimits {
            elastic: ModeLimits {
                hourly_limit: 8,
                daily_limit: None,
            },
            ..Default::default()
        };
        let c = AdmissionController::new(limits);
        c.record_pnl(dec!(100), dec!(10000)).await;
        c.evaluate_mode_at(dec!(10000), at(9, 0)).await;

        // Spread trades across hours to dodge the hourly ceilings;
        // with no daily bound the count alone never refuses.
        for hour in 9..16 {
            for _ in 0..7 {
                c.record_trade_at(at(hour, 5)).await;
            }
        }
        assert!(c.check_admission_at(at(16, 0)).await.is_permitted());
    }

    #[tokio::test]
    async fn restore_preserves_counters_not_limits() {
        let c = controller();
        let snapshot = AdmissionState {
            mode: TradingMode::Elastic,
            hourly_count: 3,
            daily_count: 12,
            daily_pnl: dec!(55),
            daily_pnl_pct: dec!(0.55),
            ..AdmissionState::new(at(9, 0))
        };
        c.restore(snapshot).await;

        assert_eq!(c.current_mode().await, TradingMode::Elastic);
        let metrics = c.metrics_at(at(9, 5)).await;
        assert_eq!(metrics.hourly_count, 3);
        assert_eq!(metrics.daily_count, 12);
        // Limits come from configuration, never the snapshot.
        assert_eq!(metrics.absolute_hourly_max, 10);
    }

    #[tokio::test]
    async fn admission_check_does_not_consume_a_slot() {
        let c = controller();
        for _ in 0..10 {
            assert!(c.check_admission_at(at(10, 0)).await.is_permitted());
        }
        assert_eq!(c.metrics_at(at(10, 1)).await.hourly_count, 0);
    }

    #[tokio::test]
    async fn update_limits_rejects_invalid_and_applies_valid() {
        let c = controller();
        let bad = RiskLimits {
            upgrade_pnl_pct: dec!(0.1),
            downgrade_pnl_pct: dec!(0.2),
            ..Default::default()
        };
        assert!(c.update_limits(bad).await.is_err());

        let tighter = RiskLimits {
            absolute_hourly_max: 2,
            ..Default::default()
        };
        c.update_limits(tighter).await.unwrap();
        for _ in 0..2 {
            c.record_trade_at(at(10, 0)).await;
        }
        assert!(!c.check_admission_at(at(10, 30)).await.is_permitted());
    }
}
