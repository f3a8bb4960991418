//! Confidence-tiered dynamic position sizing.
//!
//! Two entry points: [`PositionSizer::position_size`] maps a confidence
//! score plus account equity to a flat notional through fixed confidence
//! buckets, and [`PositionSizer::dynamic_risk`] scales the base risk
//! fraction by confidence, relative volatility, and portfolio heat
//! multiplier curves. Both refuse by returning zero rather than erroring.

use rust_decimal::{Decimal, MathematicalOps};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BotError, Result};
use crate::types::PositionSnapshot;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    /// Base risk per position as a fraction of equity.
    pub base_risk_pct: Decimal,
    /// Hard per-position ceiling as a fraction of equity.
    pub max_risk_pct: Decimal,
    /// Confidence scores below this size to zero.
    pub min_confidence: u8,
    /// Maximum simultaneous open positions.
    pub max_positions: usize,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            base_risk_pct: dec!(0.02),
            max_risk_pct: dec!(0.05),
            min_confidence: 65,
            max_positions: 3,
        }
    }
}

impl SizingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_risk_pct <= Decimal::ZERO || self.max_risk_pct <= Decimal::ZERO {
            return Err(BotError::Config(
                "risk fractions must be positive".to_string(),
            ));
        }
        if self.base_risk_pct > self.max_risk_pct {
            return Err(BotError::Config(format!(
                "base_risk_pct {} exceeds max_risk_pct {}",
                self.base_risk_pct, self.max_risk_pct
            )));
        }
        if self.max_positions == 0 {
            return Err(BotError::Config("max_positions must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Qualitative label attached to a size recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeLabel {
    /// High confidence, cool portfolio, calm market.
    Optimal,
    /// Decent confidence with moderate exposure.
    Moderate,
    /// Signal above the floor but conditions argue for a small probe.
    Probe,
    /// Below the confidence floor; size is forced to zero.
    Skip,
}

impl std::fmt::Display for SizeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SizeLabel::Optimal => "optimal",
            SizeLabel::Moderate => "moderate",
            SizeLabel::Probe => "probe",
            SizeLabel::Skip => "skip",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeRecommendation {
    pub notional_usd: Decimal,
    pub risk_fraction: Decimal,
    pub portfolio_heat: Decimal,
    pub label: SizeLabel,
}

pub struct PositionSizer {
    config: SizingConfig,
}

impl PositionSizer {
    pub fn new(config: SizingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SizingConfig {
        &self.config
    }

    /// Flat confidence-bucket sizing. Zero means refuse.
    pub fn position_size(
        &self,
        confidence: u8,
        equity: Decimal,
        existing: &[PositionSnapshot],
    ) -> Decimal {
        if confidence < self.config.min_confidence {
            debug!(confidence, floor = self.config.min_confidence, "confidence below floor");
            return Decimal::ZERO;
        }
        if existing.len() >= self.config.max_positions {
            debug!(open = existing.len(), max = self.config.max_positions, "position slots full");
            return Decimal::ZERO;
        }

        let base = equity * self.config.base_risk_pct;
        let multiplier = match confidence {
            c if c >= 85 => dec!(1.0),
            c if c >= 80 => dec!(0.8),
            c if c >= 75 => dec!(0.6),
            c if c >= 70 => dec!(0.4),
            _ => dec!(0.2),
        };

        let size = base * multiplier;
        let cap = equity * self.config.max_risk_pct;
        size.min(cap)
    }

    /// Risk fraction scaled by confidence, relative volatility, and heat,
    /// clamped into [10% of base, max].
    pub fn dynamic_risk(
        &self,
        confidence: u8,
        volatility_ratio: Decimal,
        portfolio_heat: Decimal,
    ) -> Decimal {
        let risk = self.config.base_risk_pct
            * confidence_multiplier(confidence)
            * volatility_multiplier(volatility_ratio)
            * heat_multiplier(portfolio_heat);

        let floor = self.config.base_risk_pct * dec!(0.1);
        risk.clamp(floor, self.config.max_risk_pct)
    }

    /// Fraction of maximum allowed aggregate risk already committed, in [0, 1].
    pub fn portfolio_heat(&self, positions: &[PositionSnapshot], equity: Decimal) -> Decimal {
        if positions.is_empty() || equity <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let total_risk: Decimal = positions
            .iter()
            .map(|p| (p.quantity * p.mark_price).abs() / equity)
            .sum();

        let max_allowed = self.config.max_risk_pct * Decimal::from(self.config.max_positions as u64);
        (total_risk / max_allowed).min(Decimal::ONE)
    }

    /// Would adding `new_risk_fraction` push aggregate risk past the budget?
    pub fn check_risk_limits(
        &self,
        new_risk_fraction: Decimal,
        existing: &[PositionSnapshot],
        equity: Decimal,
    ) -> bool {
        if equity <= Decimal::ZERO {
            return false;
        }
        let existing_risk: Decimal = existing
            .iter()
            .map(|p| (p.quantity * p.mark_price).abs() / equity)
            .sum();
        let total = existing_risk + new_risk_fraction;
        let budget = self.config.max_risk_pct * Decimal::from(self.config.max_positions as u64);

        if total > budget {
            debug!(%total, %budget, "aggregate risk budget exceeded");
            return false;
        }
        true
    }

    /// Advisory flag: overheated portfolio or heavy recent losses.
    pub fn should_reduce_exposure(&self, portfolio_heat: Decimal, recent_pnl_pct: Decimal) -> bool {
        portfolio_heat > dec!(0.8) || recent_pnl_pct < dec!(-0.05)
    }

    /// Full recommendation: dynamic-risk notional plus a qualitative label.
    pub fn recommendation(
        &self,
        confidence: u8,
        equity: Decimal,
        existing: &[PositionSnapshot],
        volatility_ratio: Decimal,
    ) -> SizeRecommendation {
        let heat = self.portfolio_heat(existing, equity);
        let risk = self.dynamic_risk(confidence, volatility_ratio, heat);
        let mut notional = equity * risk;

        let label = if confidence >= 85 && heat < dec!(0.3) && volatility_ratio < dec!(1.5) {
            SizeLabel::Optimal
        } else if confidence >= 75 && heat < dec!(0.5) {
            SizeLabel::Moderate
        } else if confidence >= self.config.min_confidence {
            SizeLabel::Probe
        } else {
            notional = Decimal::ZERO;
            SizeLabel::Skip
        };

        SizeRecommendation {
            notional_usd: notional,
            risk_fraction: risk,
            portfolio_heat: heat,
            label,
        }
    }
}

/// Window of recent returns compared against the full series.
const SHORT_VOLATILITY_WINDOW: usize = 10;

/// Standard deviation of the last [`SHORT_VOLATILITY_WINDOW`] returns
/// relative to the whole series. 1.0 means the market is moving at its
/// recent-average pace; degenerate inputs also report 1.0 so they size
/// as a normal market rather than a quiet one.
pub fn volatility_ratio(prices: &[Decimal]) -> Decimal {
    let returns = simple_returns(prices);
    if returns.len() <= SHORT_VOLATILITY_WINDOW {
        return Decimal::ONE;
    }
    let full = std_dev(&returns);
    if full <= Decimal::ZERO {
        return Decimal::ONE;
    }
    let short = std_dev(&returns[returns.len() - SHORT_VOLATILITY_WINDOW..]);
    short / full
}

fn simple_returns(prices: &[Decimal]) -> Vec<Decimal> {
    prices
        .windows(2)
        .filter(|pair| pair[0] > Decimal::ZERO)
        .map(|pair| pair[1] / pair[0] - Decimal::ONE)
        .collect()
}

fn std_dev(values: &[Decimal]) -> Decimal {
    if values.len() < 2 {
        return Decimal::ZERO;
    }
    let n = Decimal::from(values.len() as u64);
    let mean = values.iter().sum::<Decimal>() / n;
    let variance = values
        .iter()
        .map(|v| {
            let d = *v - mean;
            d * d
        })
        .sum::<Decimal>()
        / n;
    variance.sqrt().unwrap_or(Decimal::ZERO)
}

fn confidence_multiplier(confidence: u8) -> Decimal {
    match confidence {
        c if c >= 90 => dec!(1.5),
        c if c >= 85 => dec!(1.2),
        c if c >= 80 => dec!(1.0),
        c if c >= 75 => dec!(0.8),
        c if c >= 70 => dec!(0.6),
        c if c >= 65 => dec!(0.4),
        _ => dec!(0.2),
    }
}

/// Volatility relative to its recent average; 1.0 is normal.
fn volatility_multiplier(ratio: Decimal) -> Decimal {
    match ratio {
        r if r > dec!(2.0) => dec!(0.5),
        r if r > dec!(1.5) => dec!(0.7),
        r if r > dec!(1.2) => dec!(0.9),
        r if r > dec!(0.8) => dec!(1.0),
        r if r > dec!(0.5) => dec!(1.1),
        // Unusually quiet markets often precede false breakouts.
        _ => dec!(0.8),
    }
}

fn heat_multiplier(heat: Decimal) -> Decimal {
    match heat {
        h if h > dec!(0.8) => dec!(0.3),
        h if h > dec!(0.6) => dec!(0.5),
        h if h > dec!(0.4) => dec!(0.7),
        _ => dec!(1.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PositionSide;
    use chrono::Utc;

    fn position(symbol: &str, notional: Decimal) -> PositionSnapshot {
        PositionSnapshot {
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            entry_price: dec!(100),
            mark_price: dec!(100),
            quantity: notional / dec!(100),
            leverage: 5,
            unrealized_pnl: Decimal::ZERO,
            unrealized_pnl_pct: Decimal::ZERO,
            liquidation_price: dec!(50),
            margin_used: notional / dec!(5),
            first_seen: Utc::now(),
            peak_pnl_pct: Decimal::ZERO,
        }
    }

    fn sizer() -> PositionSizer {
        PositionSizer::new(SizingConfig::default())
    }

    #[test]
    fn below_confidence_floor_sizes_to_zero() {
        for confidence in [0, 30, 64] {
            assert_eq!(
                sizer().position_size(confidence, dec!(10000), &[]),
                Decimal::ZERO
            );
        }
    }

    #[test]
    fn top_tier_confidence_gets_full_base_risk() {
        let size = sizer().position_size(90, dec!(10000), &[]);
        assert_eq!(size, dec!(200)); // 10,000 x 2% x 1.0
    }

    #[test]
    fn lower_tiers_scale_down() {
        let equity = dec!(10000);
        assert_eq!(sizer().position_size(82, equity, &[]), dec!(160));
        assert_eq!(sizer().position_size(76, equity, &[]), dec!(120));
        assert_eq!(sizer().position_size(71, equity, &[]), dec!(80));
        assert_eq!(sizer().position_size(65, equity, &[]), dec!(40));
    }

    #[test]
    fn full_slots_refuse_new_size() {
        let existing = vec![
            position("BTCUSDT", dec!(500)),
            position("ETHUSDT", dec!(500)),
            position("SOLUSDT", dec!(500)),
        ];
        assert_eq!(sizer().position_size(95, dec!(10000), &existing), Decimal::ZERO);
    }

    #[test]
    fn size_is_clamped_to_max_risk() {
        let config = SizingConfig {
            base_risk_pct: dec!(0.10),
            max_risk_pct: dec!(0.05),
            ..Default::default()
        };
        // Invalid as config (base > max) but the clamp must still hold.
        let sizer = PositionSizer::new(config);
        assert_eq!(sizer.position_size(90, dec!(10000), &[]), dec!(500));
    }

    #[test]
    fn dynamic_risk_scenario_high_confidence_cool_portfolio() {
        // equity 10,000, confidence 90, normal volatility, heat 0.1
        // => 2% x 1.5 x 1.0 x 1.0 = 3%, i.e. notional 300.
        let risk = sizer().dynamic_risk(90, dec!(1.0), dec!(0.1));
        assert_eq!(risk, dec!(0.030));
        assert_eq!(dec!(10000) * risk, dec!(300.0000));
    }

    #[test]
    fn dynamic_risk_is_clamped_into_band() {
        let s = sizer();
        // Worst case: 2% x 0.2 x 0.5 x 0.3 = 0.06%, below the 0.2% floor.
        assert_eq!(s.dynamic_risk(10, dec!(3.0), dec!(0.9)), dec!(0.002));
        // Best case never exceeds max_risk_pct.
        assert!(s.dynamic_risk(99, dec!(1.0), dec!(0.0)) <= dec!(0.05));
    }

    #[test]
    fn portfolio_heat_reflects_committed_risk() {
        let s = sizer();
        assert_eq!(s.portfolio_heat(&[], dec!(10000)), Decimal::ZERO);

        // 750 notional against a 10,000 x 5% x 3 = 1,500 budget.
        let positions = vec![position("BTCUSDT", dec!(750))];
        assert_eq!(s.portfolio_heat(&positions, dec!(10000)), dec!(0.5));

        // Heat saturates at 1.0.
        let heavy = vec![position("BTCUSDT", dec!(5000))];
        assert_eq!(s.portfolio_heat(&heavy, dec!(10000)), Decimal::ONE);
    }

    #[test]
    fn risk_limits_reject_over_budget_totals() {
        let s = sizer();
        let existing = vec![position("BTCUSDT", dec!(1200))];
        // 12% existing + 2% new = 14% within the 15% budget.
        assert!(s.check_risk_limits(dec!(0.02), &existing, dec!(10000)));
        // 12% existing + 4% new = 16% exceeds it.
        assert!(!s.check_risk_limits(dec!(0.04), &existing, dec!(10000)));
    }

    #[test]
    fn reduce_exposure_triggers() {
        let s = sizer();
        assert!(s.should_reduce_exposure(dec!(0.85), Decimal::ZERO));
        assert!(s.should_reduce_exposure(dec!(0.1), dec!(-0.06)));
        assert!(!s.should_reduce_exposure(dec!(0.5), dec!(-0.01)));
    }

    #[test]
    fn recommendation_labels() {
        let s = sizer();
        let optimal = s.recommendation(90, dec!(10000), &[], dec!(1.0));
        assert_eq!(optimal.label, SizeLabel::Optimal);
        assert!(optimal.notional_usd > Decimal::ZERO);

        let probe = s.recommendation(66, dec!(10000), &[], dec!(1.0));
        assert_eq!(probe.label, SizeLabel::Probe);

        let skip = s.recommendation(50, dec!(10000), &[], dec!(1.0));
        assert_eq!(skip.label, SizeLabel::Skip);
        assert_eq!(skip.notional_usd, Decimal::ZERO);
    }

    #[test]
    fn volatility_ratio_needs_enough_history() {
        let short: Vec<Decimal> = (0..8).map(|i| dec!(100) + Decimal::from(i as u64)).collect();
        assert_eq!(volatility_ratio(&short), Decimal::ONE);
        assert_eq!(volatility_ratio(&[]), Decimal::ONE);
    }

    #[test]
    fn flat_series_reads_as_normal_volatility() {
        let flat = vec![dec!(100); 40];
        assert_eq!(volatility_ratio(&flat), Decimal::ONE);
    }

    #[test]
    fn calm_tail_after_noisy_open_reads_quiet() {
        // Choppy first 20 points, then a dead-flat tail: the short window
        // carries zero variance while the full series does not.
        let mut prices = Vec::new();
        for i in 0..20 {
            prices.push(if i % 2 == 0 { dec!(100) } else { dec!(103) });
        }
        prices.extend(std::iter::repeat(dec!(103)).take(12));
        assert_eq!(volatility_ratio(&prices), Decimal::ZERO);
    }

    #[test]
    fn noisy_tail_after_calm_open_reads_hot() {
        let mut prices = vec![dec!(100); 20];
        for i in 0..12 {
            prices.push(if i % 2 == 0 { dec!(100) } else { dec!(105) });
        }
        assert!(volatility_ratio(&prices) > Decimal::ONE);
    }

    #[test]
    fn config_validation() {
        assert!(SizingConfig::default().validate().is_ok());
        let bad = SizingConfig {
            base_risk_pct: dec!(0.10),
            max_risk_pct: dec!(0.05),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let zero_slots = SizingConfig {
            max_positions: 0,
            ..Default::default()
        };
        assert!(zero_slots.validate().is_err());
    }
}
