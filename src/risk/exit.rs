//! Dynamic exit evaluation.
//!
//! Decides, per position and per cycle, whether a requested close may
//! proceed. Every branch is a permit check: stop/target bands scaled by
//! ATR (with fixed-percent fail-open fallback when no ATR is available),
//! a full-exit profit tier, trend-reversal and momentum-extreme
//! overrides, and a trailing stop armed off the peak favorable excursion.
//! When no trigger fires the position is held.
//!
//! Peak tracking itself lives with the position snapshots in the engine;
//! this evaluator only reads the recorded peak.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{MarketSnapshot, PositionSide, PositionSnapshot};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    /// Stop distance as a multiple of ATR14.
    pub atr_multiplier: Decimal,
    /// Target distance as a multiple of the stop distance.
    pub reward_risk: Decimal,
    /// Fixed take-profit percent when no ATR is available.
    pub fallback_take_profit_pct: Decimal,
    /// Fixed stop-loss percent when no ATR is available (negative).
    pub fallback_stop_loss_pct: Decimal,
    /// Advisory partial-profit checkpoints, percent unrealized.
    pub partial_tiers_pct: Vec<Decimal>,
    /// Unrealized percent at and above which a full exit is permitted.
    pub full_exit_tier_pct: Decimal,
    /// Peak favorable excursion percent that arms the trailing stop.
    pub trailing_activation_pct: Decimal,
    /// Fraction of the peak that may be given back before the trailing
    /// stop fires.
    pub trailing_retracement: Decimal,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            atr_multiplier: dec!(2.0),
            reward_risk: dec!(1.5),
            fallback_take_profit_pct: dec!(0.5),
            fallback_stop_loss_pct: dec!(-2.0),
            partial_tiers_pct: vec![dec!(0.5), dec!(1.0), dec!(2.0)],
            full_exit_tier_pct: dec!(2.0),
            trailing_activation_pct: dec!(0.2),
            trailing_retracement: dec!(0.3),
        }
    }
}

/// Which permit check fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitTrigger {
    AtrStop,
    AtrTarget,
    FallbackStop,
    FallbackTarget,
    /// No market data to judge by; closing is never blocked blind.
    FailOpen,
    ProfitTier,
    TrendReversal,
    MomentumExtreme,
    TrailingStop,
}

impl std::fmt::Display for ExitTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitTrigger::AtrStop => "atr_stop",
            ExitTrigger::AtrTarget => "atr_target",
            ExitTrigger::FallbackStop => "fallback_stop",
            ExitTrigger::FallbackTarget => "fallback_target",
            ExitTrigger::FailOpen => "fail_open",
            ExitTrigger::ProfitTier => "profit_tier",
            ExitTrigger::TrendReversal => "trend_reversal",
            ExitTrigger::MomentumExtreme => "momentum_extreme",
            ExitTrigger::TrailingStop => "trailing_stop",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitVerdict {
    Close(ExitTrigger),
    Hold,
}

impl ExitVerdict {
    pub fn permits_close(&self) -> bool {
        matches!(self, ExitVerdict::Close(_))
    }
}

pub struct ExitEvaluator {
    config: ExitConfig,
}

impl ExitEvaluator {
    pub fn new(config: ExitConfig) -> Self {
        Self { config }
    }

    /// Evaluate whether `position` may be closed right now.
    ///
    /// `market` is the live snapshot for the position's symbol; pass
    /// `None` when market data could not be fetched this cycle.
    pub fn evaluate(&self, position: &PositionSnapshot, market: Option<&MarketSnapshot>) -> ExitVerdict {
        let key = position.key();
        let pnl_pct = position.unrealized_pnl_pct;

        let Some(market) = market else {
            warn!(%key, "no market data, falling back to fixed bands");
            return self.fallback(&key, pnl_pct);
        };

        let Some(atr) = market.atr14.filter(|a| *a > Decimal::ZERO) else {
            return self.fallback(&key, pnl_pct);
        };

        if let Some(trigger) = self.atr_bands(position, market.current_price, atr) {
            return ExitVerdict::Close(trigger);
        }

        if let Some(trigger) = self.profit_tiers(&key, pnl_pct) {
            return ExitVerdict::Close(trigger);
        }

        if self.trend_reversed(position, market) {
            info!(%key, price = %market.current_price, ema20 = %market.ema20, macd = %market.macd, "trend reversal exit");
            return ExitVerdict::Close(ExitTrigger::TrendReversal);
        }

        if self.momentum_extreme(position, market.rsi7) {
            info!(%key, rsi7 = %market.rsi7, "momentum extreme exit");
            return ExitVerdict::Close(ExitTrigger::MomentumExtreme);
        }

        if let Some(trigger) = self.trailing_stop(&key, position.peak_pnl_pct, pnl_pct) {
            return ExitVerdict::Close(trigger);
        }

        debug!(%key, %pnl_pct, peak = %position.peak_pnl_pct, "no exit trigger, holding");
        ExitVerdict::Hold
    }

    /// Fixed-percent bands when ATR is unavailable. Closing blind is
    /// always permitted; only the trigger label differs.
    fn fallback(&self, key: &str, pnl_pct: Decimal) -> ExitVerdict {
        if pnl_pct <= self.config.fallback_stop_loss_pct {
            info!(%key, %pnl_pct, "fallback stop-loss breached");
            return ExitVerdict::Close(ExitTrigger::FallbackStop);
        }
        if pnl_pct >= self.config.fallback_take_profit_pct {
            info!(%key, %pnl_pct, "fallback take-profit reached");
            return ExitVerdict::Close(ExitTrigger::FallbackTarget);
        }
        ExitVerdict::Close(ExitTrigger::FailOpen)
    }

    fn atr_bands(&self, position: &PositionSnapshot, price: Decimal, atr: Decimal) -> Option<ExitTrigger> {
        let stop_distance = atr * self.config.atr_multiplier;
        let target_distance = stop_distance * self.config.reward_risk;
        let entry = position.entry_price;

        match position.side {
            PositionSide::Long => {
                let stop = entry - stop_distance;
                let target = entry + target_distance;
                if price <= stop {
                    info!(key = %position.key(), %price, %stop, %atr, "long stop band breached");
                    return Some(ExitTrigger::AtrStop);
                }
                if price >= target {
                    info!(key = %position.key(), %price, %target, %atr, "long target band reached");
                    return Some(ExitTrigger::AtrTarget);
                }
            }
            PositionSide::Short => {
                let stop = entry + stop_distance;
                let target = entry - target_distance;
                if price >= stop {
                    info!(key = %position.key(), %price, %stop, %atr, "short stop band breached");
                    return Some(ExitTrigger::AtrStop);
                }
                if price <= target {
                    info!(key = %position.key(), %price, %target, %atr, "short target band reached");
                    return Some(ExitTrigger::AtrTarget);
                }
            }
        }
        None
    }

    /// Layered profit checkpoints. Only the top tier permits a full exit;
    /// lower tiers are advisory because partial closes are not wired into
    /// the execution path.
    fn profit_tiers(&self, key: &str, pnl_pct: Decimal) -> Option<ExitTrigger> {
        if pnl_pct >= self.config.full_exit_tier_pct {
            info!(%key, %pnl_pct, tier = %self.config.full_exit_tier_pct, "full profit tier reached");
            return Some(ExitTrigger::ProfitTier);
        }
        for tier in &self.config.partial_tiers_pct {
            if pnl_pct >= *tier {
                debug!(%key, %pnl_pct, %tier, "partial profit tier reached (advisory)");
            }
        }
        None
    }

    /// Long: price under the medium moving average with negative momentum.
    /// Mirrored for shorts.
    fn trend_reversed(&self, position: &PositionSnapshot, market: &MarketSnapshot) -> bool {
        match position.side {
            PositionSide::Long => {
                market.current_price < market.ema20 && market.macd < Decimal::ZERO
            }
            PositionSide::Short => {
                market.current_price > market.ema20 && market.macd > Decimal::ZERO
            }
        }
    }

    /// Overbought long or oversold short, but only while in profit.
    fn momentum_extreme(&self, position: &PositionSnapshot, rsi7: Decimal) -> bool {
        if position.unrealized_pnl_pct <= Decimal::ZERO {
            return false;
        }
        match position.side {
            PositionSide::Long => rsi7 > dec!(80),
            PositionSide::Short => rsi7 < dec!(20),
        }
    }

    /// Armed once the peak excursion clears the activation threshold;
    /// fires when the retracement from peak reaches the configured share.
    fn trailing_stop(&self, key: &str, peak_pnl_pct: Decimal, pnl_pct: Decimal) -> Option<ExitTrigger> {
        if peak_pnl_pct <= self.config.trailing_activation_pct {
            return None;
        }
        let retracement = (peak_pnl_pct - pnl_pct) / peak_pnl_pct;
        if retracement >= self.config.trailing_retracement {
            info!(%key, %peak_pnl_pct, %pnl_pct, %retracement, "trailing stop fired");
            return Some(ExitTrigger::TrailingStop);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn long_position(entry: Decimal, mark: Decimal, pnl_pct: Decimal, peak: Decimal) -> PositionSnapshot {
        PositionSnapshot {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            entry_price: entry,
            mark_price: mark,
            quantity: dec!(1),
            leverage: 5,
            unrealized_pnl: (mark - entry),
            unrealized_pnl_pct: pnl_pct,
            liquidation_price: entry / dec!(2),
            margin_used: entry / dec!(5),
            first_seen: Utc::now(),
            peak_pnl_pct: peak,
        }
    }

    fn short_position(entry: Decimal, mark: Decimal, pnl_pct: Decimal, peak: Decimal) -> PositionSnapshot {
        PositionSnapshot {
            side: PositionSide::Short,
            ..long_position(entry, mark, pnl_pct, peak)
        }
    }

    /// Market snapshot whose indicators fire no override: price above the
    /// moving average, positive momentum, neutral oscillator.
    fn quiet_market(price: Decimal, atr: Option<Decimal>) -> MarketSnapshot {
        MarketSnapshot {
            symbol: "BTCUSDT".to_string(),
            current_price: price,
            atr14: atr,
            ema20: price - dec!(1),
            macd: dec!(0.5),
            rsi7: dec!(50),
            mid_prices: Vec::new(),
        }
    }

    fn evaluator() -> ExitEvaluator {
        ExitEvaluator::new(ExitConfig::default())
    }

    #[test]
    fn long_atr_stop_permits_close() {
        // entry 100, ATR14 = 2 => stop at 96; mark 95.9 breaches it.
        let position = long_position(dec!(100), dec!(95.9), dec!(-4.1), dec!(0));
        let market = quiet_market(dec!(95.9), Some(dec!(2)));
        assert_eq!(
            evaluator().evaluate(&position, Some(&market)),
            ExitVerdict::Close(ExitTrigger::AtrStop)
        );
    }

    #[test]
    fn long_atr_target_permits_close() {
        // target = 100 + 2*2*1.5 = 106.
        let position = long_position(dec!(100), dec!(106.5), dec!(6.5), dec!(6.5));
        let market = quiet_market(dec!(106.5), Some(dec!(2)));
        assert_eq!(
            evaluator().evaluate(&position, Some(&market)),
            ExitVerdict::Close(ExitTrigger::AtrTarget)
        );
    }

    #[test]
    fn short_bands_mirror_long() {
        // Short from 100: stop 104, target 94.
        let stopped = short_position(dec!(100), dec!(104.2), dec!(-4.2), dec!(0));
        let market = MarketSnapshot {
            ema20: dec!(105),
            macd: dec!(-0.5),
            ..quiet_market(dec!(104.2), Some(dec!(2)))
        };
        assert_eq!(
            evaluator().evaluate(&stopped, Some(&market)),
            ExitVerdict::Close(ExitTrigger::AtrStop)
        );

        let target_hit = short_position(dec!(100), dec!(93.5), dec!(6.5), dec!(6.5));
        let market = MarketSnapshot {
            ema20: dec!(95),
            macd: dec!(-0.5),
            ..quiet_market(dec!(93.5), Some(dec!(2)))
        };
        assert_eq!(
            evaluator().evaluate(&target_hit, Some(&market)),
            ExitVerdict::Close(ExitTrigger::AtrTarget)
        );
    }

    #[test]
    fn missing_market_data_fails_open() {
        let position = long_position(dec!(100), dec!(100.1), dec!(0.1), dec!(0.1));
        assert_eq!(
            evaluator().evaluate(&position, None),
            ExitVerdict::Close(ExitTrigger::FailOpen)
        );
    }

    #[test]
    fn missing_atr_uses_fixed_bands() {
        let e = evaluator();
        let losing = long_position(dec!(100), dec!(97.5), dec!(-2.5), dec!(0));
        assert_eq!(
            e.evaluate(&losing, Some(&quiet_market(dec!(97.5), None))),
            ExitVerdict::Close(ExitTrigger::FallbackStop)
        );

        let winning = long_position(dec!(100), dec!(100.6), dec!(0.6), dec!(0.6));
        assert_eq!(
            e.evaluate(&winning, Some(&quiet_market(dec!(100.6), None))),
            ExitVerdict::Close(ExitTrigger::FallbackTarget)
        );

        let flat = long_position(dec!(100), dec!(100.1), dec!(0.1), dec!(0.1));
        assert_eq!(
            e.evaluate(&flat, Some(&quiet_market(dec!(100.1), None))),
            ExitVerdict::Close(ExitTrigger::FailOpen)
        );
    }

    #[test]
    fn full_profit_tier_permits_close() {
        // Wide ATR keeps both bands out of reach; 2.3% clears the top tier.
        let position = long_position(dec!(100), dec!(102.3), dec!(2.3), dec!(2.3));
        let market = quiet_market(dec!(102.3), Some(dec!(50)));
        assert_eq!(
            evaluator().evaluate(&position, Some(&market)),
            ExitVerdict::Close(ExitTrigger::ProfitTier)
        );
    }

    #[test]
    fn lower_profit_tiers_are_advisory_only() {
        // 1.2% clears two advisory tiers but not the full-exit tier, and
        // no retracement from peak.
        let position = long_position(dec!(100), dec!(101.2), dec!(1.2), dec!(1.2));
        let market = quiet_market(dec!(101.2), Some(dec!(50)));
        assert_eq!(evaluator().evaluate(&position, Some(&market)), ExitVerdict::Hold);
    }

    #[test]
    fn trend_reversal_permits_close_regardless_of_pnl() {
        let position = long_position(dec!(100), dec!(99.5), dec!(-0.5), dec!(0));
        let market = MarketSnapshot {
            ema20: dec!(100),
            macd: dec!(-0.3),
            ..quiet_market(dec!(99.5), Some(dec!(50)))
        };
        assert_eq!(
            evaluator().evaluate(&position, Some(&market)),
            ExitVerdict::Close(ExitTrigger::TrendReversal)
        );
    }

    #[test]
    fn rsi_extreme_requires_profit() {
        let market = MarketSnapshot {
            rsi7: dec!(85),
            ..quiet_market(dec!(100.2), Some(dec!(50)))
        };

        let profitable = long_position(dec!(100), dec!(100.2), dec!(0.2), dec!(0.2));
        assert_eq!(
            evaluator().evaluate(&profitable, Some(&market)),
            ExitVerdict::Close(ExitTrigger::MomentumExtreme)
        );

        // Overbought but under water: hold.
        let losing = long_position(dec!(100), dec!(99.9), dec!(-0.1), dec!(0));
        let market = MarketSnapshot {
            rsi7: dec!(85),
            ..quiet_market(dec!(99.9), Some(dec!(50)))
        };
        assert_eq!(evaluator().evaluate(&losing, Some(&market)), ExitVerdict::Hold);
    }

    #[test]
    fn trailing_stop_fires_on_deep_retracement() {
        // Peak 1.0%, now 0.65%: a 35% giveback past the 30% threshold.
        let position = long_position(dec!(100), dec!(100.65), dec!(0.65), dec!(1.0));
        let market = quiet_market(dec!(100.65), Some(dec!(50)));
        assert_eq!(
            evaluator().evaluate(&position, Some(&market)),
            ExitVerdict::Close(ExitTrigger::TrailingStop)
        );
    }

    #[test]
    fn trailing_stop_needs_activation_peak() {
        // Peak below the 0.2% activation threshold never arms the stop.
        let position = long_position(dec!(100), dec!(100.05), dec!(0.05), dec!(0.15));
        let market = quiet_market(dec!(100.05), Some(dec!(50)));
        assert_eq!(evaluator().evaluate(&position, Some(&market)), ExitVerdict::Hold);
    }

    #[test]
    fn shallow_retracement_holds() {
        // Peak 1.0%, now 0.8%: only a 20% giveback.
        let position = long_position(dec!(100), dec!(100.8), dec!(0.8), dec!(1.0));
        let market = quiet_market(dec!(100.8), Some(dec!(50)));
        assert_eq!(evaluator().evaluate(&position, Some(&market)), ExitVerdict::Hold);
    }
}
