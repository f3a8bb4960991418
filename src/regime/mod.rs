//! Market regime classification.
//!
//! Turns a mid-price sequence into a discrete market-state label with a
//! confidence score and per-strategy weight hints:
//! - **TrendingBull / TrendingBear**: strong directional OLS slope
//! - **Sideways**: negligible slope, normal volatility
//! - **HighVolatility / LowVolatility**: annualized volatility outside the
//!   normal band (checked before any trend signal)
//! - **Uncertain**: insufficient history or no clear signal
//!
//! Stateless beyond its inputs: every call recomputes from scratch.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, MathematicalOps};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Discrete market-state label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketRegime {
    TrendingBull,
    TrendingBear,
    Sideways,
    HighVolatility,
    LowVolatility,
    Uncertain,
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MarketRegime::TrendingBull => "TrendingBull",
            MarketRegime::TrendingBear => "TrendingBear",
            MarketRegime::Sideways => "Sideways",
            MarketRegime::HighVolatility => "HighVolatility",
            MarketRegime::LowVolatility => "LowVolatility",
            MarketRegime::Uncertain => "Uncertain",
        };
        write!(f, "{}", s)
    }
}

/// Per-strategy weight hints for the classified regime.
///
/// Each regime's row sums to at most 1 by construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrategyWeights {
    pub trend_following: Decimal,
    pub mean_reversion: Decimal,
    pub breakout: Decimal,
    pub conservative: Decimal,
}

impl StrategyWeights {
    pub fn total(&self) -> Decimal {
        self.trend_following + self.mean_reversion + self.breakout + self.conservative
    }
}

/// Classifier thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    /// Minimum number of price points; fewer yields Uncertain immediately.
    pub trend_window: usize,
    /// Annualized volatility above this is HighVolatility.
    pub high_volatility: Decimal,
    /// Annualized volatility below this is LowVolatility.
    pub low_volatility: Decimal,
    /// Normalized slope magnitude above this is a strong trend.
    pub strong_trend: Decimal,
    /// Normalized slope magnitude below this is Sideways.
    pub weak_trend: Decimal,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            trend_window: 20,
            high_volatility: dec!(0.8),
            low_volatility: dec!(0.2),
            strong_trend: dec!(0.05),
            weak_trend: dec!(0.01),
        }
    }
}

/// Classification result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeAnalysis {
    pub regime: MarketRegime,
    /// Annualized volatility of simple returns.
    pub volatility: Decimal,
    /// Normalized OLS slope magnitude.
    pub trend_strength: Decimal,
    /// 1 rising, -1 falling, 0 flat.
    pub trend_direction: i8,
    /// Confidence in [0, 1].
    pub confidence: Decimal,
    pub last_updated: DateTime<Utc>,
    pub weights: StrategyWeights,
}

/// Market regime classifier.
pub struct RegimeClassifier {
    config: RegimeConfig,
}

impl RegimeClassifier {
    pub fn new(config: RegimeConfig) -> Self {
        Self { config }
    }

    /// Classify a price sequence, oldest first.
    pub fn classify(&self, prices: &[Decimal]) -> RegimeAnalysis {
        if prices.len() < self.config.trend_window {
            return RegimeAnalysis {
                regime: MarketRegime::Uncertain,
                volatility: Decimal::ZERO,
                trend_strength: Decimal::ZERO,
                trend_direction: 0,
                confidence: Decimal::ZERO,
                last_updated: Utc::now(),
                weights: weights_for(MarketRegime::Uncertain),
            };
        }

        let volatility = self.annualized_volatility(prices);
        let (trend_strength, trend_direction) = self.trend_strength(prices);
        let regime = self.classify_regime(volatility, trend_strength, trend_direction);
        let confidence = self.confidence(volatility, trend_strength);

        RegimeAnalysis {
            regime,
            volatility,
            trend_strength,
            trend_direction,
            confidence,
            last_updated: Utc::now(),
            weights: weights_for(regime),
        }
    }

    /// Standard deviation of simple returns, annualized for the 3-minute
    /// sampling cadence of the intraday series (sqrt of the number of
    /// 3-minute periods in a year).
    fn annualized_volatility(&self, prices: &[Decimal]) -> Decimal {
        let mut returns = Vec::with_capacity(prices.len().saturating_sub(1));
        for pair in prices.windows(2) {
            if pair[0] > Decimal::ZERO {
                returns.push((pair[1] - pair[0]) / pair[0]);
            }
        }
        if returns.len() < 2 {
            return Decimal::ZERO;
        }

        let n = Decimal::from(returns.len() as u64);
        let mean: Decimal = returns.iter().sum::<Decimal>() / n;
        let variance: Decimal = returns
            .iter()
            .map(|r| {
                let d = *r - mean;
                d * d
            })
            .sum::<Decimal>()
            / n;

        let periods_per_year = Decimal::from(365u32 * 24 * 60 / 3);
        variance.sqrt().unwrap_or(Decimal::ZERO)
            * periods_per_year.sqrt().unwrap_or(Decimal::ZERO)
    }

    /// Ordinary least squares slope of price against index, normalized by
    /// the mean price. Returns (strength, direction).
    fn trend_strength(&self, prices: &[Decimal]) -> (Decimal, i8) {
        if prices.len() < 2 {
            return (Decimal::ZERO, 0);
        }
        let n = Decimal::from(prices.len() as u64);

        let mut sum_x = Decimal::ZERO;
        let mut sum_y = Decimal::ZERO;
        let mut sum_xy = Decimal::ZERO;
        let mut sum_x2 = Decimal::ZERO;

        for (i, price) in prices.iter().enumerate() {
            let x = Decimal::from(i as u64);
            sum_x += x;
            sum_y += *price;
            sum_xy += x * *price;
            sum_x2 += x * x;
        }

        let denominator = n * sum_x2 - sum_x * sum_x;
        if denominator == Decimal::ZERO {
            return (Decimal::ZERO, 0);
        }
        let slope = (n * sum_xy - sum_x * sum_y) / denominator;

        let avg_price = sum_y / n;
        if avg_price == Decimal::ZERO {
            return (Decimal::ZERO, 0);
        }
        let normalized = slope / avg_price;

        let direction = if slope > Decimal::ZERO {
            1
        } else if slope < Decimal::ZERO {
            -1
        } else {
            0
        };

        (normalized.abs(), direction)
    }

    /// First match wins: volatility extremes dominate trend signals.
    fn classify_regime(
        &self,
        volatility: Decimal,
        trend_strength: Decimal,
        trend_direction: i8,
    ) -> MarketRegime {
        if volatility > self.config.high_volatility {
            return MarketRegime::HighVolatility;
        }
        if volatility < self.config.low_volatility {
            return MarketRegime::LowVolatility;
        }
        if trend_strength > self.config.strong_trend {
            match trend_direction {
                d if d > 0 => return MarketRegime::TrendingBull,
                d if d < 0 => return MarketRegime::TrendingBear,
                _ => {}
            }
        }
        if trend_strength < self.config.weak_trend {
            return MarketRegime::Sideways;
        }
        MarketRegime::Uncertain
    }

    /// Average of a volatility confidence (0.9 outside the normal band,
    /// else 0.6) and a trend confidence (strength x 10, capped at 1).
    fn confidence(&self, volatility: Decimal, trend_strength: Decimal) -> Decimal {
        let vol_confidence =
            if volatility > self.config.high_volatility || volatility < self.config.low_volatility {
                dec!(0.9)
            } else {
                dec!(0.6)
            };
        let trend_confidence = (trend_strength * dec!(10)).min(Decimal::ONE);
        (vol_confidence + trend_confidence) / dec!(2)
    }
}

/// Fixed weight table keyed by regime.
fn weights_for(regime: MarketRegime) -> StrategyWeights {
    match regime {
        MarketRegime::TrendingBull | MarketRegime::TrendingBear => StrategyWeights {
            trend_following: dec!(0.6),
            mean_reversion: dec!(0.1),
            breakout: dec!(0.2),
            conservative: dec!(0.1),
        },
        MarketRegime::Sideways => StrategyWeights {
            trend_following: dec!(0.1),
            mean_reversion: dec!(0.6),
            breakout: dec!(0.2),
            conservative: dec!(0.1),
        },
        MarketRegime::HighVolatility => StrategyWeights {
            trend_following: dec!(0.2),
            mean_reversion: dec!(0.1),
            breakout: dec!(0.3),
            conservative: dec!(0.4),
        },
        MarketRegime::LowVolatility => StrategyWeights {
            trend_following: dec!(0.3),
            mean_reversion: dec!(0.4),
            breakout: dec!(0.2),
            conservative: dec!(0.1),
        },
        MarketRegime::Uncertain => StrategyWeights {
            trend_following: dec!(0.2),
            mean_reversion: dec!(0.2),
            breakout: dec!(0.1),
            conservative: dec!(0.5),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_prices(n: usize) -> Vec<Decimal> {
        vec![dec!(100); n]
    }

    /// Alternating +/- swings of the given percent, centered on 100.
    fn choppy_prices(n: usize, swing_pct: Decimal) -> Vec<Decimal> {
        let mut prices = Vec::with_capacity(n);
        for i in 0..n {
            let offset = dec!(100) * swing_pct / dec!(100);
            if i % 2 == 0 {
                prices.push(dec!(100) + offset);
            } else {
                prices.push(dec!(100) - offset);
            }
        }
        prices
    }

    /// Linear ramp from `start` with the given per-step increment.
    fn ramp_prices(n: usize, start: Decimal, step: Decimal) -> Vec<Decimal> {
        (0..n)
            .map(|i| start + step * Decimal::from(i as u64))
            .collect()
    }

    #[test]
    fn short_history_is_uncertain_with_zero_confidence() {
        let classifier = RegimeClassifier::new(RegimeConfig::default());
        let analysis = classifier.classify(&flat_prices(10));
        assert_eq!(analysis.regime, MarketRegime::Uncertain);
        assert_eq!(analysis.confidence, Decimal::ZERO);
        assert_eq!(analysis.volatility, Decimal::ZERO);
    }

    #[test]
    fn high_volatility_overrides_trend() {
        // Wide thresholds so only the volatility branch can fire.
        let config = RegimeConfig {
            high_volatility: dec!(0.8),
            low_volatility: dec!(0.0001),
            strong_trend: dec!(0.000001),
            ..Default::default()
        };
        let classifier = RegimeClassifier::new(config);
        // 5% swings every 3 minutes annualize far beyond 0.8.
        let analysis = classifier.classify(&choppy_prices(30, dec!(5)));
        assert_eq!(analysis.regime, MarketRegime::HighVolatility);
        assert!(analysis.volatility > dec!(0.8));
    }

    #[test]
    fn low_volatility_detected_on_flat_series() {
        let classifier = RegimeClassifier::new(RegimeConfig::default());
        let analysis = classifier.classify(&flat_prices(30));
        assert_eq!(analysis.regime, MarketRegime::LowVolatility);
        assert_eq!(analysis.trend_direction, 0);
    }

    #[test]
    fn strong_upward_slope_is_trending_bull() {
        // Neutralize the volatility branches to isolate the trend branch.
        let config = RegimeConfig {
            high_volatility: dec!(1000),
            low_volatility: dec!(0),
            strong_trend: dec!(0.05),
            ..Default::default()
        };
        let classifier = RegimeClassifier::new(config);
        let analysis = classifier.classify(&ramp_prices(20, dec!(50), dec!(10)));
        assert_eq!(analysis.regime, MarketRegime::TrendingBull);
        assert_eq!(analysis.trend_direction, 1);
        assert!(analysis.trend_strength > dec!(0.05));
    }

    #[test]
    fn strong_downward_slope_is_trending_bear() {
        let config = RegimeConfig {
            high_volatility: dec!(1000),
            low_volatility: dec!(0),
            strong_trend: dec!(0.05),
            ..Default::default()
        };
        let classifier = RegimeClassifier::new(config);
        let analysis = classifier.classify(&ramp_prices(20, dec!(250), dec!(-10)));
        assert_eq!(analysis.regime, MarketRegime::TrendingBear);
        assert_eq!(analysis.trend_direction, -1);
    }

    #[test]
    fn weak_slope_is_sideways() {
        let config = RegimeConfig {
            high_volatility: dec!(1000),
            low_volatility: dec!(0),
            weak_trend: dec!(0.01),
            ..Default::default()
        };
        let classifier = RegimeClassifier::new(config);
        let analysis = classifier.classify(&choppy_prices(30, dec!(0.1)));
        assert_eq!(analysis.regime, MarketRegime::Sideways);
    }

    #[test]
    fn confidence_stays_in_unit_interval() {
        let classifier = RegimeClassifier::new(RegimeConfig::default());
        for prices in [
            flat_prices(30),
            choppy_prices(30, dec!(5)),
            ramp_prices(30, dec!(100), dec!(1)),
        ] {
            let analysis = classifier.classify(&prices);
            assert!(analysis.confidence >= Decimal::ZERO);
            assert!(analysis.confidence <= Decimal::ONE);
        }
    }

    #[test]
    fn weight_rows_sum_to_at_most_one() {
        for regime in [
            MarketRegime::TrendingBull,
            MarketRegime::TrendingBear,
            MarketRegime::Sideways,
            MarketRegime::HighVolatility,
            MarketRegime::LowVolatility,
            MarketRegime::Uncertain,
        ] {
            assert!(weights_for(regime).total() <= Decimal::ONE);
        }
    }

    #[test]
    fn trending_regimes_favor_trend_following() {
        let weights = weights_for(MarketRegime::TrendingBull);
        assert!(weights.trend_following > weights.mean_reversion);
        let sideways = weights_for(MarketRegime::Sideways);
        assert!(sideways.mean_reversion > sideways.trend_following);
        let high_vol = weights_for(MarketRegime::HighVolatility);
        assert!(high_vol.conservative >= high_vol.trend_following);
    }
}
