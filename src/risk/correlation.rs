//! Pairwise correlation risk analysis.
//!
//! Maintains a cached symbol x symbol Pearson correlation matrix over the
//! trailing mid-price windows and answers two questions: may a candidate
//! symbol be opened next to the current holdings, and does the standing
//! portfolio already contain highly correlated pairs.
//!
//! An unknown symbol pair reads as 0.0 rather than an error: no evidence
//! is never grounds to block a trade.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, MathematicalOps};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{BotError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Absolute pairwise correlation above this refuses a new open.
    pub max_correlation: Decimal,
    /// Trailing mid-price samples per symbol used for each coefficient.
    pub lookback: usize,
    /// Cache lifetime in minutes; the matrix is recomputed only when older.
    pub refresh_minutes: i64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            max_correlation: dec!(0.8),
            lookback: 25,
            refresh_minutes: 30,
        }
    }
}

impl CorrelationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_correlation <= Decimal::ZERO || self.max_correlation > Decimal::ONE {
            return Err(BotError::Config(format!(
                "max_correlation {} must be in (0, 1]",
                self.max_correlation
            )));
        }
        if self.lookback < 2 {
            return Err(BotError::Config("correlation lookback must be at least 2".to_string()));
        }
        if self.refresh_minutes <= 0 {
            return Err(BotError::Config("correlation refresh interval must be positive".to_string()));
        }
        Ok(())
    }
}

/// Symmetric Pearson matrix over an ordered symbol set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationMatrix {
    pub symbols: Vec<String>,
    pub matrix: Vec<Vec<Decimal>>,
    pub last_updated: DateTime<Utc>,
}

impl CorrelationMatrix {
    /// Coefficient for a symbol pair; unknown symbols read as 0.0.
    pub fn correlation(&self, a: &str, b: &str) -> Decimal {
        let ia = self.symbols.iter().position(|s| s == a);
        let ib = self.symbols.iter().position(|s| s == b);
        match (ia, ib) {
            (Some(i), Some(j)) => self.matrix[i][j],
            _ => Decimal::ZERO,
        }
    }
}

/// A pair of held or candidate symbols whose correlation exceeds a threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationPair {
    pub symbol_a: String,
    pub symbol_b: String,
    pub correlation: Decimal,
}

pub struct CorrelationAnalyzer {
    config: CorrelationConfig,
    cache: RwLock<Option<CorrelationMatrix>>,
}

impl CorrelationAnalyzer {
    pub fn new(config: CorrelationConfig) -> Self {
        Self {
            config,
            cache: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &CorrelationConfig {
        &self.config
    }

    /// Recompute the matrix if the cache is absent or stale.
    ///
    /// Symbols with fewer than `lookback` samples are excluded from this
    /// refresh's symbol set. Fewer than two usable symbols keeps the previous
    /// cache untouched so that queries fall through to "no evidence".
    pub async fn refresh(&self, series: &HashMap<String, Vec<Decimal>>) {
        {
            let cache = self.cache.read().await;
            if let Some(matrix) = cache.as_ref() {
                let age = Utc::now() - matrix.last_updated;
                if age < Duration::minutes(self.config.refresh_minutes) {
                    return;
                }
            }
        }

        let mut symbols: Vec<&String> = series
            .iter()
            .filter(|(_, prices)| prices.len() >= self.config.lookback)
            .map(|(symbol, _)| symbol)
            .collect();
        symbols.sort();

        if symbols.len() < 2 {
            warn!(usable = symbols.len(), "too few symbols with full history, keeping previous correlation matrix");
            return;
        }

        let windows: Vec<&[Decimal]> = symbols
            .iter()
            .map(|s| {
                let prices = &series[s.as_str()];
                &prices[prices.len() - self.config.lookback..]
            })
            .collect();

        let n = symbols.len();
        let mut matrix = vec![vec![Decimal::ZERO; n]; n];
        for i in 0..n {
            matrix[i][i] = Decimal::ONE;
            for j in (i + 1)..n {
                let coefficient = pearson(windows[i], windows[j]);
                matrix[i][j] = coefficient;
                matrix[j][i] = coefficient;
            }
        }

        debug!(symbols = n, "correlation matrix refreshed");
        let mut cache = self.cache.write().await;
        *cache = Some(CorrelationMatrix {
            symbols: symbols.into_iter().cloned().collect(),
            matrix,
            last_updated: Utc::now(),
        });
    }

    /// Pre-trade gate: refuse if the candidate correlates beyond the
    /// threshold with any held symbol. No holdings means always permitted.
    pub async fn check_correlation_risk(&self, held: &[String], candidate: &str) -> Result<()> {
        if held.is_empty() {
            return Ok(());
        }

        let cache = self.cache.read().await;
        let Some(matrix) = cache.as_ref() else {
            return Ok(());
        };

        for symbol in held {
            let coefficient = matrix.correlation(symbol, candidate);
            if coefficient.abs() > self.config.max_correlation {
                return Err(BotError::RiskLimit(format!(
                    "correlation between {} and {} is {:.3} (limit {})",
                    symbol, candidate, coefficient, self.config.max_correlation
                )));
            }
        }
        Ok(())
    }

    /// Standing-portfolio audit: every high-correlation pair where both
    /// symbols are currently held. Distinct from the pre-trade gate.
    pub async fn validate_portfolio_correlation(&self, held: &[String]) -> Vec<CorrelationPair> {
        if held.len() <= 1 {
            return Vec::new();
        }
        self.high_correlation_pairs(self.config.max_correlation)
            .await
            .into_iter()
            .filter(|pair| {
                held.iter().any(|s| *s == pair.symbol_a) && held.iter().any(|s| *s == pair.symbol_b)
            })
            .collect()
    }

    /// All symbol pairs in the cached matrix above the given threshold.
    pub async fn high_correlation_pairs(&self, threshold: Decimal) -> Vec<CorrelationPair> {
        let cache = self.cache.read().await;
        let Some(matrix) = cache.as_ref() else {
            return Vec::new();
        };

        let mut pairs = Vec::new();
        for i in 0..matrix.symbols.len() {
            for j in (i + 1)..matrix.symbols.len() {
                let coefficient = matrix.matrix[i][j];
                if coefficient.abs() > threshold {
                    pairs.push(CorrelationPair {
                        symbol_a: matrix.symbols[i].clone(),
                        symbol_b: matrix.symbols[j].clone(),
                        correlation: coefficient,
                    });
                }
            }
        }
        pairs
    }

    /// Read-only snapshot of the cached matrix, if one exists.
    pub async fn matrix(&self) -> Option<CorrelationMatrix> {
        self.cache.read().await.clone()
    }
}

/// Pearson coefficient over two equal-length windows. Degenerate inputs
/// (mismatched length, zero variance) read as 0.0.
fn pearson(x: &[Decimal], y: &[Decimal]) -> Decimal {
    if x.len() != y.len() || x.is_empty() {
        return Decimal::ZERO;
    }

    let n = Decimal::from(x.len() as u64);
    let mean_x: Decimal = x.iter().sum::<Decimal>() / n;
    let mean_y: Decimal = y.iter().sum::<Decimal>() / n;

    let mut covariance = Decimal::ZERO;
    let mut variance_x = Decimal::ZERO;
    let mut variance_y = Decimal::ZERO;

    for (a, b) in x.iter().zip(y.iter()) {
        let dx = *a - mean_x;
        let dy = *b - mean_y;
        covariance += dx * dy;
        variance_x += dx * dx;
        variance_y += dy * dy;
    }

    if variance_x == Decimal::ZERO || variance_y == Decimal::ZERO {
        return Decimal::ZERO;
    }

    match (variance_x * variance_y).sqrt() {
        Some(denominator) if denominator > Decimal::ZERO => covariance / denominator,
        _ => Decimal::ZERO,
    }
}
