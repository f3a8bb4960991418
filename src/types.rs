//! Core domain types shared across the engine and its collaborators.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::regime::RegimeAnalysis;

/// Direction of a perpetual futures position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

/// Action requested by the decision provider for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeAction {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    Hold,
    Wait,
}

impl TradeAction {
    /// Execution priority: closes run before opens so a close+reopen pair
    /// on the same symbol never produces a momentary double-sized position.
    pub fn priority(&self) -> u8 {
        match self {
            TradeAction::CloseLong | TradeAction::CloseShort => 1,
            TradeAction::OpenLong | TradeAction::OpenShort => 2,
            TradeAction::Hold | TradeAction::Wait => 3,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, TradeAction::OpenLong | TradeAction::OpenShort)
    }

    pub fn is_close(&self) -> bool {
        matches!(self, TradeAction::CloseLong | TradeAction::CloseShort)
    }

    /// Side the action operates on, if any.
    pub fn side(&self) -> Option<PositionSide> {
        match self {
            TradeAction::OpenLong | TradeAction::CloseLong => Some(PositionSide::Long),
            TradeAction::OpenShort | TradeAction::CloseShort => Some(PositionSide::Short),
            TradeAction::Hold | TradeAction::Wait => None,
        }
    }
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TradeAction::OpenLong => "open_long",
            TradeAction::OpenShort => "open_short",
            TradeAction::CloseLong => "close_long",
            TradeAction::CloseShort => "close_short",
            TradeAction::Hold => "hold",
            TradeAction::Wait => "wait",
        };
        write!(f, "{}", s)
    }
}

/// A single trading decision returned by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub symbol: String,
    pub action: TradeAction,
    /// Requested leverage for opens.
    #[serde(default)]
    pub leverage: u32,
    /// Requested notional in quote currency for opens.
    #[serde(default)]
    pub position_size_usd: Decimal,
    #[serde(default)]
    pub stop_loss: Decimal,
    #[serde(default)]
    pub take_profit: Decimal,
    /// Provider confidence score, 0-100.
    #[serde(default)]
    pub confidence: u8,
    pub reasoning: String,
}

/// Full provider output: the rationale trace plus the ordered decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullDecision {
    /// Prompt the provider was given, kept for the audit trail.
    pub prompt: String,
    /// Free-text reasoning trace, persisted even when decisions are unusable.
    pub rationale: String,
    pub decisions: Vec<Decision>,
    pub timestamp: DateTime<Utc>,
}

/// Account-level snapshot derived from the exchange balance and positions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountSummary {
    pub total_equity: Decimal,
    pub available_balance: Decimal,
    pub total_pnl: Decimal,
    pub total_pnl_pct: Decimal,
    pub margin_used: Decimal,
    pub margin_used_pct: Decimal,
    pub position_count: usize,
}

/// Per-position snapshot with engine-tracked lifecycle fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub quantity: Decimal,
    pub leverage: u32,
    pub unrealized_pnl: Decimal,
    pub unrealized_pnl_pct: Decimal,
    pub liquidation_price: Decimal,
    pub margin_used: Decimal,
    /// First cycle this symbol+side pair was observed open.
    pub first_seen: DateTime<Utc>,
    /// Highest positive unrealized P&L percent reached since opening.
    /// Non-decreasing while positive.
    pub peak_pnl_pct: Decimal,
}

impl PositionSnapshot {
    /// Key identifying a position slot across cycles.
    pub fn key(&self) -> String {
        position_key(&self.symbol, self.side)
    }
}

/// Stable symbol+side key used for peak/first-seen tracking.
pub fn position_key(symbol: &str, side: PositionSide) -> String {
    format!("{}_{}", symbol, side)
}

/// Which ranking source nominated a candidate symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingSource {
    Momentum,
    OpenInterest,
}

/// A candidate symbol from the merged pool, with provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSymbol {
    pub symbol: String,
    pub sources: Vec<RankingSource>,
}

/// Point-in-time market view for one symbol.
///
/// Indicator fields are optional where the upstream feed may not have
/// enough history; consumers fall back explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub current_price: Decimal,
    /// 14-period average true range; absent on thin history.
    pub atr14: Option<Decimal>,
    pub ema20: Decimal,
    pub macd: Decimal,
    pub rsi7: Decimal,
    /// Intraday mid-price series, oldest first.
    pub mid_prices: Vec<Decimal>,
}

/// Bounded own-performance statistics over recent cycles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub cycles_analyzed: usize,
    pub failed_cycles: usize,
    pub executed_opens: usize,
    pub executed_closes: usize,
    pub refused_opens: usize,
    pub failed_actions: usize,
}

/// Everything the decision provider sees for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingContext {
    pub timestamp: DateTime<Utc>,
    pub cycle_number: u64,
    pub uptime_minutes: i64,
    pub account: AccountSummary,
    pub positions: Vec<PositionSnapshot>,
    pub candidates: Vec<CandidateSymbol>,
    pub performance: Option<PerformanceSummary>,
    /// Regime read on the cycle's lead symbol; absent when no market data
    /// was available.
    pub regime: Option<RegimeAnalysis>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_actions_outrank_opens_and_holds() {
        assert!(TradeAction::CloseShort.priority() < TradeAction::OpenLong.priority());
        assert!(TradeAction::OpenShort.priority() < TradeAction::Hold.priority());
        assert_eq!(TradeAction::Hold.priority(), TradeAction::Wait.priority());
    }

    #[test]
    fn action_side_mapping() {
        assert_eq!(TradeAction::OpenLong.side(), Some(PositionSide::Long));
        assert_eq!(TradeAction::CloseShort.side(), Some(PositionSide::Short));
        assert_eq!(TradeAction::Wait.side(), None);
    }

    #[test]
    fn action_serde_uses_snake_case() {
        let json = serde_json::to_string(&TradeAction::OpenLong).unwrap();
        assert_eq!(json, "\"open_long\"");
        let back: TradeAction = serde_json::from_str("\"close_short\"").unwrap();
        assert_eq!(back, TradeAction::CloseShort);
    }

    #[test]
    fn position_key_is_symbol_and_side() {
        assert_eq!(position_key("BTCUSDT", PositionSide::Long), "BTCUSDT_long");
        assert_eq!(position_key("ETHUSDT", PositionSide::Short), "ETHUSDT_short");
    }
}
