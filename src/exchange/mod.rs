//! Exchange adapter boundary.
//!
//! The engine and risk components depend only on the [`Trader`] trait;
//! venue-specific adapters (order signing, wire protocols) implement it
//! behind their own timeouts. Results are typed here, at the boundary,
//! so field validation never leaks into business logic.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{BotError, Result};
use crate::types::{PositionSide, PositionSnapshot};

/// Account-level balance figures reported by the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub wallet_balance: Decimal,
    pub unrealized_pnl: Decimal,
    pub available_balance: Decimal,
}

impl AccountBalance {
    pub fn equity(&self) -> Decimal {
        self.wallet_balance + self.unrealized_pnl
    }

    /// Reject figures a venue should never report.
    pub fn validate(&self) -> Result<()> {
        if self.wallet_balance < Decimal::ZERO || self.available_balance < Decimal::ZERO {
            return Err(BotError::Exchange(format!(
                "negative balance reported: wallet {} available {}",
                self.wallet_balance, self.available_balance
            )));
        }
        Ok(())
    }
}

/// An open position as reported by the venue, before the engine attaches
/// its own lifecycle tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub quantity: Decimal,
    pub leverage: u32,
    pub unrealized_pnl: Decimal,
    pub notional: Decimal,
    pub liquidation_price: Decimal,
    pub margin_used: Decimal,
}

impl ExchangePosition {
    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            return Err(BotError::Exchange("position with empty symbol".to_string()));
        }
        if self.quantity <= Decimal::ZERO || self.entry_price <= Decimal::ZERO {
            return Err(BotError::Exchange(format!(
                "{}: non-positive quantity {} or entry price {}",
                self.symbol, self.quantity, self.entry_price
            )));
        }
        Ok(())
    }

    pub fn unrealized_pnl_pct(&self) -> Decimal {
        if self.notional == Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.unrealized_pnl / self.notional * Decimal::ONE_HUNDRED
    }

    /// Lift into the engine's lifecycle-tracked snapshot.
    pub fn into_snapshot(self, first_seen: chrono::DateTime<chrono::Utc>, peak_pnl_pct: Decimal) -> PositionSnapshot {
        let unrealized_pnl_pct = self.unrealized_pnl_pct();
        PositionSnapshot {
            symbol: self.symbol,
            side: self.side,
            entry_price: self.entry_price,
            mark_price: self.mark_price,
            quantity: self.quantity,
            leverage: self.leverage,
            unrealized_pnl: self.unrealized_pnl,
            unrealized_pnl_pct,
            liquidation_price: self.liquidation_price,
            margin_used: self.margin_used,
            first_seen,
            peak_pnl_pct,
        }
    }
}

/// Acknowledgement for a submitted order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
}

/// Venue capability interface. All calls may fail; nothing here retries.
#[async_trait]
pub trait Trader: Send + Sync {
    async fn get_balance(&self) -> Result<AccountBalance>;

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>>;

    async fn open_long(&self, symbol: &str, quantity: Decimal, leverage: u32) -> Result<OrderAck>;

    async fn open_short(&self, symbol: &str, quantity: Decimal, leverage: u32) -> Result<OrderAck>;

    async fn close_long(&self, symbol: &str, quantity: Decimal) -> Result<()>;

    async fn close_short(&self, symbol: &str, quantity: Decimal) -> Result<()>;

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<()>;

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<()>;
}
