//! Decision provider boundary.
//!
//! The reasoning provider is opaque to the engine: it receives the built
//! [`TradingContext`] and returns a rationale trace plus an ordered list
//! of decisions, or fails. Admission, sizing, and exit gating all happen
//! after this call; nothing a provider returns bypasses the risk layer.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{FullDecision, TradingContext};

#[async_trait]
pub trait DecisionProvider: Send + Sync {
    /// Human-readable provider name for logs and audit records.
    fn name(&self) -> &str;

    async fn decide(&self, context: &TradingContext) -> Result<FullDecision>;
}
