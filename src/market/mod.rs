//! Market data boundary.
//!
//! Supplies per-symbol live snapshots (price, indicators, intraday
//! series) and two independent candidate rankings that the engine merges
//! into its context. A feed failure for one symbol never aborts a cycle;
//! callers treat missing snapshots as degraded data.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{CandidateSymbol, MarketSnapshot};

#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot>;

    /// Symbols ranked by short-term price momentum.
    async fn momentum_rankings(&self, limit: usize) -> Result<Vec<CandidateSymbol>>;

    /// Symbols ranked by open-interest growth.
    async fn open_interest_rankings(&self, limit: usize) -> Result<Vec<CandidateSymbol>>;
}
