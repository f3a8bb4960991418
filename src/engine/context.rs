//! Per-cycle context assembly.
//!
//! Builds the [`TradingContext`] handed to the decision provider: account
//! summary, lifecycle-tracked position snapshots, the merged candidate
//! pool from two independent ranking sources, and recent own-performance
//! statistics. Also owns the symbol+side tracking map behind first-seen
//! timestamps and peak favorable excursion.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::Result;
use crate::exchange::Trader;
use crate::market::MarketFeed;
use crate::storage::StateStore;
use crate::types::{
    position_key, AccountSummary, CandidateSymbol, PositionSide, PositionSnapshot, TradingContext,
};

#[derive(Debug, Clone, Copy)]
struct PositionTracking {
    first_seen: DateTime<Utc>,
    peak_pnl_pct: Decimal,
}

pub struct ContextBuilder {
    initial_balance: Decimal,
    pool_limit: usize,
    performance_lookback: usize,
    tracking: RwLock<HashMap<String, PositionTracking>>,
}

impl ContextBuilder {
    pub fn new(initial_balance: Decimal, pool_limit: usize, performance_lookback: usize) -> Self {
        Self {
            initial_balance,
            pool_limit,
            performance_lookback,
            tracking: RwLock::new(HashMap::new()),
        }
    }

    /// Seed tracking for a position opened this cycle, so its peak starts
    /// from zero rather than from whatever the first later observation is.
    pub async fn track_new_position(&self, symbol: &str, side: PositionSide) {
        let mut tracking = self.tracking.write().await;
        tracking.insert(
            position_key(symbol, side),
            PositionTracking {
                first_seen: Utc::now(),
                peak_pnl_pct: Decimal::ZERO,
            },
        );
    }

    /// Assemble the context for one cycle. Failure here aborts the cycle;
    /// the provider is never called on partial account data.
    pub async fn build(
        &self,
        cycle_number: u64,
        started_at: DateTime<Utc>,
        trader: &dyn Trader,
        feed: &dyn MarketFeed,
        store: &dyn StateStore,
    ) -> Result<TradingContext> {
        let now = Utc::now();

        let balance = trader.get_balance().await?;
        balance.validate()?;
        let equity = balance.equity();

        let raw_positions = trader.get_positions().await?;
        let positions = self.snapshot_positions(raw_positions, now).await;

        let margin_used: Decimal = positions.iter().map(|p| p.margin_used).sum();
        let total_pnl = equity - self.initial_balance;
        let total_pnl_pct = if self.initial_balance > Decimal::ZERO {
            total_pnl / self.initial_balance * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };
        let margin_used_pct = if equity > Decimal::ZERO {
            margin_used / equity * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };

        let account = AccountSummary {
            total_equity: equity,
            available_balance: balance.available_balance,
            total_pnl,
            total_pnl_pct,
            margin_used,
            margin_used_pct,
            position_count: positions.len(),
        };

        let candidates = self.merged_candidates(feed).await?;

        // Performance statistics are advisory; their absence degrades the
        // prompt, not the cycle.
        let performance = match store.load_performance(self.performance_lookback).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(error = %e, "failed to load performance statistics");
                None
            }
        };

        Ok(TradingContext {
            timestamp: now,
            cycle_number,
            uptime_minutes: (now - started_at).num_minutes(),
            account,
            positions,
            candidates,
            performance,
            // Filled in by the engine once market data is fetched.
            regime: None,
        })
    }

    /// Convert exchange positions into tracked snapshots: attach
    /// first-seen timestamps, advance the peak favorable excursion, and
    /// drop tracking for positions no longer live.
    async fn snapshot_positions(
        &self,
        raw: Vec<crate::exchange::ExchangePosition>,
        now: DateTime<Utc>,
    ) -> Vec<PositionSnapshot> {
        let mut tracking = self.tracking.write().await;
        let mut live_keys: Vec<String> = Vec::with_capacity(raw.len());
        let mut snapshots = Vec::with_capacity(raw.len());

        for position in raw {
            if let Err(e) = position.validate() {
                warn!(error = %e, "skipping malformed exchange position");
                continue;
            }
            let key = position_key(&position.symbol, position.side);
            let pnl_pct = position.unrealized_pnl_pct();

            let entry = tracking.entry(key.clone()).or_insert(PositionTracking {
                first_seen: now,
                peak_pnl_pct: pnl_pct,
            });
            // The peak only ever advances, and only while in profit.
            if pnl_pct > Decimal::ZERO && pnl_pct > entry.peak_pnl_pct {
                entry.peak_pnl_pct = pnl_pct;
            }

            snapshots.push(position.into_snapshot(entry.first_seen, entry.peak_pnl_pct));
            live_keys.push(key);
        }

        tracking.retain(|key, _| live_keys.contains(key));
        snapshots
    }

    /// Merge the two ranking sources into one deduplicated pool,
    /// momentum order first, recording every source that nominated a
    /// symbol.
    async fn merged_candidates(&self, feed: &dyn MarketFeed) -> Result<Vec<CandidateSymbol>> {
        let momentum = feed.momentum_rankings(self.pool_limit).await?;
        let open_interest = feed.open_interest_rankings(self.pool_limit).await?;

        let mut merged: Vec<CandidateSymbol> = Vec::with_capacity(momentum.len() + open_interest.len());
        for candidate in momentum.into_iter().chain(open_interest) {
            match merged.iter_mut().find(|c| c.symbol == candidate.symbol) {
                Some(existing) => {
                    for source in candidate.sources {
                        if !existing.sources.contains(&source) {
                            existing.sources.push(source);
                        }
                    }
                }
                None => merged.push(candidate),
            }
        }
        Ok(merged)
    }
}
