//! Trading cycle orchestration.
//!
//! [`TradingEngine`] owns the periodic loop: build context from the
//! exchange and market feed, ask the decision provider, sort the returned
//! decisions so closes run before opens, push every open through the
//! admission/correlation/sizing gates and every close through the exit
//! evaluator, execute what survives, and persist an audit record either
//! way. One decision's failure never aborts the cycle; only a failed
//! context build or provider call does, and the next scheduled tick is
//! the retry.

mod context;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::{BotConfig, RiskLimits};
use crate::error::{BotError, Result};
use crate::exchange::Trader;
use crate::market::MarketFeed;
use crate::provider::DecisionProvider;
use crate::regime::{RegimeAnalysis, RegimeClassifier};
use crate::risk::admission::{AdmissionController, AdmissionMetrics};
use crate::risk::correlation::CorrelationAnalyzer;
use crate::risk::exit::{ExitEvaluator, ExitVerdict};
use crate::risk::sizing::{volatility_ratio, PositionSizer};
use crate::storage::{ActionOutcome, CycleRecord, DecisionRecord, StateStore};
use crate::types::{Decision, MarketSnapshot, TradeAction, TradingContext};

pub use context::ContextBuilder;

/// Read-only run-state snapshot for monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub running: bool,
    pub cycle_count: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_minutes: i64,
    pub suspended_until: Option<DateTime<Utc>>,
    pub initial_balance: Decimal,
}

pub struct TradingEngine {
    config: BotConfig,
    trader: Arc<dyn Trader>,
    provider: Arc<dyn DecisionProvider>,
    feed: Arc<dyn MarketFeed>,
    store: Arc<dyn StateStore>,
    admission: AdmissionController,
    sizer: PositionSizer,
    correlation: CorrelationAnalyzer,
    exits: ExitEvaluator,
    regime: RegimeClassifier,
    context_builder: ContextBuilder,
    running: AtomicBool,
    cycle_count: AtomicU64,
    started_at: DateTime<Utc>,
    /// Absolute end of a risk-control cool-down; cycles inside it are
    /// skipped without calling the provider.
    suspended_until: RwLock<Option<DateTime<Utc>>>,
    last_daily_rollover: RwLock<DateTime<Utc>>,
    daily_realized_pnl: RwLock<Decimal>,
}

impl TradingEngine {
    pub fn new(
        config: BotConfig,
        trader: Arc<dyn Trader>,
        provider: Arc<dyn DecisionProvider>,
        feed: Arc<dyn MarketFeed>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        config.validate()?;
        if config.engine.initial_balance <= Decimal::ZERO {
            return Err(BotError::Config(format!(
                "initial balance {} must be positive",
                config.engine.initial_balance
            )));
        }

        let context_builder = ContextBuilder::new(
            config.engine.initial_balance,
            config.engine.momentum_pool_limit,
            config.engine.performance_lookback,
        );

        Ok(Self {
            admission: AdmissionController::new(config.limits.clone()),
            sizer: PositionSizer::new(config.sizing.clone()),
            correlation: CorrelationAnalyzer::new(config.correlation.clone()),
            exits: ExitEvaluator::new(config.exit.clone()),
            regime: RegimeClassifier::new(config.regime.clone()),
            context_builder,
            config,
            trader,
            provider,
            feed,
            store,
            running: AtomicBool::new(false),
            cycle_count: AtomicU64::new(0),
            started_at: Utc::now(),
            suspended_until: RwLock::new(None),
            last_daily_rollover: RwLock::new(Utc::now()),
            daily_realized_pnl: RwLock::new(Decimal::ZERO),
        })
    }

    /// Restore persisted admission state before the first cycle.
    /// Configured limits are never overwritten by the snapshot.
    pub async fn init(&self) -> Result<()> {
        match self.store.load_admission_state().await {
            Ok(Some(snapshot)) => self.admission.restore(snapshot).await,
            Ok(None) => info!("no persisted admission state, starting fresh"),
            Err(e) => warn!(error = %e, "failed to load admission state, starting fresh"),
        }
        Ok(())
    }

    /// Run until [`stop`](Self::stop): one cycle immediately, then one per
    /// scan interval. Cycles never overlap; a long cycle delays the next
    /// tick rather than stacking a second invocation.
    pub async fn run(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!(
            interval_secs = self.config.engine.scan_interval_secs,
            initial_balance = %self.config.engine.initial_balance,
            provider = self.provider.name(),
            "trading engine started"
        );

        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.engine.scan_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = self.run_cycle().await {
                error!(error = %e, "trading cycle failed");
            }
        }

        info!("trading engine stopped");
        Ok(())
    }

    /// Cooperative stop, observed at the top of the next tick; an
    /// in-flight cycle runs to completion.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Suspend trading until the given instant; cycles inside the window
    /// are recorded as skipped without calling the provider.
    pub async fn suspend_until(&self, until: DateTime<Utc>) {
        warn!(%until, "trading suspended");
        *self.suspended_until.write().await = Some(until);
    }

    pub async fn status(&self) -> EngineStatus {
        EngineStatus {
            running: self.is_running(),
            cycle_count: self.cycle_count.load(Ordering::SeqCst),
            started_at: self.started_at,
            uptime_minutes: (Utc::now() - self.started_at).num_minutes(),
            suspended_until: *self.suspended_until.read().await,
            initial_balance: self.config.engine.initial_balance,
        }
    }

    pub async fn admission_metrics(&self) -> AdmissionMetrics {
        self.admission.metrics().await
    }

    /// Replace admission limits atomically and persist the state so a
    /// restart keeps the new limits' counters coherent.
    pub async fn update_limits(&self, limits: RiskLimits) -> Result<()> {
        self.admission.update_limits(limits).await?;
        let snapshot = self.admission.snapshot().await;
        self.store.save_admission_state(&snapshot).await
    }

    /// Fold an externally observed realized P&L (e.g. from a fill feed)
    /// into the daily tallies that drive mode transitions.
    pub async fn record_realized_pnl(&self, amount: Decimal, equity: Decimal) {
        *self.daily_realized_pnl.write().await += amount;
        self.admission.record_pnl(amount, equity).await;
    }

    pub async fn run_cycle(&self) -> Result<()> {
        let cycle = self.cycle_count.fetch_add(1, Ordering::SeqCst) + 1;
        info!(cycle, "trading cycle started");

        let mut record = CycleRecord::new(cycle);

        // Cool-down window: skip everything, record the skip.
        let now = Utc::now();
        if let Some(until) = *self.suspended_until.read().await {
            if now < until {
                let remaining = (until - now).num_seconds();
                warn!(remaining_secs = remaining, "inside cool-down window, skipping cycle");
                record.error = Some("risk cool-down active".to_string());
                record.cooldown_remaining_secs = Some(remaining);
                self.persist_cycle(&record).await;
                return Ok(());
            }
        }

        self.maybe_rollover_daily(now).await;

        let mut context = match self.context_builder.build(
            cycle,
            self.started_at,
            self.trader.as_ref(),
            self.feed.as_ref(),
            self.store.as_ref(),
        ).await {
            Ok(context) => context,
            Err(e) => {
                record.error = Some(format!("context build failed: {e}"));
                self.persist_cycle(&record).await;
                return Err(e);
            }
        };
        record.account = context.account.clone();
        record.positions = context.positions.clone();
        record.candidates = context.candidates.iter().map(|c| c.symbol.clone()).collect();
        info!(
            equity = %context.account.total_equity,
            positions = context.positions.len(),
            candidates = context.candidates.len(),
            "context built"
        );

        let heat = self
            .sizer
            .portfolio_heat(&context.positions, context.account.total_equity);
        let daily_pnl_fraction = if context.account.total_equity > Decimal::ZERO {
            *self.daily_realized_pnl.read().await / context.account.total_equity
        } else {
            Decimal::ZERO
        };
        if self.sizer.should_reduce_exposure(heat, daily_pnl_fraction) {
            warn!(%heat, %daily_pnl_fraction, "portfolio running hot, opens will be sized down");
        }

        if let Some(transition) = self
            .admission
            .evaluate_mode(context.account.total_equity)
            .await
        {
            record.mode_transition = Some(transition);
        }

        let mut snapshots: HashMap<String, Option<MarketSnapshot>> = HashMap::new();
        if let Some(analysis) = self.classify_regime(&context, &mut snapshots).await {
            record.regime = Some(analysis.regime);
            context.regime = Some(analysis);
        }

        let full_decision = match self.provider.decide(&context).await {
            Ok(full) => {
                record.provider_rationale = Some(full.rationale.clone());
                full
            }
            Err(e) => {
                record.error = Some(format!("decision provider failed: {e}"));
                self.persist_cycle(&record).await;
                return Err(e);
            }
        };

        // Closes before opens so a close+reopen pair on one symbol can
        // never hold a momentary double-sized position. Stable otherwise.
        let mut decisions = full_decision.decisions;
        decisions.sort_by_key(|d| d.action.priority());

        self.refresh_correlation(&context, &decisions, &mut snapshots).await;

        record.success = true;
        for decision in &decisions {
            let outcome = self
                .execute_decision(decision, &context, &mut snapshots)
                .await;
            let executed = matches!(outcome, ActionOutcome::Executed { .. });

            record.decisions.push(DecisionRecord {
                symbol: decision.symbol.clone(),
                action: decision.action,
                notional_usd: decision.position_size_usd,
                outcome,
            });

            // A short pause between executions avoids overlapping
            // exchange-state races.
            if executed {
                tokio::time::sleep(Duration::from_millis(self.config.engine.execution_delay_ms))
                    .await;
            }
        }

        self.persist_cycle(&record).await;
        Ok(())
    }

    /// Reset the engine-local daily accumulator once 24 hours have passed.
    async fn maybe_rollover_daily(&self, now: DateTime<Utc>) {
        let mut last = self.last_daily_rollover.write().await;
        if now - *last > chrono::Duration::hours(24) {
            *last = now;
            *self.daily_realized_pnl.write().await = Decimal::ZERO;
            info!("daily realized P&L rolled over");
        }
    }

    /// Classify the market regime on the cycle's lead symbol: the first
    /// held position if any, otherwise the top-ranked candidate.
    async fn classify_regime(
        &self,
        context: &TradingContext,
        snapshots: &mut HashMap<String, Option<MarketSnapshot>>,
    ) -> Option<RegimeAnalysis> {
        let symbol = context
            .positions
            .first()
            .map(|p| p.symbol.clone())
            .or_else(|| context.candidates.first().map(|c| c.symbol.clone()))?;
        let snapshot = self.snapshot_for(&symbol, snapshots).await?;
        let analysis = self.regime.classify(&snapshot.mid_prices);
        info!(
            %symbol,
            regime = %analysis.regime,
            volatility = %analysis.volatility,
            trend_strength = %analysis.trend_strength,
            confidence = %analysis.confidence,
            "market regime classified"
        );
        Some(analysis)
    }

    /// Refresh the correlation cache from series fetched for the symbols
    /// this cycle will actually touch.
    async fn refresh_correlation(
        &self,
        context: &TradingContext,
        decisions: &[Decision],
        snapshots: &mut HashMap<String, Option<MarketSnapshot>>,
    ) {
        let mut symbols: Vec<String> = context.positions.iter().map(|p| p.symbol.clone()).collect();
        for decision in decisions {
            if decision.action.is_open() && !symbols.contains(&decision.symbol) {
                symbols.push(decision.symbol.clone());
            }
        }

        let mut series = HashMap::new();
        for symbol in symbols {
            if let Some(snapshot) = self.snapshot_for(&symbol, snapshots).await {
                series.insert(symbol, snapshot.mid_prices);
            }
        }
        self.correlation.refresh(&series).await;
    }

    async fn snapshot_for(
        &self,
        symbol: &str,
        cache: &mut HashMap<String, Option<MarketSnapshot>>,
    ) -> Option<MarketSnapshot> {
        if let Some(cached) = cache.get(symbol) {
            return cached.clone();
        }
        let fetched = match self.feed.snapshot(symbol).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(%symbol, error = %e, "market snapshot unavailable");
                None
            }
        };
        cache.insert(symbol.to_string(), fetched.clone());
        fetched
    }

    async fn execute_decision(
        &self,
        decision: &Decision,
        context: &TradingContext,
        snapshots: &mut HashMap<String, Option<MarketSnapshot>>,
    ) -> ActionOutcome {
        match decision.action {
            TradeAction::OpenLong | TradeAction::OpenShort => {
                self.execute_open(decision, context, snapshots).await
            }
            TradeAction::CloseLong | TradeAction::CloseShort => {
                self.execute_close(decision, context, snapshots).await
            }
            TradeAction::Hold | TradeAction::Wait => ActionOutcome::Held {
                reason: "no action required".to_string(),
            },
        }
    }

    async fn execute_open(
        &self,
        decision: &Decision,
        context: &TradingContext,
        snapshots: &mut HashMap<String, Option<MarketSnapshot>>,
    ) -> ActionOutcome {
        let side = match decision.action.side() {
            Some(side) => side,
            None => {
                return ActionOutcome::Failed {
                    error: format!("{} is not an open action", decision.action),
                }
            }
        };

        // Rate/mode gate first: a refusal must not touch the exchange.
        let verdict = self.admission.check_admission().await;
        if let Some(reason) = verdict.reason() {
            info!(symbol = %decision.symbol, %reason, "open refused by admission");
            return ActionOutcome::Refused {
                reason: reason.to_string(),
            };
        }

        // One position per symbol+side: flips require an explicit close.
        if context
            .positions
            .iter()
            .any(|p| p.symbol == decision.symbol && p.side == side)
        {
            let reason = format!(
                "{} already has an open {} position, close it before reopening",
                decision.symbol, side
            );
            info!(%reason, "open refused");
            return ActionOutcome::Refused { reason };
        }

        let held: Vec<String> = context.positions.iter().map(|p| p.symbol.clone()).collect();
        if let Err(e) = self
            .correlation
            .check_correlation_risk(&held, &decision.symbol)
            .await
        {
            info!(symbol = %decision.symbol, reason = %e, "open refused by correlation gate");
            return ActionOutcome::Refused {
                reason: e.to_string(),
            };
        }

        let sized = self.sizer.position_size(
            decision.confidence,
            context.account.total_equity,
            &context.positions,
        );
        if sized == Decimal::ZERO {
            let reason = format!(
                "sizing refused open (confidence {}, {} open positions)",
                decision.confidence,
                context.positions.len()
            );
            info!(symbol = %decision.symbol, %reason, "open refused");
            return ActionOutcome::Refused { reason };
        }

        let Some(snapshot) = self.snapshot_for(&decision.symbol, snapshots).await else {
            return ActionOutcome::Failed {
                error: format!("no market data for {}", decision.symbol),
            };
        };
        if snapshot.current_price <= Decimal::ZERO {
            return ActionOutcome::Failed {
                error: format!("bad price for {}", decision.symbol),
            };
        }

        // Dynamic-risk gate: scale the flat bucket size by how hot the
        // portfolio is and how the symbol is moving, and refuse outright
        // when the aggregate budget would be breached.
        let vol_ratio = volatility_ratio(&snapshot.mid_prices);
        let rec = self.sizer.recommendation(
            decision.confidence,
            context.account.total_equity,
            &context.positions,
            vol_ratio,
        );
        if !self.sizer.check_risk_limits(
            rec.risk_fraction,
            &context.positions,
            context.account.total_equity,
        ) {
            let reason = format!(
                "aggregate risk budget exhausted ({} open positions, heat {})",
                context.positions.len(),
                rec.portfolio_heat
            );
            info!(symbol = %decision.symbol, %reason, "open refused");
            return ActionOutcome::Refused { reason };
        }
        info!(
            symbol = %decision.symbol,
            label = %rec.label,
            heat = %rec.portfolio_heat,
            risk_fraction = %rec.risk_fraction,
            volatility_ratio = %vol_ratio,
            "size recommendation"
        );

        // The provider may ask for less than the budgeted size, never more.
        let budgeted = sized.min(rec.notional_usd);
        let notional = if decision.position_size_usd > Decimal::ZERO {
            decision.position_size_usd.min(budgeted)
        } else {
            budgeted
        };
        let quantity = notional / snapshot.current_price;

        let order = match decision.action {
            TradeAction::OpenLong => {
                self.trader
                    .open_long(&decision.symbol, quantity, decision.leverage)
                    .await
            }
            _ => {
                self.trader
                    .open_short(&decision.symbol, quantity, decision.leverage)
                    .await
            }
        };

        let ack = match order {
            Ok(ack) => ack,
            Err(e) => {
                error!(symbol = %decision.symbol, error = %e, "open failed");
                return ActionOutcome::Failed {
                    error: e.to_string(),
                };
            }
        };
        info!(symbol = %decision.symbol, %side, %quantity, %notional, order_id = %ack.order_id, "position opened");

        // Only confirmed opens consume an admission slot.
        self.admission.record_trade().await;
        self.context_builder
            .track_new_position(&decision.symbol, side)
            .await;

        // Protective orders are best-effort; their failure never unwinds
        // the open.
        if decision.stop_loss > Decimal::ZERO {
            if let Err(e) = self
                .trader
                .set_stop_loss(&decision.symbol, side, quantity, decision.stop_loss)
                .await
            {
                warn!(symbol = %decision.symbol, error = %e, "failed to place stop-loss");
            }
        }
        if decision.take_profit > Decimal::ZERO {
            if let Err(e) = self
                .trader
                .set_take_profit(&decision.symbol, side, quantity, decision.take_profit)
                .await
            {
                warn!(symbol = %decision.symbol, error = %e, "failed to place take-profit");
            }
        }

        ActionOutcome::Executed {
            order_id: Some(ack.order_id),
        }
    }

    async fn execute_close(
        &self,
        decision: &Decision,
        context: &TradingContext,
        snapshots: &mut HashMap<String, Option<MarketSnapshot>>,
    ) -> ActionOutcome {
        let side = match decision.action.side() {
            Some(side) => side,
            None => {
                return ActionOutcome::Failed {
                    error: format!("{} is not a close action", decision.action),
                }
            }
        };

        let Some(position) = context
            .positions
            .iter()
            .find(|p| p.symbol == decision.symbol && p.side == side)
        else {
            return ActionOutcome::Failed {
                error: format!("no open {} position on {}", side, decision.symbol),
            };
        };

        let snapshot = self.snapshot_for(&decision.symbol, snapshots).await;
        match self.exits.evaluate(position, snapshot.as_ref()) {
            ExitVerdict::Close(trigger) => {
                info!(key = %position.key(), %trigger, "close permitted");
            }
            ExitVerdict::Hold => {
                let reason = format!("no exit trigger for {}, holding", position.key());
                info!(%reason, "close withheld");
                return ActionOutcome::Held { reason };
            }
        }

        let result = match decision.action {
            TradeAction::CloseLong => {
                self.trader
                    .close_long(&decision.symbol, position.quantity)
                    .await
            }
            _ => {
                self.trader
                    .close_short(&decision.symbol, position.quantity)
                    .await
            }
        };

        match result {
            Ok(()) => {
                info!(key = %position.key(), "position closed");
                ActionOutcome::Executed { order_id: None }
            }
            Err(e) => {
                error!(key = %position.key(), error = %e, "close failed");
                ActionOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Persistence failures are warnings; in-memory state stays
    /// authoritative until the next successful save.
    async fn persist_cycle(&self, record: &CycleRecord) {
        if let Err(e) = self.store.append_cycle(record).await {
            warn!(error = %e, "failed to persist cycle record");
        }
        let snapshot = self.admission.snapshot().await;
        if let Err(e) = self.store.save_admission_state(&snapshot).await {
            warn!(error = %e, "failed to persist admission state");
        }
    }
}
