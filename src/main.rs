//! Paper-trading entry point.
//!
//! Wires the engine to in-process simulated collaborators: a paper
//! exchange holding balances and positions in memory, a deterministic
//! market feed, and a conservative hold-only decision provider. Real
//! venue adapters and reasoning providers implement the same traits and
//! slot in at construction time.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use perpbot::config::BotConfig;
use perpbot::engine::TradingEngine;
use perpbot::error::{BotError, Result};
use perpbot::exchange::{AccountBalance, ExchangePosition, OrderAck, Trader};
use perpbot::market::MarketFeed;
use perpbot::provider::DecisionProvider;
use perpbot::storage::FileStateStore;
use perpbot::types::{
    CandidateSymbol, Decision, FullDecision, MarketSnapshot, PositionSide, RankingSource,
    TradeAction, TradingContext,
};

#[derive(Parser)]
#[command(name = "perpbot")]
#[command(about = "Risk-gated decision execution engine for leveraged derivatives")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine against the in-process paper exchange
    Run,
    /// Load and validate the configuration, then exit
    Validate,
}

/// In-memory paper exchange.
struct PaperTrader {
    state: Mutex<PaperState>,
}

struct PaperState {
    balance: Decimal,
    positions: Vec<ExchangePosition>,
    next_order_id: u64,
}

impl PaperTrader {
    fn new(balance: Decimal) -> Self {
        Self {
            state: Mutex::new(PaperState {
                balance,
                positions: Vec::new(),
                next_order_id: 1,
            }),
        }
    }

    async fn open(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
        leverage: u32,
        price: Decimal,
    ) -> Result<OrderAck> {
        let mut state = self.state.lock().await;
        let notional = quantity * price;
        let order_id = format!("paper-{}", state.next_order_id);
        state.next_order_id += 1;
        state.positions.push(ExchangePosition {
            symbol: symbol.to_string(),
            side,
            entry_price: price,
            mark_price: price,
            quantity,
            leverage,
            unrealized_pnl: Decimal::ZERO,
            notional,
            liquidation_price: match side {
                PositionSide::Long => price / dec!(2),
                PositionSide::Short => price * dec!(2),
            },
            margin_used: notional / Decimal::from(leverage.max(1)),
        });
        Ok(OrderAck { order_id })
    }

    async fn close(&self, symbol: &str, side: PositionSide) -> Result<()> {
        let mut state = self.state.lock().await;
        let before = state.positions.len();
        state
            .positions
            .retain(|p| !(p.symbol == symbol && p.side == side));
        if state.positions.len() == before {
            return Err(BotError::Exchange(format!(
                "no {} position on {}",
                side, symbol
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Trader for PaperTrader {
    async fn get_balance(&self) -> Result<AccountBalance> {
        let state = self.state.lock().await;
        let unrealized: Decimal = state.positions.iter().map(|p| p.unrealized_pnl).sum();
        let margin: Decimal = state.positions.iter().map(|p| p.margin_used).sum();
        Ok(AccountBalance {
            wallet_balance: state.balance,
            unrealized_pnl: unrealized,
            available_balance: state.balance - margin,
        })
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>> {
        Ok(self.state.lock().await.positions.clone())
    }

    async fn open_long(&self, symbol: &str, quantity: Decimal, leverage: u32) -> Result<OrderAck> {
        // Entry at the feed's reference price; fills are idealized.
        self.open(symbol, PositionSide::Long, quantity, leverage, reference_price(symbol))
            .await
    }

    async fn open_short(&self, symbol: &str, quantity: Decimal, leverage: u32) -> Result<OrderAck> {
        self.open(symbol, PositionSide::Short, quantity, leverage, reference_price(symbol))
            .await
    }

    async fn close_long(&self, symbol: &str, _quantity: Decimal) -> Result<()> {
        self.close(symbol, PositionSide::Long).await
    }

    async fn close_short(&self, symbol: &str, _quantity: Decimal) -> Result<()> {
        self.close(symbol, PositionSide::Short).await
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        _quantity: Decimal,
        price: Decimal,
    ) -> Result<()> {
        info!(%symbol, %side, %price, "paper stop-loss noted");
        Ok(())
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        _quantity: Decimal,
        price: Decimal,
    ) -> Result<()> {
        info!(%symbol, %side, %price, "paper take-profit noted");
        Ok(())
    }
}

/// Deterministic per-symbol reference price, derived from the symbol name
/// so the paper session is reproducible.
fn reference_price(symbol: &str) -> Decimal {
    let seed: u32 = symbol.bytes().map(u32::from).sum();
    Decimal::from(100 + seed % 900)
}

/// Deterministic market feed: a gentle oscillation around the reference
/// price per symbol, enough history for indicators and correlations.
struct PaperFeed {
    symbols: Vec<String>,
}

impl PaperFeed {
    fn series_for(&self, symbol: &str) -> Vec<Decimal> {
        let base = reference_price(symbol);
        let seed: i64 = symbol.bytes().map(i64::from).sum();
        (0..40)
            .map(|i| {
                let wobble = ((i as i64 * 7 + seed) % 11) - 5;
                base + base * Decimal::from(wobble) / dec!(1000)
            })
            .collect()
    }
}

#[async_trait]
impl MarketFeed for PaperFeed {
    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot> {
        let mid_prices = self.series_for(symbol);
        let current_price = *mid_prices
            .last()
            .ok_or_else(|| BotError::MarketData(format!("no series for {symbol}")))?;
        let ema20 = mid_prices.iter().rev().take(20).sum::<Decimal>() / dec!(20);
        Ok(MarketSnapshot {
            symbol: symbol.to_string(),
            current_price,
            atr14: Some(current_price * dec!(0.005)),
            ema20,
            macd: current_price - ema20,
            rsi7: dec!(50),
            mid_prices,
        })
    }

    async fn momentum_rankings(&self, limit: usize) -> Result<Vec<CandidateSymbol>> {
        Ok(self
            .symbols
            .iter()
            .take(limit)
            .map(|s| CandidateSymbol {
                symbol: s.clone(),
                sources: vec![RankingSource::Momentum],
            })
            .collect())
    }

    async fn open_interest_rankings(&self, limit: usize) -> Result<Vec<CandidateSymbol>> {
        Ok(self
            .symbols
            .iter()
            .rev()
            .take(limit)
            .map(|s| CandidateSymbol {
                symbol: s.clone(),
                sources: vec![RankingSource::OpenInterest],
            })
            .collect())
    }
}

/// Hold-only provider: exercises the full cycle without ever opening a
/// position. Swap in a real reasoning provider for live decisions.
struct HoldProvider;

#[async_trait]
impl DecisionProvider for HoldProvider {
    fn name(&self) -> &str {
        "hold-only"
    }

    async fn decide(&self, context: &TradingContext) -> Result<FullDecision> {
        let decisions = context
            .candidates
            .iter()
            .map(|candidate| Decision {
                symbol: candidate.symbol.clone(),
                action: TradeAction::Hold,
                leverage: 1,
                position_size_usd: Decimal::ZERO,
                stop_loss: Decimal::ZERO,
                take_profit: Decimal::ZERO,
                confidence: 0,
                reasoning: "paper session holds by default".to_string(),
            })
            .collect();
        Ok(FullDecision {
            prompt: format!("cycle {}", context.cycle_number),
            rationale: "no reasoning provider wired in, holding everything".to_string(),
            decisions,
            timestamp: Utc::now(),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = BotConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Validate => {
            info!("configuration is valid");
            Ok(())
        }
        Commands::Run => run(config).await,
    }
}

async fn run(config: BotConfig) -> anyhow::Result<()> {
    let store = Arc::new(FileStateStore::new(
        &config.storage.admission_state_file,
        &config.storage.cycle_log_file,
    ));
    let trader = Arc::new(PaperTrader::new(config.engine.initial_balance));
    let feed = Arc::new(PaperFeed {
        symbols: vec![
            "BTCUSDT".to_string(),
            "ETHUSDT".to_string(),
            "SOLUSDT".to_string(),
        ],
    });

    let engine = Arc::new(TradingEngine::new(
        config,
        trader,
        Arc::new(HoldProvider),
        feed,
        store,
    )?);
    engine.init().await?;

    let handle = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run().await })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    engine.stop();
    handle.await??;
    Ok(())
}
