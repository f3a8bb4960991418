//! State persistence and the cycle audit trail.
//!
//! Two durable artifacts: the admission controller's mutable state as a
//! single JSON snapshot (rewritten in place), and an append-only JSONL
//! audit log with one record per trading cycle. Rolling performance
//! statistics are derived from the tail of the audit log rather than
//! stored separately.
//!
//! Persistence failures never abort a cycle; callers log them and keep
//! the in-memory state authoritative until the next successful save.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::regime::MarketRegime;
use crate::risk::admission::{AdmissionState, ModeTransition};
use crate::types::{AccountSummary, PerformanceSummary, PositionSnapshot, TradeAction};

/// How a single decision fared inside a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionOutcome {
    /// Executed against the exchange.
    Executed { order_id: Option<String> },
    /// Refused by a risk gate before any exchange call.
    Refused { reason: String },
    /// A close withheld by the exit evaluator this cycle.
    Held { reason: String },
    /// Admitted but the exchange call failed.
    Failed { error: String },
}

/// Audit entry for one decision within a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub symbol: String,
    pub action: TradeAction,
    pub notional_usd: Decimal,
    pub outcome: ActionOutcome,
}

/// One trading cycle, persisted whether or not the cycle succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub id: Uuid,
    pub cycle_number: u64,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    /// Set when the cycle was skipped inside a cool-down window.
    pub cooldown_remaining_secs: Option<i64>,
    pub mode_transition: Option<ModeTransition>,
    /// Regime label read on the cycle's lead symbol.
    #[serde(default)]
    pub regime: Option<MarketRegime>,
    /// Provider rationale, kept even on provider failure for debugging.
    pub provider_rationale: Option<String>,
    /// Account summary as seen at context-build time; defaulted when the
    /// cycle failed before the context existed.
    #[serde(default)]
    pub account: AccountSummary,
    /// Open positions as seen at context-build time.
    #[serde(default)]
    pub positions: Vec<PositionSnapshot>,
    /// Candidate symbols handed to the provider this cycle.
    #[serde(default)]
    pub candidates: Vec<String>,
    pub decisions: Vec<DecisionRecord>,
}

impl CycleRecord {
    pub fn new(cycle_number: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            cycle_number,
            timestamp: Utc::now(),
            success: false,
            error: None,
            cooldown_remaining_secs: None,
            mode_transition: None,
            regime: None,
            provider_rationale: None,
            account: AccountSummary::default(),
            positions: Vec::new(),
            candidates: Vec::new(),
            decisions: Vec::new(),
        }
    }
}

/// Persistence port consumed by the engine.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_admission_state(&self, state: &AdmissionState) -> Result<()>;

    async fn load_admission_state(&self) -> Result<Option<AdmissionState>>;

    async fn append_cycle(&self, record: &CycleRecord) -> Result<()>;

    /// Aggregate statistics over the most recent `lookback` cycles.
    async fn load_performance(&self, lookback: usize) -> Result<PerformanceSummary>;
}

/// File-backed store: JSON snapshot plus an append-only JSONL audit log.
pub struct FileStateStore {
    state_path: PathBuf,
    cycle_log_path: PathBuf,
}

impl FileStateStore {
    pub fn new(state_path: impl AsRef<Path>, cycle_log_path: impl AsRef<Path>) -> Self {
        Self {
            state_path: state_path.as_ref().to_path_buf(),
            cycle_log_path: cycle_log_path.as_ref().to_path_buf(),
        }
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    async fn read_recent_cycles(&self, lookback: usize) -> Result<Vec<CycleRecord>> {
        if !self.cycle_log_path.exists() {
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(&self.cycle_log_path).await?;
        let mut records: Vec<CycleRecord> = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            // A torn tail line from a crashed write is skipped, not fatal.
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) => debug!(error = %e, "skipping unparseable audit line"),
            }
        }
        if records.len() > lookback {
            records.drain(..records.len() - lookback);
        }
        Ok(records)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save_admission_state(&self, state: &AdmissionState) -> Result<()> {
        Self::ensure_parent(&self.state_path).await?;
        let json = serde_json::to_string_pretty(state)?;
        tokio::fs::write(&self.state_path, json).await?;
        debug!(path = %self.state_path.display(), "admission state saved");
        Ok(())
    }

    async fn load_admission_state(&self) -> Result<Option<AdmissionState>> {
        if !self.state_path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&self.state_path).await?;
        let state = serde_json::from_str(&content)?;
        Ok(Some(state))
    }

    async fn append_cycle(&self, record: &CycleRecord) -> Result<()> {
        Self::ensure_parent(&self.cycle_log_path).await?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.cycle_log_path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn load_performance(&self, lookback: usize) -> Result<PerformanceSummary> {
        let records = self.read_recent_cycles(lookback).await?;
        let mut summary = PerformanceSummary {
            cycles_analyzed: records.len(),
            ..Default::default()
        };
        for record in &records {
            if !record.success {
                summary.failed_cycles += 1;
            }
            for decision in &record.decisions {
                match &decision.outcome {
                    ActionOutcome::Executed { .. } if decision.action.is_open() => {
                        summary.executed_opens += 1;
                    }
                    ActionOutcome::Executed { .. } if decision.action.is_close() => {
                        summary.executed_closes += 1;
                    }
                    ActionOutcome::Executed { .. } => {}
                    ActionOutcome::Refused { .. } if decision.action.is_open() => {
                        summary.refused_opens += 1;
                    }
                    ActionOutcome::Refused { .. } | ActionOutcome::Held { .. } => {}
                    ActionOutcome::Failed { .. } => summary.failed_actions += 1,
                }
            }
        }
        Ok(summary)
    }
}
