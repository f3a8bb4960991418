//! Risk-gated decision execution engine for leveraged derivatives trading.
//!
//! On a fixed cadence the engine gathers account and market state, asks an
//! external reasoning provider for trading decisions, and executes them
//! through layered risk controls.
//!
//! ## Architecture
//!
//! ```text
//! Engine (scheduler) → Context (exchange + market feed + performance)
//!                    → Decision Provider (external)
//!                    → priority sort (closes before opens)
//!                    → Admission / Correlation / Sizing gates (opens)
//!                    → Exit Evaluator (closes)
//!                    → Exchange adapter → audit record (JSONL)
//! ```
//!
//! The exchange adapter, decision provider, and market feed are
//! capability traits; the engine and risk components depend only on the
//! interfaces.

pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod market;
pub mod provider;
pub mod regime;
pub mod risk;
pub mod storage;
pub mod types;
