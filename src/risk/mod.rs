//! Layered risk controls.
//!
//! Four independent gates stand between a provider decision and the
//! exchange:
//! - [`admission`]: two-mode rate limiting with profit-driven hysteresis
//! - [`sizing`]: confidence-tiered dynamic position sizing
//! - [`correlation`]: pairwise correlation exposure checks
//! - [`exit`]: volatility-scaled stop/target and trailing-stop evaluation

pub mod admission;
pub mod correlation;
pub mod exit;
pub mod sizing;

pub use admission::{AdmissionController, AdmissionMetrics, AdmissionState, AdmissionVerdict, TradingMode};
pub use correlation::{CorrelationAnalyzer, CorrelationConfig, CorrelationMatrix};
pub use exit::{ExitConfig, ExitEvaluator, ExitTrigger, ExitVerdict};
pub use sizing::{PositionSizer, SizeLabel, SizeRecommendation, SizingConfig};
