//! Conflux: event fusion, temporal alignment and confluence scoring.
//!
//! The engine ingests append-only JSONL telemetry logs written by
//! independent chart producers, merges them into one globally time-ordered
//! stream, groups events into per-bar composite records with carry-forward
//! of stale-but-valid values, derives order-flow metrics, scores each bar
//! with a weighted confluence model and emits `{long, short, flat}`
//! decisions back into the shared event stream.
//!
//! ## Pipeline
//!
//! ```text
//! JsonlSource(s) -> StreamMerger -> BarSynchronizer -> FeatureDeriver
//!                -> ConfluenceScorer -> DecisionEngine -> UnifiedEmitter
//! ```
//!
//! ## Modules
//!
//! - `config`: configuration loading, overrides and fail-fast validation
//! - `source`: append-only event log readers (batch and follow mode)
//! - `merge`: k-way timestamp merge with allow-list and chart filtering
//! - `sync`: composite bar assembly, carry-forward, completeness, watermark
//! - `features`: derived order-flow metrics
//! - `score`: weighted confluence scoring with volatility-regime dampening
//! - `decide`: threshold/hysteresis decision state machine
//! - `emit`: unified output stream writer
//! - `pipeline`: glue loop, counters and shutdown handling

pub mod config;
pub mod decide;
pub mod emit;
pub mod features;
pub mod merge;
pub mod pipeline;
pub mod score;
pub mod source;
pub mod sync;

pub use config::EngineConfig;
pub use decide::{Decision, DecisionEngine};
pub use emit::UnifiedEmitter;
pub use features::DerivedMetrics;
pub use merge::StreamMerger;
pub use pipeline::{Pipeline, PipelineSummary};
pub use score::{ConfluenceScorer, ScoreBreakdown, WeightConfig};
pub use source::{EventSource, FollowConfig, JsonlSource, SourceError, VecSource};
pub use sync::{BarSynchronizer, CompositeBar};
