//! Shared types for the conflux telemetry fusion engine.
//!
//! This crate contains:
//! - The closed set of event kinds produced by the chart dumpers
//! - The wire-level event model and per-line JSONL parsing
//! - Trading actions
//! - Timestamp conversion helpers for the charting platform's epoch

pub mod event;
pub mod kinds;
pub mod time;

pub use event::{
    BarSummary, Event, EventParseError, FlowMetrics, Footprint, KeyLevel, Payload, ValueArea,
    VwapBands,
};
pub use kinds::{Action, EventKind};
pub use time::{day_fraction_to_utc, to_unix_seconds, SIERRA_EPOCH_UNIX_SECS};

/// Logical source/channel identifier (the charting platform's chart number).
pub type ChartId = i32;

/// Monotonically increasing bar index within one chart.
pub type BarIndex = i64;
