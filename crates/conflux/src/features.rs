//! Derived order-flow metrics.
//!
//! Pure, stateless transformation from a bar's raw footprint to fields the
//! producers do not emit. Derivation is idempotent given identical inputs.
//! A zero-volume bar produces no metrics at all; absence is a valid
//! outcome, not an error, and never a NaN.

use serde::Serialize;

use conflux_common::Footprint;

/// Metrics computed by the engine from a raw footprint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DerivedMetrics {
    /// Signed delta over total volume, in [-1, 1].
    pub delta_ratio: f64,
    /// Delta ratio exceeded the positive pressure threshold.
    pub pressure_bullish: bool,
    /// Delta ratio fell below the negative pressure threshold.
    pub pressure_bearish: bool,
}

/// Derive metrics from one bar's footprint.
///
/// The producers set their pressure flags on the bare sign of delta; here a
/// bar is only marked pressured when `|delta_ratio|` clears the configured
/// threshold, so near-balanced bars stay neutral.
pub fn derive_metrics(footprint: &Footprint, pressure_threshold: f64) -> Option<DerivedMetrics> {
    if footprint.total_volume <= 0.0 {
        return None;
    }
    let delta_ratio = (footprint.delta / footprint.total_volume).clamp(-1.0, 1.0);
    Some(DerivedMetrics {
        delta_ratio,
        pressure_bullish: delta_ratio > pressure_threshold,
        pressure_bearish: delta_ratio < -pressure_threshold,
    })
}
