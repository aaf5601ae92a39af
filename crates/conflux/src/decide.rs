//! Threshold/hysteresis decision engine.
//!
//! A finite-state machine over {Long, Short, Flat} with a hysteresis band:
//! entries require the score to clear `upper_threshold`, and an open
//! position is only surrendered when the score crosses the *opposite*
//! lower threshold, so oscillation near a boundary cannot flap the action.
//! The transition function is total: every (state, score) pair maps to
//! exactly one next state.
//!
//! An optional proximity gate forces Flat when the close sits within a
//! configured distance of an externally supplied key level, a caution rule
//! near known structural prices.

use serde::Serialize;
use thiserror::Error;

use conflux_common::{Action, BarIndex, ChartId};

use crate::sync::CompositeBar;

/// Threshold configuration errors; abort startup.
#[derive(Debug, Error, PartialEq)]
pub enum ThresholdError {
    #[error("lower threshold {lower} must be strictly below upper threshold {upper}")]
    Inverted { lower: f64, upper: f64 },

    #[error("thresholds must be positive, got lower={lower} upper={upper}")]
    NonPositive { lower: f64, upper: f64 },
}

/// One emitted decision. Derived, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub action: Action,
    pub score: f64,
    pub chart: ChartId,
    pub bar_index: BarIndex,
    /// Originating bar timestamp (day fraction).
    pub t: f64,
    /// The bar was finalized before reaching completeness; consumers
    /// should discount this decision.
    pub partial: bool,
    /// Forced Flat by the key-level proximity gate.
    pub gated: bool,
}

/// Hysteresis state machine producing one decision per finalized bar.
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    upper: f64,
    lower: f64,
    /// Minimum distance to the nearest key level; closer bars are forced
    /// Flat. `None` disables the gate.
    min_level_distance: Option<f64>,
    state: Action,
}

impl DecisionEngine {
    pub fn new(
        upper: f64,
        lower: f64,
        min_level_distance: Option<f64>,
    ) -> Result<Self, ThresholdError> {
        if upper <= 0.0 || lower <= 0.0 {
            return Err(ThresholdError::NonPositive { lower, upper });
        }
        if lower >= upper {
            return Err(ThresholdError::Inverted { lower, upper });
        }
        Ok(Self {
            upper,
            lower,
            min_level_distance,
            state: Action::Flat,
        })
    }

    /// Current FSM state.
    pub fn state(&self) -> Action {
        self.state
    }

    /// Total transition function.
    ///
    /// - score >= upper: Long
    /// - score <= -upper: Short
    /// - otherwise a Long survives until the score drops below -lower and
    ///   a Short survives until it rises above +lower; Flat stays Flat.
    fn next_state(state: Action, score: f64, upper: f64, lower: f64) -> Action {
        if score >= upper {
            Action::Long
        } else if score <= -upper {
            Action::Short
        } else {
            match state {
                Action::Long if score < -lower => Action::Flat,
                Action::Short if score > lower => Action::Flat,
                Action::Flat => Action::Flat,
                held => held,
            }
        }
    }

    /// Advance the machine with one scored bar and produce its decision.
    pub fn decide(&mut self, bar: &CompositeBar, score: f64) -> Decision {
        let gated = match (self.min_level_distance, bar.nearest_level_distance()) {
            (Some(min), Some(distance)) => distance < min,
            _ => false,
        };

        self.state = if gated {
            Action::Flat
        } else {
            Self::next_state(self.state, score, self.upper, self.lower)
        };

        Decision {
            action: self.state,
            score,
            chart: bar.chart,
            bar_index: bar.index,
            t: bar.t,
            partial: bar.partial,
            gated,
        }
    }
}
