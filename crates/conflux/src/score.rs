//! Weighted confluence scoring.
//!
//! Each configured feature is normalized into [-1, 1] and combined as a
//! weighted sum. A feature missing from the bar contributes zero and its
//! weight is *not* renormalized away, so the score magnitude honestly
//! reflects how much evidence the bar actually carries. An optional
//! volatility-regime factor dampens the score in turbulent conditions;
//! the final value is clamped so the [-1, 1] bound always holds.

use serde::Deserialize;
use thiserror::Error;

use crate::sync::CompositeBar;

/// Feature names the scorer knows how to normalize.
pub const KNOWN_FEATURES: &[&str] = &[
    "vwap_bias",
    "delta_ratio",
    "pressure",
    "value_area",
    "level_proximity",
];

/// Tolerance for the weight-sum invariant.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Configuration errors. All of these abort startup: a live miscomputation
/// is worse than a refused start.
#[derive(Debug, Error, PartialEq)]
pub enum ScoreConfigError {
    #[error("no score weights configured")]
    EmptyWeights,

    #[error("unknown feature `{0}` in score weights")]
    UnknownFeature(String),

    #[error("feature `{0}` listed more than once")]
    DuplicateFeature(String),

    #[error("feature `{feature}` has negative weight {weight}")]
    NegativeWeight { feature: String, weight: f64 },

    #[error("weights sum to {0}, expected 1.0 within 1e-6")]
    BadWeightSum(f64),

    #[error("volatility curve: calm threshold {calm} must be below elevated threshold {elevated}")]
    InvertedVolThresholds { calm: f64, elevated: f64 },

    #[error("volatility curve: factors must be positive")]
    NonPositiveVolFactor,
}

/// One configured feature weight.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FeatureWeight {
    pub feature: String,
    pub weight: f64,
}

/// Ordered feature → weight mapping.
///
/// Validated at construction, never at scoring time: weights must be
/// non-negative, refer to known features, and sum to 1.0 within 1e-6.
#[derive(Debug, Clone)]
pub struct WeightConfig {
    entries: Vec<FeatureWeight>,
}

impl WeightConfig {
    pub fn new(entries: Vec<FeatureWeight>) -> Result<Self, ScoreConfigError> {
        if entries.is_empty() {
            return Err(ScoreConfigError::EmptyWeights);
        }
        let mut seen = Vec::with_capacity(entries.len());
        for entry in &entries {
            if !KNOWN_FEATURES.contains(&entry.feature.as_str()) {
                return Err(ScoreConfigError::UnknownFeature(entry.feature.clone()));
            }
            if seen.contains(&entry.feature.as_str()) {
                return Err(ScoreConfigError::DuplicateFeature(entry.feature.clone()));
            }
            if entry.weight < 0.0 {
                return Err(ScoreConfigError::NegativeWeight {
                    feature: entry.feature.clone(),
                    weight: entry.weight,
                });
            }
            seen.push(entry.feature.as_str());
        }
        let sum: f64 = entries.iter().map(|e| e.weight).sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ScoreConfigError::BadWeightSum(sum));
        }
        Ok(Self { entries })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|e| (e.feature.as_str(), e.weight))
    }
}

impl Default for WeightConfig {
    /// The audited default weighting: price-location features carry most
    /// of the score, order flow the rest.
    fn default() -> Self {
        Self::new(vec![
            FeatureWeight { feature: "vwap_bias".into(), weight: 0.35 },
            FeatureWeight { feature: "delta_ratio".into(), weight: 0.25 },
            FeatureWeight { feature: "value_area".into(), weight: 0.20 },
            FeatureWeight { feature: "pressure".into(), weight: 0.10 },
            FeatureWeight { feature: "level_proximity".into(), weight: 0.10 },
        ])
        .expect("default weights are valid")
    }
}

/// Step curve mapping a volatility-index reading to a score multiplier.
///
/// Elevated readings dampen the score (reduced signal reliability in
/// turbulence); calm readings boost it slightly. An absent reading maps to
/// 1.0 — never to zero.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct VolRegimeCurve {
    pub calm_threshold: f64,
    pub calm_factor: f64,
    pub elevated_threshold: f64,
    pub elevated_factor: f64,
}

impl Default for VolRegimeCurve {
    fn default() -> Self {
        Self {
            calm_threshold: 15.0,
            calm_factor: 1.2,
            elevated_threshold: 28.0,
            elevated_factor: 0.8,
        }
    }
}

impl VolRegimeCurve {
    pub fn validated(self) -> Result<Self, ScoreConfigError> {
        if self.calm_threshold >= self.elevated_threshold {
            return Err(ScoreConfigError::InvertedVolThresholds {
                calm: self.calm_threshold,
                elevated: self.elevated_threshold,
            });
        }
        if self.calm_factor <= 0.0 || self.elevated_factor <= 0.0 {
            return Err(ScoreConfigError::NonPositiveVolFactor);
        }
        Ok(self)
    }

    pub fn factor(&self, vol_index: Option<f64>) -> f64 {
        match vol_index {
            Some(v) if v >= self.elevated_threshold => self.elevated_factor,
            Some(v) if v <= self.calm_threshold => self.calm_factor,
            _ => 1.0,
        }
    }
}

/// Normalization tunables.
#[derive(Debug, Clone, Copy)]
pub struct ScorerOptions {
    /// Decay constant (in ticks) for the key-level proximity feature.
    pub level_decay_ticks: f64,
    /// Instrument tick size.
    pub tick_size: f64,
}

impl Default for ScorerOptions {
    fn default() -> Self {
        Self {
            level_decay_ticks: 8.0,
            tick_size: 0.25,
        }
    }
}

/// One feature's share of a score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreComponent {
    pub feature: String,
    /// Normalized value in [-1, 1]; `None` when the bar lacks the inputs.
    pub value: Option<f64>,
    pub weight: f64,
    /// `weight * value`, zero when the feature is absent.
    pub contribution: f64,
}

/// Full scoring trace for one bar.
#[derive(Debug, Clone)]
pub struct ScoreBreakdown {
    pub components: Vec<ScoreComponent>,
    /// Weighted sum before the volatility factor.
    pub raw: f64,
    pub vol_factor: f64,
    /// Final bounded score.
    pub score: f64,
}

/// Maps a composite bar's feature set to a bounded directional score.
#[derive(Debug, Clone)]
pub struct ConfluenceScorer {
    weights: WeightConfig,
    vol_curve: VolRegimeCurve,
    options: ScorerOptions,
}

impl ConfluenceScorer {
    pub fn new(weights: WeightConfig, vol_curve: VolRegimeCurve, options: ScorerOptions) -> Self {
        Self {
            weights,
            vol_curve,
            options,
        }
    }

    /// Deterministic pure function of the bar's features and the active
    /// weighting configuration.
    pub fn score(&self, bar: &CompositeBar) -> ScoreBreakdown {
        let mut components = Vec::new();
        let mut raw = 0.0;
        for (feature, weight) in self.weights.iter() {
            let value = self.normalize(feature, bar);
            let contribution = weight * value.unwrap_or(0.0);
            raw += contribution;
            components.push(ScoreComponent {
                feature: feature.to_owned(),
                value,
                weight,
                contribution,
            });
        }

        let vol_factor = self.vol_curve.factor(bar.vol_index);
        let score = (raw * vol_factor).clamp(-1.0, 1.0);
        ScoreBreakdown {
            components,
            raw,
            vol_factor,
            score,
        }
    }

    fn normalize(&self, feature: &str, bar: &CompositeBar) -> Option<f64> {
        match feature {
            "vwap_bias" => self.vwap_bias(bar),
            "delta_ratio" => bar.derived.map(|d| d.delta_ratio),
            "pressure" => bar.derived.map(|d| {
                if d.pressure_bullish {
                    1.0
                } else if d.pressure_bearish {
                    -1.0
                } else {
                    0.0
                }
            }),
            "value_area" => self.value_area_position(bar),
            "level_proximity" => self.level_proximity(bar),
            _ => unreachable!("validated at construction"),
        }
    }

    /// Close relative to the vwap, scaled by the first band width. Falls
    /// back to bare sign when the producer exports no usable band.
    fn vwap_bias(&self, bar: &CompositeBar) -> Option<f64> {
        let close = bar.close()?;
        let vwap = bar.vwap.as_ref()?;
        let diff = close - vwap.v;
        let band = vwap.up1.map(|up| up - vwap.v).filter(|w| *w > 0.0);
        let value = match band {
            Some(width) => diff / width,
            None if diff == 0.0 => 0.0,
            None => diff.signum(),
        };
        Some(value.clamp(-1.0, 1.0))
    }

    /// Position of the close inside (or beyond) the value area, centered
    /// on the point of control: ±1 at and beyond the VAH/VAL boundaries.
    fn value_area_position(&self, bar: &CompositeBar) -> Option<f64> {
        let close = bar.close()?;
        let area = bar.value_area.as_ref()?;
        let width = area.width()?;
        Some((2.0 * (close - area.vpoc) / width).clamp(-1.0, 1.0))
    }

    /// Exponential distance decay to the nearest key level, signed by the
    /// level's side: support below price pulls positive, resistance above
    /// pulls negative.
    fn level_proximity(&self, bar: &CompositeBar) -> Option<f64> {
        let close = bar.close()?;
        let nearest = bar
            .key_levels
            .iter()
            .min_by(|a, b| {
                (close - a.price)
                    .abs()
                    .total_cmp(&(close - b.price).abs())
            })?;
        let distance_ticks = (close - nearest.price).abs() / self.options.tick_size;
        let decay = (-distance_ticks / self.options.level_decay_ticks).exp();
        let side = if nearest.price < close {
            1.0
        } else if nearest.price > close {
            -1.0
        } else {
            0.0
        };
        Some((side * decay).clamp(-1.0, 1.0))
    }
}

impl Default for ConfluenceScorer {
    fn default() -> Self {
        Self::new(
            WeightConfig::default(),
            VolRegimeCurve::default(),
            ScorerOptions::default(),
        )
    }
}
