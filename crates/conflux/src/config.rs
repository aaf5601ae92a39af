//! Engine configuration.
//!
//! Loaded from a TOML file, then overridden by environment variables and
//! CLI arguments, then validated. Validation is fail-fast and happens
//! before any event is processed: a live miscomputation is worse than a
//! refused start.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use conflux_common::{ChartId, EventKind};

use crate::decide::DecisionEngine;
use crate::score::{FeatureWeight, ScorerOptions, VolRegimeCurve, WeightConfig};
use crate::source::FollowConfig;
use crate::sync::SyncOptions;

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub general: GeneralConfig,
    pub stream: StreamConfig,
    pub sync: SyncConfig,
    pub features: FeatureConfig,
    pub score: ScoreConfig,
    pub decision: DecisionConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneralConfig {
    /// Logging filter, e.g. "info" or "conflux=debug".
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Merge-stage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    /// Target chart; bar-scoped events from other charts are dropped.
    pub chart: ChartId,
    /// Kinds admitted into the merge.
    pub allow: Vec<EventKind>,
    /// Kinds required before a bar counts as complete.
    pub required: Vec<EventKind>,
    /// Follow mode: a source with no new data for this long is caught up.
    pub idle_timeout_secs: u64,
    /// Follow mode: poll cadence for appended data.
    pub poll_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chart: 3,
            allow: vec![
                EventKind::BarSummary,
                EventKind::Vwap,
                EventKind::ValueArea,
                EventKind::VolIndex,
                EventKind::Footprint,
                EventKind::FlowMetrics,
                EventKind::KeyLevel,
            ],
            required: vec![EventKind::BarSummary, EventKind::Vwap, EventKind::Footprint],
            idle_timeout_secs: 30,
            poll_interval_ms: 250,
        }
    }
}

/// Synchronizer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub carry_depth: usize,
    pub level_ttl_secs: f64,
    pub vol_ttl_secs: f64,
    pub bar_timeout_secs: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let defaults = SyncOptions::default();
        Self {
            carry_depth: defaults.carry_depth,
            level_ttl_secs: defaults.level_ttl_secs,
            vol_ttl_secs: defaults.vol_ttl_secs,
            bar_timeout_secs: defaults.bar_timeout_secs,
        }
    }
}

/// Feature-derivation configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeatureConfig {
    /// Delta-ratio magnitude a bar must clear to carry a pressure flag.
    pub pressure_threshold: f64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            pressure_threshold: 0.10,
        }
    }
}

/// Scoring configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScoreConfig {
    /// Ordered feature weights; must sum to 1.0 within 1e-6.
    pub weights: Vec<FeatureWeight>,
    pub level_decay_ticks: f64,
    pub tick_size: f64,
    pub volatility: VolRegimeCurve,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        let options = ScorerOptions::default();
        Self {
            weights: WeightConfig::default().iter()
                .map(|(feature, weight)| FeatureWeight {
                    feature: feature.to_owned(),
                    weight,
                })
                .collect(),
            level_decay_ticks: options.level_decay_ticks,
            tick_size: options.tick_size,
            volatility: VolRegimeCurve::default(),
        }
    }
}

/// Decision-engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecisionConfig {
    pub upper_threshold: f64,
    pub lower_threshold: f64,
    /// Bars closing nearer than this to a key level are forced Flat.
    /// Zero or negative disables the gate.
    pub min_level_distance: f64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            upper_threshold: 0.6,
            lower_threshold: 0.2,
            min_level_distance: 0.0,
        }
    }
}

/// Output configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    /// Copy original events to the output interleaved with derived ones.
    pub passthrough: bool,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse TOML config")
    }

    /// Apply environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("CONFLUX_LOG_LEVEL") {
            self.general.log_level = level;
        }
        if let Ok(chart) = std::env::var("CONFLUX_CHART") {
            if let Ok(chart) = chart.parse() {
                self.stream.chart = chart;
            }
        }
    }

    /// Apply CLI argument overrides.
    pub fn apply_cli_overrides(
        &mut self,
        chart: Option<ChartId>,
        passthrough: bool,
        log_level: Option<String>,
    ) {
        if let Some(chart) = chart {
            self.stream.chart = chart;
        }
        if passthrough {
            self.output.passthrough = true;
        }
        if let Some(level) = log_level {
            self.general.log_level = level;
        }
    }

    /// Validate the configuration, constructing every fallible component
    /// once so that bad values are refused before any event is processed.
    pub fn validate(&self) -> Result<()> {
        self.weight_config().context("invalid score weights")?;
        self.score
            .volatility
            .validated()
            .context("invalid volatility curve")?;
        DecisionEngine::new(
            self.decision.upper_threshold,
            self.decision.lower_threshold,
            self.min_level_distance(),
        )
        .context("invalid decision thresholds")?;

        if self.stream.allow.is_empty() {
            bail!("allow-list must contain at least one event kind");
        }
        let allow = self.allow_set();
        for kind in &self.stream.required {
            if !allow.contains(kind) {
                bail!("required kind `{kind}` is not in the allow-list");
            }
        }
        if self.stream.required.is_empty() {
            bail!("required-kinds set must not be empty");
        }
        if self.stream.idle_timeout_secs == 0 {
            bail!("idle_timeout_secs must be positive");
        }
        if self.stream.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be positive");
        }

        if self.sync.carry_depth == 0 {
            bail!("carry_depth must be at least 1");
        }
        for (name, value) in [
            ("level_ttl_secs", self.sync.level_ttl_secs),
            ("vol_ttl_secs", self.sync.vol_ttl_secs),
            ("bar_timeout_secs", self.sync.bar_timeout_secs),
        ] {
            if value <= 0.0 || !value.is_finite() {
                bail!("{name} must be positive and finite");
            }
        }

        if !(0.0..1.0).contains(&self.features.pressure_threshold) {
            bail!("pressure_threshold must be in [0, 1)");
        }
        if self.score.tick_size <= 0.0 {
            bail!("tick_size must be positive");
        }
        if self.score.level_decay_ticks <= 0.0 {
            bail!("level_decay_ticks must be positive");
        }

        Ok(())
    }

    pub fn allow_set(&self) -> BTreeSet<EventKind> {
        self.stream.allow.iter().copied().collect()
    }

    pub fn required_set(&self) -> BTreeSet<EventKind> {
        self.stream.required.iter().copied().collect()
    }

    pub fn weight_config(&self) -> Result<WeightConfig, crate::score::ScoreConfigError> {
        WeightConfig::new(self.score.weights.clone())
    }

    pub fn scorer_options(&self) -> ScorerOptions {
        ScorerOptions {
            level_decay_ticks: self.score.level_decay_ticks,
            tick_size: self.score.tick_size,
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            carry_depth: self.sync.carry_depth,
            level_ttl_secs: self.sync.level_ttl_secs,
            vol_ttl_secs: self.sync.vol_ttl_secs,
            bar_timeout_secs: self.sync.bar_timeout_secs,
        }
    }

    pub fn follow_config(&self) -> FollowConfig {
        FollowConfig {
            poll_interval: Duration::from_millis(self.stream.poll_interval_ms),
            idle_timeout: Duration::from_secs(self.stream.idle_timeout_secs),
        }
    }

    pub fn min_level_distance(&self) -> Option<f64> {
        (self.decision.min_level_distance > 0.0).then_some(self.decision.min_level_distance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.stream.chart, 3);
        assert_eq!(config.decision.upper_threshold, 0.6);
        assert!(config.min_level_distance().is_none());
    }

    #[test]
    fn test_parse_full_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            [general]
            log_level = "debug"

            [stream]
            chart = 4
            allow = ["basedata", "nbcv_footprint", "vix"]
            required = ["basedata", "nbcv_footprint"]
            idle_timeout_secs = 10
            poll_interval_ms = 100

            [sync]
            carry_depth = 5
            level_ttl_secs = 600.0
            vol_ttl_secs = 60.0
            bar_timeout_secs = 90.0

            [features]
            pressure_threshold = 0.15

            [score]
            level_decay_ticks = 6.0
            tick_size = 0.25
            weights = [
                { feature = "delta_ratio", weight = 0.7 },
                { feature = "pressure", weight = 0.3 },
            ]

            [score.volatility]
            calm_threshold = 14.0
            calm_factor = 1.1
            elevated_threshold = 25.0
            elevated_factor = 0.7

            [decision]
            upper_threshold = 0.5
            lower_threshold = 0.1
            min_level_distance = 2.5

            [output]
            passthrough = true
            "#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.stream.chart, 4);
        assert_eq!(config.stream.allow.len(), 3);
        assert_eq!(config.sync.carry_depth, 5);
        assert_eq!(config.features.pressure_threshold, 0.15);
        assert_eq!(config.score.volatility.elevated_factor, 0.7);
        assert_eq!(config.min_level_distance(), Some(2.5));
        assert!(config.output.passthrough);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [stream]
            chart = 7
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.stream.chart, 7);
        assert_eq!(config.decision.lower_threshold, 0.2);
    }

    #[test]
    fn test_bad_weight_sum_fails_validation() {
        let config = EngineConfig::from_toml_str(
            r#"
            [score]
            weights = [
                { feature = "delta_ratio", weight = 0.7 },
                { feature = "pressure", weight = 0.2 },
            ]
            "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(format!("{err:#}").contains("score weights"));
    }

    #[test]
    fn test_inverted_thresholds_fail_validation() {
        let config = EngineConfig::from_toml_str(
            r#"
            [decision]
            upper_threshold = 0.2
            lower_threshold = 0.6
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_required_must_be_allowed() {
        let config = EngineConfig::from_toml_str(
            r#"
            [stream]
            allow = ["basedata"]
            required = ["basedata", "nbcv_footprint"]
            "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("nbcv_footprint"));
    }

    #[test]
    fn test_unknown_toml_key_is_rejected() {
        assert!(EngineConfig::from_toml_str("[stream]\ncharts = 3\n").is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = EngineConfig::default();
        config.apply_cli_overrides(Some(9), true, Some("trace".into()));
        assert_eq!(config.stream.chart, 9);
        assert!(config.output.passthrough);
        assert_eq!(config.general.log_level, "trace");
    }
}
