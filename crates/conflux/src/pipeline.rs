//! Pipeline glue: merge → synchronize → derive → score → decide → emit.
//!
//! A single logical pull loop. The merger is the only stage with ordering
//! discipline; everything downstream consumes its output in emission order
//! and never reorders. Between events the loop honors a shared shutdown
//! flag; on shutdown the buffered bar is flushed as partial, never dropped.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::decide::DecisionEngine;
use crate::emit::UnifiedEmitter;
use crate::features::derive_metrics;
use crate::merge::StreamMerger;
use crate::score::ConfluenceScorer;
use crate::source::{EventSource, SourceError};
use crate::sync::{BarSynchronizer, CompositeBar};

/// Errors during a pipeline run. Stage-local data problems (bad lines,
/// unknown kinds, late events) never surface here; they are absorbed at
/// the stage boundary and reflected only in counters.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("output error: {0}")]
    Output(#[from] std::io::Error),
}

/// Aggregated counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PipelineSummary {
    pub events_processed: u64,
    pub lines_skipped: u64,
    pub unknown_kind_drops: u64,
    pub dropped_kind: u64,
    pub dropped_chart: u64,
    pub missing_index: u64,
    pub late_events: u64,
    pub timestamp_conflicts: u64,
    pub bars_completed: u64,
    pub bars_partial: u64,
    pub derived_written: u64,
    pub decisions_written: u64,
    pub passthrough_written: u64,
    /// The run ended on the shutdown flag rather than source exhaustion.
    pub interrupted: bool,
    /// Timestamp of the first emitted decision.
    pub first_decision_t: Option<f64>,
    /// Timestamp of the last emitted decision.
    pub last_decision_t: Option<f64>,
}

/// The assembled processing pipeline.
pub struct Pipeline<W: Write> {
    merger: StreamMerger,
    synchronizer: BarSynchronizer,
    scorer: ConfluenceScorer,
    engine: DecisionEngine,
    emitter: UnifiedEmitter<W>,
    pressure_threshold: f64,
    shutdown: Arc<AtomicBool>,
    events_processed: u64,
    first_decision_t: Option<f64>,
    last_decision_t: Option<f64>,
}

impl<W: Write> Pipeline<W> {
    /// Build a pipeline from validated configuration. Sources are
    /// registered separately; registration order is the tie-break order.
    pub fn from_config(config: &EngineConfig, out: W) -> Result<Self> {
        config.validate()?;
        let weights = config.weight_config().context("score weights")?;
        let vol_curve = config
            .score
            .volatility
            .validated()
            .context("volatility curve")?;
        let engine = DecisionEngine::new(
            config.decision.upper_threshold,
            config.decision.lower_threshold,
            config.min_level_distance(),
        )
        .context("decision thresholds")?;

        Ok(Self {
            merger: StreamMerger::new(config.allow_set(), config.stream.chart),
            synchronizer: BarSynchronizer::new(
                config.stream.chart,
                config.required_set(),
                config.sync_options(),
            ),
            scorer: ConfluenceScorer::new(weights, vol_curve, config.scorer_options()),
            engine,
            emitter: UnifiedEmitter::new(out, config.output.passthrough),
            pressure_threshold: config.features.pressure_threshold,
            shutdown: Arc::new(AtomicBool::new(false)),
            events_processed: 0,
            first_decision_t: None,
            last_decision_t: None,
        })
    }

    pub fn register_source(&mut self, source: Box<dyn EventSource>) {
        self.merger.register(source);
    }

    /// Shared flag consumers may set to request shutdown between bars.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Run to source exhaustion (or shutdown), returning the summary and
    /// the output writer.
    pub fn run(mut self) -> Result<(PipelineSummary, W), PipelineError> {
        info!(sources = self.merger.source_count(), "pipeline starting");
        let mut interrupted = false;

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                interrupted = true;
                info!("shutdown requested, flushing buffered bars");
                break;
            }
            let Some(event) = self.merger.next()? else {
                break;
            };
            self.events_processed += 1;
            self.emitter.passthrough_event(&event)?;

            let mut finalized = self.synchronizer.route(&event);
            if let Some(watermark) = self.merger.watermark() {
                finalized.extend(self.synchronizer.flush_stale(watermark));
            }
            for bar in finalized {
                self.process_bar(bar)?;
            }
        }

        for bar in self.synchronizer.flush_all() {
            self.process_bar(bar)?;
        }
        self.emitter.flush()?;

        let summary = self.summary(interrupted);
        info!(
            events = summary.events_processed,
            bars_completed = summary.bars_completed,
            bars_partial = summary.bars_partial,
            decisions = summary.decisions_written,
            "pipeline finished"
        );
        Ok((summary, self.emitter.into_inner()))
    }

    /// Score one finalized bar and emit its records exactly once.
    fn process_bar(&mut self, mut bar: CompositeBar) -> Result<(), PipelineError> {
        bar.derived = bar
            .footprint
            .as_ref()
            .and_then(|fp| derive_metrics(fp, self.pressure_threshold));

        let breakdown = self.scorer.score(&bar);
        let decision = self.engine.decide(&bar, breakdown.score);
        debug!(
            index = bar.index,
            score = breakdown.score,
            action = %decision.action,
            partial = bar.partial,
            "bar finalized"
        );

        self.first_decision_t.get_or_insert(bar.t);
        self.last_decision_t = Some(bar.t);
        self.emitter.emit_bar(&bar, &breakdown, &decision)?;
        Ok(())
    }

    fn summary(&self, interrupted: bool) -> PipelineSummary {
        let merge = self.merger.counters();
        let sync = self.synchronizer.counters();
        PipelineSummary {
            events_processed: self.events_processed,
            lines_skipped: self.merger.lines_skipped(),
            unknown_kind_drops: self.merger.unknown_kind_drops(),
            dropped_kind: merge.dropped_kind,
            dropped_chart: merge.dropped_chart,
            missing_index: sync.missing_index,
            late_events: sync.late_events,
            timestamp_conflicts: sync.timestamp_conflicts,
            bars_completed: sync.bars_completed,
            bars_partial: sync.bars_partial,
            derived_written: self.emitter.derived_written(),
            decisions_written: self.emitter.decisions_written(),
            passthrough_written: self.emitter.passthrough_written(),
            interrupted,
            first_decision_t: self.first_decision_t,
            last_decision_t: self.last_decision_t,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::VecSource;
    use conflux_common::{BarSummary, Event, Footprint, Payload};

    const SEC: f64 = 1.0 / 86_400.0;

    fn summary_event(t: f64, i: i64, close: f64) -> Event {
        Event::new(
            t,
            3,
            Some(i),
            Payload::BarSummary(BarSummary {
                o: close,
                h: close + 1.0,
                l: close - 1.0,
                c: close,
                v: 1200.0,
                bidvol: None,
                askvol: None,
            }),
        )
    }

    fn footprint_event(t: f64, i: i64, delta: f64) -> Event {
        let ask = 600.0 + delta / 2.0;
        let bid = 600.0 - delta / 2.0;
        Event::new(
            t,
            3,
            Some(i),
            Payload::Footprint(Footprint {
                ask_volume: ask,
                bid_volume: bid,
                delta,
                total_volume: ask + bid,
                trades: None,
                cumulative_delta: None,
            }),
        )
    }

    fn pipeline(config: &EngineConfig) -> Pipeline<Vec<u8>> {
        Pipeline::from_config(config, Vec::new()).unwrap()
    }

    fn basic_config() -> EngineConfig {
        EngineConfig::from_toml_str(
            r#"
            [stream]
            required = ["basedata", "nbcv_footprint"]
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_run_emits_one_decision_per_bar() {
        let mut pipe = pipeline(&basic_config());
        let base = 45_905.0;
        pipe.register_source(Box::new(VecSource::new(
            "bars",
            vec![
                summary_event(base, 1, 6500.0),
                summary_event(base + 60.0 * SEC, 2, 6501.0),
                summary_event(base + 120.0 * SEC, 3, 6502.0),
            ],
        )));
        pipe.register_source(Box::new(VecSource::new(
            "flow",
            vec![
                footprint_event(base, 1, 200.0),
                footprint_event(base + 60.0 * SEC, 2, -100.0),
            ],
        )));

        let (summary, out) = pipe.run().unwrap();
        assert_eq!(summary.decisions_written, 3);
        assert_eq!(summary.bars_completed, 2);
        assert_eq!(summary.bars_partial, 1); // bar 3 has no footprint
        assert!(!summary.interrupted);

        let text = String::from_utf8(out).unwrap();
        let decision_lines: Vec<_> = text
            .lines()
            .filter(|l| l.contains("\"type\":\"decision\""))
            .collect();
        assert_eq!(decision_lines.len(), 3);
    }

    /// Source that raises the shutdown flag once drained, so the loop sees
    /// the flag with a bar still buffered in the synchronizer.
    struct ShutdownAfter {
        inner: VecSource,
        flag: Arc<AtomicBool>,
    }

    impl EventSource for ShutdownAfter {
        fn next_event(&mut self) -> Result<Option<Event>, crate::source::SourceError> {
            let event = self.inner.next_event()?;
            if event.is_none() {
                self.flag.store(true, Ordering::Relaxed);
            }
            Ok(event)
        }

        fn name(&self) -> &str {
            self.inner.name()
        }
    }

    #[test]
    fn test_shutdown_flushes_buffered_bar_as_partial() {
        let mut pipe = pipeline(&basic_config());
        let flag = pipe.shutdown_flag();
        pipe.register_source(Box::new(ShutdownAfter {
            inner: VecSource::new("bars", vec![summary_event(45_905.0, 1, 6500.0)]),
            flag,
        }));

        let (summary, out) = pipe.run().unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.events_processed, 1);
        // The buffered bar is flushed as partial, never silently dropped.
        assert_eq!(summary.bars_partial, 1);
        assert_eq!(summary.decisions_written, 1);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\"partial\":true"));
    }

    #[test]
    fn test_end_of_stream_flushes_open_bar() {
        let mut pipe = pipeline(&basic_config());
        pipe.register_source(Box::new(VecSource::new(
            "bars",
            vec![
                summary_event(45_905.0, 1, 6500.0),
                footprint_event(45_905.0, 1, 50.0),
            ],
        )));
        let (summary, out) = pipe.run().unwrap();
        // Only one bar ever seen; it finalizes at end of stream, complete.
        assert_eq!(summary.decisions_written, 1);
        assert_eq!(summary.bars_completed, 1);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\"partial\":false"));
    }

    #[test]
    fn test_passthrough_interleaves_originals() {
        let mut config = basic_config();
        config.output.passthrough = true;
        let mut pipe = pipeline(&config);
        pipe.register_source(Box::new(VecSource::new(
            "bars",
            vec![
                summary_event(45_905.0, 1, 6500.0),
                summary_event(45_905.0 + 60.0 * SEC, 2, 6501.0),
            ],
        )));
        let (summary, out) = pipe.run().unwrap();
        assert_eq!(summary.passthrough_written, 2);
        let text = String::from_utf8(out).unwrap();
        assert!(text.lines().any(|l| l.contains("\"type\":\"basedata\"")));
    }

    #[test]
    fn test_decision_timestamps_tracked() {
        let mut pipe = pipeline(&basic_config());
        let base = 45_905.0;
        pipe.register_source(Box::new(VecSource::new(
            "bars",
            vec![
                summary_event(base, 1, 6500.0),
                summary_event(base + 60.0 * SEC, 2, 6501.0),
            ],
        )));
        let (summary, _) = pipe.run().unwrap();
        assert_eq!(summary.first_decision_t, Some(base));
        assert_eq!(summary.last_decision_t, Some(base + 60.0 * SEC));
    }
}
