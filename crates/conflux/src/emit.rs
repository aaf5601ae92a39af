//! Unified output stream.
//!
//! Derived metrics and decisions are appended as JSONL events stamped with
//! the originating bar's timestamp, so downstream consumers that re-merge
//! the output with other logs keep global time order. Emission is
//! append-only and exactly once per finalized bar. Original events can
//! optionally be passed through as they flow.

use std::collections::BTreeMap;
use std::io::{self, Write};

use serde::Serialize;

use conflux_common::{BarIndex, ChartId, Event};

use crate::decide::Decision;
use crate::score::ScoreBreakdown;
use crate::sync::CompositeBar;

#[derive(Serialize)]
struct DerivedRecord<'a> {
    t: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    sym: Option<&'a str>,
    #[serde(rename = "type")]
    kind: &'static str,
    i: BarIndex,
    chart: ChartId,
    delta_ratio: f64,
    pressure_bullish: u8,
    pressure_bearish: u8,
    partial: bool,
}

#[derive(Serialize)]
struct DecisionRecord<'a> {
    t: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    sym: Option<&'a str>,
    #[serde(rename = "type")]
    kind: &'static str,
    i: BarIndex,
    chart: ChartId,
    action: &'static str,
    score: f64,
    vol_factor: f64,
    partial: bool,
    gated: bool,
    /// Per-feature weighted contributions, for audit.
    components: BTreeMap<&'a str, f64>,
    /// Field groups the bar inherited instead of receiving fresh.
    carried_forward: Vec<&'a str>,
}

/// Serializes derived records back into the shared event stream.
pub struct UnifiedEmitter<W: Write> {
    out: W,
    passthrough: bool,
    passthrough_written: u64,
    derived_written: u64,
    decisions_written: u64,
}

impl<W: Write> UnifiedEmitter<W> {
    pub fn new(out: W, passthrough: bool) -> Self {
        Self {
            out,
            passthrough,
            passthrough_written: 0,
            derived_written: 0,
            decisions_written: 0,
        }
    }

    /// Copy one original event to the output, when passthrough is enabled.
    pub fn passthrough_event(&mut self, event: &Event) -> io::Result<()> {
        if !self.passthrough {
            return Ok(());
        }
        writeln!(self.out, "{}", event.to_wire_value())?;
        self.passthrough_written += 1;
        Ok(())
    }

    /// Append this bar's derived metrics (when present) and its decision.
    /// Called exactly once per finalized bar.
    pub fn emit_bar(
        &mut self,
        bar: &CompositeBar,
        breakdown: &ScoreBreakdown,
        decision: &Decision,
    ) -> io::Result<()> {
        if let Some(derived) = &bar.derived {
            let record = DerivedRecord {
                t: bar.t,
                sym: bar.sym.as_deref(),
                kind: "derived_metrics",
                i: bar.index,
                chart: bar.chart,
                delta_ratio: derived.delta_ratio,
                pressure_bullish: derived.pressure_bullish as u8,
                pressure_bearish: derived.pressure_bearish as u8,
                partial: bar.partial,
            };
            writeln!(self.out, "{}", serde_json::to_string(&record)?)?;
            self.derived_written += 1;
        }

        let components: BTreeMap<&str, f64> = breakdown
            .components
            .iter()
            .map(|c| (c.feature.as_str(), c.contribution))
            .collect();
        let record = DecisionRecord {
            t: bar.t,
            sym: bar.sym.as_deref(),
            kind: "decision",
            i: bar.index,
            chart: bar.chart,
            action: decision.action.as_str(),
            score: decision.score,
            vol_factor: breakdown.vol_factor,
            partial: decision.partial,
            gated: decision.gated,
            components,
            carried_forward: bar.carried_forward.iter().copied().collect(),
        };
        writeln!(self.out, "{}", serde_json::to_string(&record)?)?;
        self.decisions_written += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn decisions_written(&self) -> u64 {
        self.decisions_written
    }

    pub fn derived_written(&self) -> u64 {
        self.derived_written
    }

    pub fn passthrough_written(&self) -> u64 {
        self.passthrough_written
    }

    /// Consume the emitter, returning the underlying writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::DerivedMetrics;
    use crate::score::ConfluenceScorer;
    use crate::DecisionEngine;
    use conflux_common::{BarSummary, Payload};

    fn scored_bar() -> (CompositeBar, ScoreBreakdown, Decision) {
        let mut bar = CompositeBar::new(3, 42, 45_905.5);
        bar.sym = Some("ESZ5".into());
        bar.bar = Some(BarSummary {
            o: 6500.0,
            h: 6502.0,
            l: 6498.0,
            c: 6501.0,
            v: 900.0,
            bidvol: None,
            askvol: None,
        });
        bar.derived = Some(DerivedMetrics {
            delta_ratio: 0.4,
            pressure_bullish: true,
            pressure_bearish: false,
        });
        let breakdown = ConfluenceScorer::default().score(&bar);
        let decision = DecisionEngine::new(0.6, 0.2, None)
            .unwrap()
            .decide(&bar, breakdown.score);
        (bar, breakdown, decision)
    }

    #[test]
    fn test_emits_derived_then_decision() {
        let (bar, breakdown, decision) = scored_bar();
        let mut emitter = UnifiedEmitter::new(Vec::new(), false);
        emitter.emit_bar(&bar, &breakdown, &decision).unwrap();

        let output = String::from_utf8(emitter.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);

        let derived: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(derived["type"], "derived_metrics");
        assert_eq!(derived["i"], 42);
        assert_eq!(derived["delta_ratio"], 0.4);
        assert_eq!(derived["pressure_bullish"], 1);

        let decision_line: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(decision_line["type"], "decision");
        assert_eq!(decision_line["t"], 45_905.5);
        assert_eq!(decision_line["chart"], 3);
        assert!(decision_line["components"].is_object());
    }

    #[test]
    fn test_bar_without_derived_emits_only_decision() {
        let (mut bar, breakdown, decision) = scored_bar();
        bar.derived = None;
        let mut emitter = UnifiedEmitter::new(Vec::new(), false);
        emitter.emit_bar(&bar, &breakdown, &decision).unwrap();
        assert_eq!(emitter.derived_written(), 0);
        assert_eq!(emitter.decisions_written(), 1);
    }

    #[test]
    fn test_passthrough_toggle() {
        let event = Event::new(45_905.5, 3, None, Payload::VolIndex { last: 18.0 });

        let mut off = UnifiedEmitter::new(Vec::new(), false);
        off.passthrough_event(&event).unwrap();
        assert!(off.into_inner().is_empty());

        let mut on = UnifiedEmitter::new(Vec::new(), true);
        on.passthrough_event(&event).unwrap();
        assert_eq!(on.passthrough_written(), 1);
        let output = String::from_utf8(on.into_inner()).unwrap();
        assert!(output.contains("\"type\":\"vix\""));
    }

    #[test]
    fn test_output_is_deterministic() {
        let render = || {
            let (bar, breakdown, decision) = scored_bar();
            let mut emitter = UnifiedEmitter::new(Vec::new(), false);
            emitter.emit_bar(&bar, &breakdown, &decision).unwrap();
            String::from_utf8(emitter.into_inner()).unwrap()
        };
        assert_eq!(render(), render());
    }

    #[test]
    fn test_partial_tag_propagates() {
        let (mut bar, breakdown, _) = scored_bar();
        bar.partial = true;
        let decision = DecisionEngine::new(0.6, 0.2, None)
            .unwrap()
            .decide(&bar, breakdown.score);

        let mut emitter = UnifiedEmitter::new(Vec::new(), false);
        emitter.emit_bar(&bar, &breakdown, &decision).unwrap();
        let output = String::from_utf8(emitter.into_inner()).unwrap();
        for line in output.lines() {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(value["partial"], true);
        }
    }
}
