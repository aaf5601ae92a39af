//! Wire-level event model.
//!
//! Each producer appends one JSON object per line to its log. A line decodes
//! independently into an [`Event`]; decode failures are a per-line skip at
//! the source, never a stream failure. Events are immutable once parsed.
//!
//! Field names follow the chart dumper's output, e.g.
//! `{"t":45905.576238,"sym":"ESZ5","type":"basedata","i":4231,"o":6534.25,...}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{BarIndex, ChartId, EventKind};

/// Errors from decoding a single log line.
#[derive(Debug, Error)]
pub enum EventParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("line is not a JSON object")]
    NotAnObject,

    #[error("missing or non-numeric `{0}` field")]
    MissingField(&'static str),
}

/// Per-bar OHLCV summary (`basedata`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarSummary {
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bidvol: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub askvol: Option<f64>,
}

/// Volume-weighted average price with up to two band pairs (`vwap`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VwapBands {
    /// The VWAP value itself.
    pub v: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up1: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dn1: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up2: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dn2: Option<f64>,
}

impl VwapBands {
    /// Repair swapped band pairs: each `up` must sit at or above its `dn`.
    /// Producers occasionally write them inverted after a study reload.
    pub fn repaired(mut self) -> Self {
        for (up, dn) in [
            (&mut self.up1, &mut self.dn1),
            (&mut self.up2, &mut self.dn2),
        ] {
            if let (Some(u), Some(d)) = (*up, *dn) {
                if u < d {
                    *up = Some(d);
                    *dn = Some(u);
                }
            }
        }
        self
    }
}

/// Volume value area (`vva`): current session VAH/VAL/VPOC plus the
/// previous session's triple when the producer exports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueArea {
    pub vah: f64,
    pub val: f64,
    pub vpoc: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvah: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pval: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ppoc: Option<f64>,
}

impl ValueArea {
    /// Restore the `vah >= vpoc >= val` invariant when all three are
    /// positive but arrived out of order.
    pub fn repaired(mut self) -> Self {
        if self.vah > 0.0 && self.vpoc > 0.0 && self.val > 0.0 {
            let mut ordered = [self.vah, self.vpoc, self.val];
            ordered.sort_by(|a, b| b.total_cmp(a));
            [self.vah, self.vpoc, self.val] = ordered;
        }
        self
    }

    /// Width of the value area, when non-degenerate.
    pub fn width(&self) -> Option<f64> {
        let w = self.vah - self.val;
        (w > 0.0).then_some(w)
    }
}

/// Order-flow footprint for one bar (`nbcv_footprint`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Footprint {
    pub ask_volume: f64,
    pub bid_volume: f64,
    /// Signed aggressor delta (`ask_volume - bid_volume` at the producer).
    pub delta: f64,
    pub total_volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trades: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cumulative_delta: Option<f64>,
}

/// Producer-computed order-flow ratios (`nbcv_metrics`). Kept for
/// passthrough and cross-checks; the engine derives its own metrics from
/// the raw footprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowMetrics {
    pub delta_ratio: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid_ask_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask_bid_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure_bullish: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure_bearish: Option<f64>,
}

/// Externally computed key price level (`menthorq_level`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyLevel {
    pub level_type: String,
    pub price: f64,
    /// Producer subgraph index, used to distinguish levels of the same type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sg: Option<i64>,
}

impl KeyLevel {
    /// Stable identity for carry-forward replacement.
    pub fn identity(&self) -> (String, Option<i64>) {
        (self.level_type.clone(), self.sg)
    }
}

/// Typed payload, one variant per input kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    BarSummary(BarSummary),
    Vwap(VwapBands),
    ValueArea(ValueArea),
    VolIndex { last: f64 },
    Footprint(Footprint),
    FlowMetrics(FlowMetrics),
    KeyLevel(KeyLevel),
}

impl Payload {
    /// The kind this payload belongs to.
    pub fn kind(&self) -> EventKind {
        match self {
            Payload::BarSummary(_) => EventKind::BarSummary,
            Payload::Vwap(_) => EventKind::Vwap,
            Payload::ValueArea(_) => EventKind::ValueArea,
            Payload::VolIndex { .. } => EventKind::VolIndex,
            Payload::Footprint(_) => EventKind::Footprint,
            Payload::FlowMetrics(_) => EventKind::FlowMetrics,
            Payload::KeyLevel(_) => EventKind::KeyLevel,
        }
    }
}

/// One telemetry event, read-only to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Day-fraction timestamp (see [`crate::time`]).
    pub t: f64,
    /// Instrument symbol, when the producer includes it.
    pub sym: Option<String>,
    /// Originating chart, when the producer includes it.
    pub chart: Option<ChartId>,
    /// Bar index within the chart; absent on ambient kinds.
    pub bar_index: Option<BarIndex>,
    pub payload: Payload,
}

impl Event {
    /// Construct an event without a symbol (test and synthetic use).
    pub fn new(t: f64, chart: ChartId, bar_index: Option<BarIndex>, payload: Payload) -> Self {
        Self {
            t,
            sym: None,
            chart: Some(chart),
            bar_index,
            payload,
        }
    }

    #[inline]
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Decode one log line.
    ///
    /// Returns `Ok(None)` for a structurally valid line whose kind is not
    /// in the closed set (dropped, counted by the caller); `Err` for a
    /// malformed line (skipped, counted by the caller).
    pub fn parse_line(line: &str) -> Result<Option<Event>, EventParseError> {
        let value: Value = serde_json::from_str(line)?;
        let obj = value.as_object().ok_or(EventParseError::NotAnObject)?;

        let t = obj
            .get("t")
            .and_then(Value::as_f64)
            .ok_or(EventParseError::MissingField("t"))?;
        let kind_str = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(EventParseError::MissingField("type"))?;

        let Some(kind) = EventKind::from_wire(kind_str) else {
            return Ok(None);
        };

        let sym = obj.get("sym").and_then(Value::as_str).map(str::to_owned);
        let chart = obj.get("chart").and_then(Value::as_i64).map(|c| c as ChartId);
        let bar_index = obj.get("i").and_then(Value::as_i64);

        let payload = match kind {
            EventKind::BarSummary => Payload::BarSummary(from_obj(obj)?),
            EventKind::Vwap => Payload::Vwap(from_obj::<VwapBands>(obj)?.repaired()),
            EventKind::ValueArea => Payload::ValueArea(from_obj::<ValueArea>(obj)?.repaired()),
            EventKind::VolIndex => Payload::VolIndex {
                last: obj
                    .get("last")
                    .and_then(Value::as_f64)
                    .ok_or(EventParseError::MissingField("last"))?,
            },
            EventKind::Footprint => Payload::Footprint(from_obj(obj)?),
            EventKind::FlowMetrics => Payload::FlowMetrics(from_obj(obj)?),
            EventKind::KeyLevel => Payload::KeyLevel(from_obj(obj)?),
            // Output-only kinds re-entering the engine are passthrough noise.
            EventKind::DerivedMetrics | EventKind::Decision => return Ok(None),
        };

        Ok(Some(Event {
            t,
            sym,
            chart,
            bar_index,
            payload,
        }))
    }

    /// Re-serialize in the producers' wire layout, for passthrough output.
    pub fn to_wire_value(&self) -> Value {
        let mut out = Map::new();
        out.insert("t".into(), json_f64(self.t));
        if let Some(sym) = &self.sym {
            out.insert("sym".into(), Value::String(sym.clone()));
        }
        out.insert("type".into(), Value::String(self.kind().as_str().into()));
        if let Some(i) = self.bar_index {
            out.insert("i".into(), Value::from(i));
        }
        if let Some(chart) = self.chart {
            out.insert("chart".into(), Value::from(chart));
        }

        let payload_value = match &self.payload {
            Payload::BarSummary(p) => serde_json::to_value(p),
            Payload::Vwap(p) => serde_json::to_value(p),
            Payload::ValueArea(p) => serde_json::to_value(p),
            Payload::VolIndex { last } => Ok(Value::Object({
                let mut m = Map::new();
                m.insert("last".into(), json_f64(*last));
                m
            })),
            Payload::Footprint(p) => serde_json::to_value(p),
            Payload::FlowMetrics(p) => serde_json::to_value(p),
            Payload::KeyLevel(p) => serde_json::to_value(p),
        }
        .expect("payload structs serialize infallibly");

        if let Value::Object(fields) = payload_value {
            for (k, v) in fields {
                out.insert(k, v);
            }
        }
        Value::Object(out)
    }
}

fn from_obj<T: for<'de> Deserialize<'de>>(obj: &Map<String, Value>) -> Result<T, EventParseError> {
    Ok(serde_json::from_value(Value::Object(obj.clone()))?)
}

fn json_f64(v: f64) -> Value {
    serde_json::Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basedata_line() {
        let line = r#"{"t":45905.576238,"sym":"ESZ5","type":"basedata","i":4231,"o":6534.25,"h":6536.0,"l":6533.5,"c":6535.75,"v":1843,"bidvol":820,"askvol":1023,"chart":3}"#;
        let event = Event::parse_line(line).unwrap().unwrap();

        assert_eq!(event.kind(), EventKind::BarSummary);
        assert_eq!(event.sym.as_deref(), Some("ESZ5"));
        assert_eq!(event.chart, Some(3));
        assert_eq!(event.bar_index, Some(4231));
        match &event.payload {
            Payload::BarSummary(b) => {
                assert_eq!(b.c, 6535.75);
                assert_eq!(b.v, 1843.0);
                assert_eq!(b.askvol, Some(1023.0));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_parse_footprint_line() {
        let line = r#"{"t":45905.576238,"sym":"ESZ5","type":"nbcv_footprint","i":4231,"ask_volume":1023,"bid_volume":820,"delta":203,"trades":312,"cumulative_delta":1490,"total_volume":1843,"chart":3}"#;
        let event = Event::parse_line(line).unwrap().unwrap();
        match &event.payload {
            Payload::Footprint(fp) => {
                assert_eq!(fp.delta, 203.0);
                assert_eq!(fp.total_volume, 1843.0);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_parse_vix_line() {
        let line = r#"{"t":45905.5,"type":"vix","i":120,"last":17.44,"mode":1,"chart":8}"#;
        let event = Event::parse_line(line).unwrap().unwrap();
        assert_eq!(event.kind(), EventKind::VolIndex);
        assert_eq!(event.chart, Some(8));
        match event.payload {
            Payload::VolIndex { last } => assert_eq!(last, 17.44),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_kind_is_dropped_not_error() {
        let line = r#"{"t":45905.5,"type":"depth","side":"BID","lvl":1,"price":6534.0,"size":12}"#;
        assert!(Event::parse_line(line).unwrap().is_none());
    }

    #[test]
    fn test_parse_malformed_lines() {
        assert!(Event::parse_line("not json").is_err());
        assert!(Event::parse_line("[1,2,3]").is_err());
        // Missing t
        assert!(Event::parse_line(r#"{"type":"vix","last":17.0}"#).is_err());
        // Missing mandatory payload field
        assert!(Event::parse_line(r#"{"t":1.0,"type":"basedata","i":1,"o":1.0}"#).is_err());
    }

    #[test]
    fn test_vwap_band_repair() {
        let line = r#"{"t":45905.5,"sym":"ESZ5","type":"vwap","i":10,"v":6530.0,"up1":6528.0,"dn1":6532.0}"#;
        let event = Event::parse_line(line).unwrap().unwrap();
        match event.payload {
            Payload::Vwap(v) => {
                assert_eq!(v.up1, Some(6532.0));
                assert_eq!(v.dn1, Some(6528.0));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_value_area_repair() {
        let va = ValueArea {
            vah: 6520.0,
            val: 6540.0,
            vpoc: 6530.0,
            pvah: None,
            pval: None,
            ppoc: None,
        }
        .repaired();
        assert_eq!(va.vah, 6540.0);
        assert_eq!(va.vpoc, 6530.0);
        assert_eq!(va.val, 6520.0);
    }

    #[test]
    fn test_value_area_repair_skips_non_positive() {
        let va = ValueArea {
            vah: 0.0,
            val: 6540.0,
            vpoc: 6530.0,
            pvah: None,
            pval: None,
            ppoc: None,
        }
        .repaired();
        // Zero VAH means the study has not populated yet; leave untouched.
        assert_eq!(va.vah, 0.0);
        assert_eq!(va.val, 6540.0);
    }

    #[test]
    fn test_value_area_width() {
        let va = ValueArea {
            vah: 6540.0,
            val: 6520.0,
            vpoc: 6530.0,
            pvah: None,
            pval: None,
            ppoc: None,
        };
        assert_eq!(va.width(), Some(20.0));

        let flat = ValueArea { vah: 6530.0, val: 6530.0, ..va };
        assert_eq!(flat.width(), None);
    }

    #[test]
    fn test_wire_roundtrip() {
        let line = r#"{"t":45905.576238,"sym":"ESZ5","type":"vva","i":4231,"vah":6540.0,"val":6520.0,"vpoc":6530.0,"pvah":6538.0,"pval":6518.0,"ppoc":6528.0,"chart":3}"#;
        let event = Event::parse_line(line).unwrap().unwrap();
        let wire = event.to_wire_value();
        let reparsed = Event::parse_line(&wire.to_string()).unwrap().unwrap();
        assert_eq!(event, reparsed);
    }

    #[test]
    fn test_wire_value_is_deterministic() {
        let event = Event::new(
            45905.5,
            3,
            Some(7),
            Payload::Footprint(Footprint {
                ask_volume: 100.0,
                bid_volume: 60.0,
                delta: 40.0,
                total_volume: 160.0,
                trades: None,
                cumulative_delta: None,
            }),
        );
        assert_eq!(event.to_wire_value().to_string(), event.to_wire_value().to_string());
    }
}
