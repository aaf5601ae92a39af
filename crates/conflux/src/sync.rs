//! Bar synchronization: grouping the merged stream into composite bars.
//!
//! Events arrive globally time-ordered but heterogeneous; the synchronizer
//! routes each one into the composite record for its `(chart, bar index)`,
//! creating records lazily and mutating them monotonically. Slow-changing
//! field groups (value area, vwap bands) are carried forward from a small
//! rolling cache of recently completed bars; chart-global state (key
//! levels, volatility index) is carried with a TTL, mirroring how the
//! upstream unifier keeps levels alive between exports.
//!
//! A bar finalizes when an event for a strictly higher index arrives on
//! the same chart, when the watermark passes its timestamp by more than
//! the configured bound, at end of stream, or on shutdown. Force-finalized
//! incomplete bars are tagged partial and still flow downstream.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use tracing::{debug, warn};

use conflux_common::time::to_epoch_seconds;
use conflux_common::{
    BarIndex, BarSummary, ChartId, Event, EventKind, FlowMetrics, Footprint, KeyLevel, Payload,
    ValueArea, VwapBands,
};

use crate::features::DerivedMetrics;

/// Tunables for the synchronizer.
#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// How many recently completed bars feed the carry-forward cache.
    pub carry_depth: usize,
    /// Key levels older than this (seconds) are not carried into new bars.
    pub level_ttl_secs: f64,
    /// Volatility readings older than this (seconds) are not carried.
    pub vol_ttl_secs: f64,
    /// Watermark lead (seconds) after which an open bar is force-flushed.
    pub bar_timeout_secs: f64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            carry_depth: 3,
            level_ttl_secs: 900.0,
            vol_ttl_secs: 120.0,
            bar_timeout_secs: 120.0,
        }
    }
}

/// Time-aligned composite record for one `(chart, bar index)`.
#[derive(Debug, Clone)]
pub struct CompositeBar {
    pub chart: ChartId,
    pub index: BarIndex,
    /// Resolved bar timestamp: the bar-summary event's `t` when present,
    /// else the minimum `t` observed for this index.
    pub t: f64,
    pub sym: Option<String>,
    pub bar: Option<BarSummary>,
    pub vwap: Option<VwapBands>,
    pub value_area: Option<ValueArea>,
    pub vol_index: Option<f64>,
    pub footprint: Option<Footprint>,
    pub flow: Option<FlowMetrics>,
    /// Key levels valid at this bar (attached at finalization).
    pub key_levels: Vec<KeyLevel>,
    /// Engine-derived metrics, attached after finalization.
    pub derived: Option<DerivedMetrics>,
    /// Field groups inherited from the carry-forward cache rather than
    /// freshly updated this bar.
    pub carried_forward: BTreeSet<&'static str>,
    /// Set when the bar was finalized before reaching completeness.
    pub partial: bool,

    fresh: BTreeSet<EventKind>,
    summary_t: Option<f64>,
    min_t: f64,
}

impl CompositeBar {
    /// An empty composite bar; fields are populated by the synchronizer
    /// (or directly in tests and synthetic replays).
    pub fn new(chart: ChartId, index: BarIndex, t: f64) -> Self {
        Self {
            chart,
            index,
            t,
            sym: None,
            bar: None,
            vwap: None,
            value_area: None,
            vol_index: None,
            footprint: None,
            flow: None,
            key_levels: Vec::new(),
            derived: None,
            carried_forward: BTreeSet::new(),
            partial: false,
            fresh: BTreeSet::new(),
            summary_t: None,
            min_t: t,
        }
    }

    /// Kinds that contributed fresh data to this bar.
    pub fn fresh_kinds(&self) -> &BTreeSet<EventKind> {
        &self.fresh
    }

    /// A bar is complete once every required kind has contributed fresh
    /// data. The fresh set only grows, so completeness is monotonic.
    pub fn is_complete(&self, required: &BTreeSet<EventKind>) -> bool {
        required.iter().all(|kind| self.fresh.contains(kind))
    }

    /// Closing price, when the bar summary is present.
    pub fn close(&self) -> Option<f64> {
        self.bar.as_ref().map(|b| b.c)
    }

    /// Distance from the close to the nearest attached key level.
    pub fn nearest_level_distance(&self) -> Option<f64> {
        let close = self.close()?;
        self.key_levels
            .iter()
            .map(|level| (close - level.price).abs())
            .min_by(f64::total_cmp)
    }

    fn resolve_timestamp(&mut self) {
        self.t = self.summary_t.unwrap_or(self.min_t);
    }
}

/// Carry-forward snapshot taken from one completed bar (fresh fields only,
/// so a value can propagate at most `carry_depth` bars).
#[derive(Debug, Clone, Default)]
struct CarrySnapshot {
    value_area: Option<ValueArea>,
    vwap: Option<VwapBands>,
}

/// Counters kept for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounters {
    /// Bar-scoped events without a bar index.
    pub missing_index: u64,
    /// Events for an already-finalized bar index.
    pub late_events: u64,
    /// Conflicting bar-summary timestamps for one index.
    pub timestamp_conflicts: u64,
    pub bars_completed: u64,
    pub bars_partial: u64,
}

/// Groups merged events into composite bars for one chart.
///
/// Each instance privately owns its chart's bar cache; no shared state.
pub struct BarSynchronizer {
    chart: ChartId,
    required: BTreeSet<EventKind>,
    options: SyncOptions,
    open: BTreeMap<BarIndex, CompositeBar>,
    carry: VecDeque<CarrySnapshot>,
    ambient_levels: HashMap<(String, Option<i64>), (KeyLevel, f64)>,
    ambient_vol: Option<(f64, f64)>,
    last_finalized: Option<BarIndex>,
    counters: SyncCounters,
}

impl BarSynchronizer {
    pub fn new(chart: ChartId, required: BTreeSet<EventKind>, options: SyncOptions) -> Self {
        Self {
            chart,
            required,
            options,
            open: BTreeMap::new(),
            carry: VecDeque::new(),
            ambient_levels: HashMap::new(),
            ambient_vol: None,
            last_finalized: None,
            counters: SyncCounters::default(),
        }
    }

    pub fn counters(&self) -> SyncCounters {
        self.counters
    }

    /// Route one merged event. Returns bars finalized by index progression,
    /// in ascending index order.
    pub fn route(&mut self, event: &Event) -> Vec<CompositeBar> {
        match &event.payload {
            Payload::VolIndex { last } => {
                self.ambient_vol = Some((*last, event.t));
                if let Some(bar) = self.open.values_mut().next_back() {
                    bar.vol_index = Some(*last);
                    bar.fresh.insert(EventKind::VolIndex);
                    bar.carried_forward.remove("vix");
                }
                Vec::new()
            }
            Payload::KeyLevel(level) => {
                self.ambient_levels
                    .insert(level.identity(), (level.clone(), event.t));
                if let Some(bar) = self.open.values_mut().next_back() {
                    bar.fresh.insert(EventKind::KeyLevel);
                }
                Vec::new()
            }
            _ => self.route_bar_scoped(event),
        }
    }

    fn route_bar_scoped(&mut self, event: &Event) -> Vec<CompositeBar> {
        let Some(index) = event.bar_index else {
            self.counters.missing_index += 1;
            debug!(kind = %event.kind(), t = event.t, "bar-scoped event without index");
            return Vec::new();
        };
        if let Some(finalized) = self.last_finalized {
            if index <= finalized {
                self.counters.late_events += 1;
                debug!(kind = %event.kind(), index, "event for finalized bar dropped");
                return Vec::new();
            }
        }

        // A strictly higher index means no more events can arrive for any
        // lower index on this time-ordered stream.
        let finalized = self.finalize_below(index);

        if !self.open.contains_key(&index) {
            let bar = self.new_bar(index, event.t);
            self.open.insert(index, bar);
        }
        let bar = self.open.get_mut(&index).expect("bar just inserted");

        if bar.sym.is_none() {
            bar.sym = event.sym.clone();
        }
        bar.min_t = bar.min_t.min(event.t);

        match &event.payload {
            Payload::BarSummary(summary) => {
                if let Some(prev) = bar.summary_t {
                    if prev != event.t {
                        self.counters.timestamp_conflicts += 1;
                        warn!(
                            index,
                            prev_t = prev,
                            new_t = event.t,
                            "inconsistent bar-summary timestamps for one index"
                        );
                    }
                }
                bar.summary_t = Some(event.t);
                bar.bar = Some(summary.clone());
                bar.fresh.insert(EventKind::BarSummary);
            }
            Payload::Vwap(vwap) => {
                bar.vwap = Some(vwap.clone());
                bar.fresh.insert(EventKind::Vwap);
                bar.carried_forward.remove("vwap");
            }
            Payload::ValueArea(area) => {
                bar.value_area = Some(area.clone());
                bar.fresh.insert(EventKind::ValueArea);
                bar.carried_forward.remove("vva");
            }
            Payload::Footprint(footprint) => {
                bar.footprint = Some(footprint.clone());
                bar.fresh.insert(EventKind::Footprint);
            }
            Payload::FlowMetrics(metrics) => {
                bar.flow = Some(metrics.clone());
                bar.fresh.insert(EventKind::FlowMetrics);
            }
            Payload::VolIndex { .. } | Payload::KeyLevel(_) => unreachable!("ambient kinds"),
        }
        bar.resolve_timestamp();

        finalized
    }

    /// Open a bar, inheriting carried-forward state.
    fn new_bar(&mut self, index: BarIndex, t: f64) -> CompositeBar {
        let mut bar = CompositeBar::new(self.chart, index, t);

        for snapshot in self.carry.iter().rev() {
            if bar.value_area.is_none() {
                if let Some(area) = &snapshot.value_area {
                    bar.value_area = Some(area.clone());
                    bar.carried_forward.insert("vva");
                }
            }
            if bar.vwap.is_none() {
                if let Some(vwap) = &snapshot.vwap {
                    bar.vwap = Some(vwap.clone());
                    bar.carried_forward.insert("vwap");
                }
            }
        }

        if let Some((value, seen_t)) = self.ambient_vol {
            if to_epoch_seconds(t - seen_t) <= self.options.vol_ttl_secs {
                bar.vol_index = Some(value);
                bar.carried_forward.insert("vix");
            }
        }

        bar
    }

    /// Finalize all open bars with index strictly below `index`.
    fn finalize_below(&mut self, index: BarIndex) -> Vec<CompositeBar> {
        let ready: Vec<BarIndex> = self
            .open
            .range(..index)
            .map(|(idx, _)| *idx)
            .collect();
        ready
            .into_iter()
            .map(|idx| {
                let bar = self.open.remove(&idx).expect("index from range");
                self.seal(bar)
            })
            .collect()
    }

    /// Force-flush open bars the watermark has passed by more than the
    /// configured bound. Call with the merger's current watermark.
    pub fn flush_stale(&mut self, watermark: f64) -> Vec<CompositeBar> {
        let ready: Vec<BarIndex> = self
            .open
            .iter()
            .filter(|(_, bar)| to_epoch_seconds(watermark - bar.t) > self.options.bar_timeout_secs)
            .map(|(idx, _)| *idx)
            .collect();
        ready
            .into_iter()
            .map(|idx| {
                let bar = self.open.remove(&idx).expect("index from scan");
                self.seal(bar)
            })
            .collect()
    }

    /// Flush every open bar (end of stream or shutdown). The buffered bar
    /// is emitted as partial, never silently dropped.
    pub fn flush_all(&mut self) -> Vec<CompositeBar> {
        let open = std::mem::take(&mut self.open);
        open.into_values().map(|bar| self.seal(bar)).collect()
    }

    fn seal(&mut self, mut bar: CompositeBar) -> CompositeBar {
        bar.resolve_timestamp();
        self.attach_levels(&mut bar);
        bar.partial = !bar.is_complete(&self.required);

        if bar.partial {
            self.counters.bars_partial += 1;
        } else {
            self.counters.bars_completed += 1;
            let snapshot = CarrySnapshot {
                value_area: bar
                    .fresh
                    .contains(&EventKind::ValueArea)
                    .then(|| bar.value_area.clone())
                    .flatten(),
                vwap: bar
                    .fresh
                    .contains(&EventKind::Vwap)
                    .then(|| bar.vwap.clone())
                    .flatten(),
            };
            self.carry.push_back(snapshot);
            while self.carry.len() > self.options.carry_depth {
                self.carry.pop_front();
            }
        }

        self.last_finalized = Some(match self.last_finalized {
            Some(prev) => prev.max(bar.index),
            None => bar.index,
        });
        bar
    }

    /// Attach the ambient key levels still valid at this bar's timestamp.
    fn attach_levels(&mut self, bar: &mut CompositeBar) {
        let mut levels: Vec<KeyLevel> = Vec::new();
        for (level, seen_t) in self.ambient_levels.values() {
            if to_epoch_seconds(bar.t - seen_t) <= self.options.level_ttl_secs {
                levels.push(level.clone());
            }
        }
        levels.sort_by(|a, b| {
            a.price
                .total_cmp(&b.price)
                .then_with(|| a.level_type.cmp(&b.level_type))
        });
        if !levels.is_empty() && !bar.fresh.contains(&EventKind::KeyLevel) {
            bar.carried_forward.insert("menthorq");
        }
        bar.key_levels = levels;
    }
}
