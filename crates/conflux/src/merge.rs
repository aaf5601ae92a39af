//! K-way merge of event sources into one globally time-ordered stream.
//!
//! The merger holds exactly one buffered event per source in a min-heap,
//! so memory is O(N) in the number of sources and independent of log
//! length. Output timestamps are non-decreasing; ties are broken by the
//! order sources were registered, which makes runs reproducible.
//!
//! Filtering happens before the heap: kinds outside the allow-list are
//! dropped, and events whose chart does not match the configured target
//! are dropped unless the kind is ambient (volatility index, key levels).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, BTreeSet};

use conflux_common::{ChartId, Event, EventKind};

use crate::source::{EventSource, SourceError};

/// Heap entry: one buffered event plus its source's registration index.
struct HeapEntry {
    event: Event,
    source: usize,
}

impl HeapEntry {
    fn key(&self) -> (f64, usize) {
        (self.event.t, self.source)
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the BinaryHeap pops the earliest timestamp, and on
        // ties the lowest registration index.
        let (t_a, s_a) = self.key();
        let (t_b, s_b) = other.key();
        t_b.total_cmp(&t_a).then_with(|| s_b.cmp(&s_a))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Drop counters kept for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeCounters {
    /// Events whose kind was not in the allow-list.
    pub dropped_kind: u64,
    /// Events for a chart other than the configured target.
    pub dropped_chart: u64,
    /// Events emitted downstream.
    pub emitted: u64,
}

/// Merges N ordered event sources into one ordered stream.
pub struct StreamMerger {
    sources: Vec<Box<dyn EventSource>>,
    heap: BinaryHeap<HeapEntry>,
    allow: BTreeSet<EventKind>,
    target_chart: ChartId,
    primed: bool,
    counters: MergeCounters,
}

impl StreamMerger {
    pub fn new(allow: BTreeSet<EventKind>, target_chart: ChartId) -> Self {
        Self {
            sources: Vec::new(),
            heap: BinaryHeap::new(),
            allow,
            target_chart,
            primed: false,
            counters: MergeCounters::default(),
        }
    }

    /// Register a source. Registration order defines tie-break priority.
    pub fn register(&mut self, source: Box<dyn EventSource>) {
        self.sources.push(source);
    }

    /// Number of registered sources.
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    fn admits(&mut self, event: &Event) -> bool {
        if !self.allow.contains(&event.kind()) {
            self.counters.dropped_kind += 1;
            return false;
        }
        if !event.kind().is_ambient() && event.chart != Some(self.target_chart) {
            self.counters.dropped_chart += 1;
            return false;
        }
        true
    }

    /// Pull the next admissible event from one source into the heap.
    fn refill(&mut self, source_idx: usize) -> Result<(), SourceError> {
        while let Some(event) = self.sources[source_idx].next_event()? {
            if self.admits(&event) {
                self.heap.push(HeapEntry {
                    event,
                    source: source_idx,
                });
                break;
            }
        }
        Ok(())
    }

    /// Emit the global minimum, refilling from the source it came from.
    pub fn next(&mut self) -> Result<Option<Event>, SourceError> {
        if !self.primed {
            for idx in 0..self.sources.len() {
                self.refill(idx)?;
            }
            self.primed = true;
        }

        let Some(entry) = self.heap.pop() else {
            return Ok(None);
        };
        self.refill(entry.source)?;
        self.counters.emitted += 1;
        Ok(Some(entry.event))
    }

    /// The earliest timestamp still buffered across all sources: no event
    /// older than this can be emitted. `None` once every source is drained.
    pub fn watermark(&self) -> Option<f64> {
        self.heap.peek().map(|entry| entry.event.t)
    }

    pub fn counters(&self) -> MergeCounters {
        self.counters
    }

    /// Total malformed lines skipped across all sources.
    pub fn lines_skipped(&self) -> u64 {
        self.sources.iter().map(|s| s.lines_skipped()).sum()
    }

    /// Total unknown-kind drops across all sources.
    pub fn unknown_kind_drops(&self) -> u64 {
        self.sources.iter().map(|s| s.unknown_kind_drops()).sum()
    }
}
