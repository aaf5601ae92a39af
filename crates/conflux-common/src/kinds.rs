//! Event kind and action vocabularies.

use serde::{Deserialize, Serialize};

/// The closed set of event kinds understood by the engine.
///
/// The first seven are produced by the chart dumpers; `DerivedMetrics` and
/// `Decision` exist only on the output stream. Wire names match the `type`
/// discriminator written by the producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Per-bar OHLCV summary (`basedata`).
    #[serde(rename = "basedata")]
    BarSummary,
    /// Volume-weighted average price with bands (`vwap`).
    #[serde(rename = "vwap")]
    Vwap,
    /// Volume value area: VAH/VAL/VPOC (`vva`).
    #[serde(rename = "vva")]
    ValueArea,
    /// Volatility index reading (`vix`).
    #[serde(rename = "vix")]
    VolIndex,
    /// Order-flow footprint: ask/bid volume and delta (`nbcv_footprint`).
    #[serde(rename = "nbcv_footprint")]
    Footprint,
    /// Producer-computed order-flow ratios (`nbcv_metrics`).
    #[serde(rename = "nbcv_metrics")]
    FlowMetrics,
    /// Externally computed key price level (`menthorq_level`).
    #[serde(rename = "menthorq_level")]
    KeyLevel,
    /// Engine-derived order-flow metrics (output only).
    #[serde(rename = "derived_metrics")]
    DerivedMetrics,
    /// Scored trading decision (output only).
    #[serde(rename = "decision")]
    Decision,
}

impl EventKind {
    /// Parse a wire `type` discriminator. Returns `None` for unknown kinds,
    /// which are dropped at the merge boundary.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "basedata" => Some(EventKind::BarSummary),
            "vwap" => Some(EventKind::Vwap),
            "vva" => Some(EventKind::ValueArea),
            "vix" => Some(EventKind::VolIndex),
            "nbcv_footprint" => Some(EventKind::Footprint),
            "nbcv_metrics" => Some(EventKind::FlowMetrics),
            // Older dumper builds wrote "menthorq" for level lines.
            "menthorq_level" | "menthorq" => Some(EventKind::KeyLevel),
            "derived_metrics" => Some(EventKind::DerivedMetrics),
            "decision" => Some(EventKind::Decision),
            _ => None,
        }
    }

    /// Wire name written on the output stream.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::BarSummary => "basedata",
            EventKind::Vwap => "vwap",
            EventKind::ValueArea => "vva",
            EventKind::VolIndex => "vix",
            EventKind::Footprint => "nbcv_footprint",
            EventKind::FlowMetrics => "nbcv_metrics",
            EventKind::KeyLevel => "menthorq_level",
            EventKind::DerivedMetrics => "derived_metrics",
            EventKind::Decision => "decision",
        }
    }

    /// Ambient kinds carry chart-global state (the volatility index lives on
    /// its own chart, key levels apply to the instrument, not one bar) and
    /// bypass the target-chart filter.
    pub fn is_ambient(&self) -> bool {
        matches!(self, EventKind::VolIndex | EventKind::KeyLevel)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Discrete trading action emitted by the decision engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Long,
    Short,
    #[default]
    Flat,
}

impl Action {
    /// Returns the display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Long => "LONG",
            Action::Short => "SHORT",
            Action::Flat => "FLAT",
        }
    }

    /// Check if this action holds a position.
    #[inline]
    pub fn is_positioned(&self) -> bool {
        !matches!(self, Action::Flat)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_roundtrip() {
        for kind in [
            EventKind::BarSummary,
            EventKind::Vwap,
            EventKind::ValueArea,
            EventKind::VolIndex,
            EventKind::Footprint,
            EventKind::FlowMetrics,
            EventKind::KeyLevel,
            EventKind::DerivedMetrics,
            EventKind::Decision,
        ] {
            assert_eq!(EventKind::from_wire(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_kind_legacy_alias() {
        assert_eq!(EventKind::from_wire("menthorq"), Some(EventKind::KeyLevel));
    }

    #[test]
    fn test_kind_unknown() {
        assert_eq!(EventKind::from_wire("depth"), None);
        assert_eq!(EventKind::from_wire(""), None);
    }

    #[test]
    fn test_kind_serde_matches_wire() {
        let json = serde_json::to_string(&EventKind::Footprint).unwrap();
        assert_eq!(json, "\"nbcv_footprint\"");
        let parsed: EventKind = serde_json::from_str("\"vva\"").unwrap();
        assert_eq!(parsed, EventKind::ValueArea);
    }

    #[test]
    fn test_ambient_kinds() {
        assert!(EventKind::VolIndex.is_ambient());
        assert!(EventKind::KeyLevel.is_ambient());
        assert!(!EventKind::BarSummary.is_ambient());
        assert!(!EventKind::Footprint.is_ambient());
    }

    #[test]
    fn test_action_display() {
        assert_eq!(format!("{}", Action::Long), "LONG");
        assert_eq!(format!("{}", Action::Short), "SHORT");
        assert_eq!(format!("{}", Action::Flat), "FLAT");
    }

    #[test]
    fn test_action_positioned() {
        assert!(Action::Long.is_positioned());
        assert!(Action::Short.is_positioned());
        assert!(!Action::Flat.is_positioned());
    }

    #[test]
    fn test_action_default_is_flat() {
        assert_eq!(Action::default(), Action::Flat);
    }
}
