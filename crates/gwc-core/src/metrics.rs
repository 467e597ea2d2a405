use crate::wire::MetricFrame;
use serde::{Deserialize, Serialize};

pub const ELEVATED_PERCENT: f64 = 70.0;
pub const CRITICAL_PERCENT: f64 = 90.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfferOutcome {
    Accepted,
    Stale,
}

/// Holds the single authoritative metric frame.
///
/// A frame replaces the current one only if its timestamp is strictly newer
/// than the last accepted frame, so duplicates and frames replayed after a
/// reconnect never move the view backwards.
#[derive(Debug, Clone, Default)]
pub struct MetricLatch {
    latest: Option<MetricFrame>,
    accepted: u64,
    stale: u64,
}

impl MetricLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&mut self, frame: MetricFrame) -> OfferOutcome {
        if let Some(current) = self.latest.as_ref() {
            if frame.timestamp <= current.timestamp {
                self.stale += 1;
                return OfferOutcome::Stale;
            }
        }
        self.latest = Some(frame);
        self.accepted += 1;
        OfferOutcome::Accepted
    }

    pub fn latest(&self) -> Option<&MetricFrame> {
        self.latest.as_ref()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn stale(&self) -> u64 {
        self.stale
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GaugeLevel {
    Normal,
    Elevated,
    Critical,
}

impl GaugeLevel {
    pub fn for_percent(percent: f64) -> Self {
        if percent >= CRITICAL_PERCENT {
            GaugeLevel::Critical
        } else if percent >= ELEVATED_PERCENT {
            GaugeLevel::Elevated
        } else {
            GaugeLevel::Normal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GaugeLevel::Normal => "normal",
            GaugeLevel::Elevated => "elevated",
            GaugeLevel::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Gauge {
    pub label: &'static str,
    pub percent: f64,
    pub level: GaugeLevel,
}

impl Gauge {
    fn new(label: &'static str, percent: f64) -> Self {
        let percent = percent.clamp(0.0, 100.0);
        Self {
            label,
            percent,
            level: GaugeLevel::for_percent(percent),
        }
    }
}

pub fn gauges(frame: &MetricFrame) -> Vec<Gauge> {
    vec![
        Gauge::new("cpu", frame.cpu.usage_percent),
        Gauge::new("memory", frame.memory.percent()),
        Gauge::new("disk", frame.disk.percent()),
    ]
}
