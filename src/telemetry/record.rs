//! Decoded detection record

use chrono::NaiveDateTime;
use serde::Serialize;
use std::fmt;

/// Risk level used when the payload schema carries none
pub const UNKNOWN_RISK: &str = "unknown";

/// One detected object as reported by the camera pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    pub label: String,
    /// Estimated distance, or the detector confidence for confidence-only payloads
    pub distance: f64,
    pub risk_level: String,
    /// Frame timestamp from the payload, when present
    pub device_timestamp: Option<NaiveDateTime>,
}

impl TelemetryRecord {
    pub fn new(label: impl Into<String>, distance: f64, risk_level: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            distance,
            risk_level: risk_level.into(),
            device_timestamp: None,
        }
    }

    pub fn with_device_timestamp(mut self, timestamp: Option<NaiveDateTime>) -> Self {
        self.device_timestamp = timestamp;
        self
    }

    pub fn is_high_risk(&self) -> bool {
        self.risk_level.eq_ignore_ascii_case("high")
    }
}

/// `person 1.2 high`
impl fmt::Display for TelemetryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.label, self.distance, self.risk_level)
    }
}
