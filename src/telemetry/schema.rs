//! Field layout of the detection payload
//!
//! The camera pipeline has shipped several payload revisions, so field names
//! come from configuration. [`PayloadSchema::detections`] is the canonical
//! shape; the other presets describe older revisions.
//!
//! In a settings file an empty string switches an optional field off:
//!
//! ```toml
//! [schema]
//! label_field = "object"
//! distance_field = "confidence"
//! risk_field = ""
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PayloadSchema {
    /// Top-level field holding the array of detections
    pub array_field: String,
    pub label_field: String,
    /// Numeric field mapped to `TelemetryRecord::distance`
    pub distance_field: String,
    /// Unset for revisions without a risk assessment
    #[serde(
        serialize_with = "serialize_optional",
        deserialize_with = "deserialize_optional"
    )]
    pub risk_field: Option<String>,
    /// Top-level frame timestamp; optional in the payload
    #[serde(
        serialize_with = "serialize_optional",
        deserialize_with = "deserialize_optional"
    )]
    pub timestamp_field: Option<String>,
}

fn serialize_optional<S: Serializer>(
    value: &Option<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(value.as_deref().unwrap_or(""))
}

fn deserialize_optional<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    let value = String::deserialize(deserializer)?;
    Ok((!value.trim().is_empty()).then_some(value))
}

impl Default for PayloadSchema {
    fn default() -> Self {
        Self::detections()
    }
}

impl PayloadSchema {
    /// `{"timestamp": .., "objects": [{"label", "distance", "risk_level"}]}`
    pub fn detections() -> Self {
        Self {
            array_field: "objects".to_string(),
            label_field: "label".to_string(),
            distance_field: "distance".to_string(),
            risk_field: Some("risk_level".to_string()),
            timestamp_field: Some("timestamp".to_string()),
        }
    }

    /// `{"timestamp": .., "objects": [{"object", "confidence"}]}`
    pub fn confidence() -> Self {
        Self {
            array_field: "objects".to_string(),
            label_field: "object".to_string(),
            distance_field: "confidence".to_string(),
            risk_field: None,
            timestamp_field: Some("timestamp".to_string()),
        }
    }

    /// `{"timestamp": .., "distances": [{"object", "distance_m"}]}`
    pub fn stereo_distances() -> Self {
        Self {
            array_field: "distances".to_string(),
            label_field: "object".to_string(),
            distance_field: "distance_m".to_string(),
            risk_field: None,
            timestamp_field: Some("timestamp".to_string()),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let required = [
            ("array_field", self.array_field.as_str()),
            ("label_field", self.label_field.as_str()),
            ("distance_field", self.distance_field.as_str()),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(format!("{name} must not be empty"));
            }
        }
        for (name, value) in [
            ("risk_field", &self.risk_field),
            ("timestamp_field", &self.timestamp_field),
        ] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                return Err(format!("{name} must not be empty when set"));
            }
        }
        Ok(())
    }
}
