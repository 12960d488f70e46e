//! JSON detection payload decoding
//!
//! Decoding is all-or-nothing: one malformed element discards the whole
//! payload so a partial frame is never reported.

use super::record::{TelemetryRecord, UNKNOWN_RISK};
use super::schema::PayloadSchema;
use chrono::{DateTime, NaiveDateTime};
use serde_json::{Map, Value};
use thiserror::Error;

/// Why a payload was rejected
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Payload is not a JSON object")]
    NotAnObject,
    #[error("Missing array field '{0}'")]
    MissingArray(String),
    #[error("Field '{0}' is not an array")]
    NotAnArray(String),
    #[error("Element {index} is not an object")]
    ElementNotObject { index: usize },
    #[error("Element {index} is missing field '{field}'")]
    MissingField { index: usize, field: String },
    #[error("Element {index} field '{field}' is not a {expected}")]
    WrongType {
        index: usize,
        field: String,
        expected: &'static str,
    },
}

/// Turns raw data-topic payloads into records
#[derive(Debug, Clone, Default)]
pub struct PayloadDecoder {
    schema: PayloadSchema,
}

impl PayloadDecoder {
    pub fn new(schema: PayloadSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &PayloadSchema {
        &self.schema
    }

    /// Decode one payload into records, in array order
    pub fn decode(&self, payload: &[u8]) -> Result<Vec<TelemetryRecord>, DecodeError> {
        let text = std::str::from_utf8(payload)?;
        let value: Value = serde_json::from_str(text)?;
        let object = value.as_object().ok_or(DecodeError::NotAnObject)?;

        let field = &self.schema.array_field;
        let items = object
            .get(field)
            .ok_or_else(|| DecodeError::MissingArray(field.clone()))?
            .as_array()
            .ok_or_else(|| DecodeError::NotAnArray(field.clone()))?;

        let device_timestamp = self
            .schema
            .timestamp_field
            .as_ref()
            .and_then(|f| object.get(f))
            .and_then(Value::as_str)
            .and_then(parse_device_timestamp);

        items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let element = item
                    .as_object()
                    .ok_or(DecodeError::ElementNotObject { index })?;
                self.decode_element(index, element)
                    .map(|record| record.with_device_timestamp(device_timestamp))
            })
            .collect()
    }

    fn decode_element(
        &self,
        index: usize,
        element: &Map<String, Value>,
    ) -> Result<TelemetryRecord, DecodeError> {
        let label = string_field(index, element, &self.schema.label_field)?;
        let distance = required(index, element, &self.schema.distance_field)?
            .as_f64()
            .ok_or_else(|| DecodeError::WrongType {
                index,
                field: self.schema.distance_field.clone(),
                expected: "number",
            })?;
        let risk_level = match &self.schema.risk_field {
            Some(field) => string_field(index, element, field)?,
            None => UNKNOWN_RISK.to_string(),
        };

        Ok(TelemetryRecord::new(label, distance, risk_level))
    }
}

fn required<'a>(
    index: usize,
    element: &'a Map<String, Value>,
    field: &str,
) -> Result<&'a Value, DecodeError> {
    element.get(field).ok_or_else(|| DecodeError::MissingField {
        index,
        field: field.to_string(),
    })
}

fn string_field(
    index: usize,
    element: &Map<String, Value>,
    field: &str,
) -> Result<String, DecodeError> {
    required(index, element, field)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| DecodeError::WrongType {
            index,
            field: field.to_string(),
            expected: "string",
        })
}

/// ISO-8601 local time as the pipeline writes it, with or without an offset
pub fn parse_device_timestamp(raw: &str) -> Option<NaiveDateTime> {
    raw.parse::<NaiveDateTime>()
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.naive_utc()))
}
