//! Detection telemetry: payload schema, decoding, routing and the shared feed

pub mod decoder;
pub mod record;
pub mod router;
pub mod schema;
pub mod sink;

pub use decoder::{parse_device_timestamp, DecodeError, PayloadDecoder};
pub use record::{TelemetryRecord, UNKNOWN_RISK};
pub use router::{LivenessSignal, RouteOutcome, TopicRouter};
pub use schema::PayloadSchema;
pub use sink::{telemetry_channel, TelemetryFeed, TelemetrySink, TelemetrySubscription};
