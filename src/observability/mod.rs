//! Observability: structured logging

pub mod logging;

pub use logging::{init_default_logging, init_logging, init_with_verbosity, LogFormat};

pub use logging::mqtt_span;
