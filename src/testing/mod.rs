//! Testing utilities
//!
//! An in-memory broker session so the connection manager can be exercised
//! without a broker or credentials.

pub mod mocks;

pub use mocks::*;
