//! Runtime bootstrap: telemetry installation and its error type.

pub mod error;
pub mod telemetry;
