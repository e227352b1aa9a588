//! Observability setup for Conflux: tracing subscriber and optional
//! OpenTelemetry export.

pub mod tracing_setup;
