#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::unimplemented,
        clippy::todo
    )
)]

//! # triedb telemetry
//!
//! Observability infrastructure for the storage engine: structured logging
//! initialization and abstract sinks that decouple metric instrumentation in
//! the hot paths from whatever backend the embedder wires up.

/// The initialization routine for global structured logging.
pub mod init;
/// Abstract traits (`*MetricsSink`) that define the contract for metrics reporting.
pub mod sinks;

pub use init::init_tracing;
pub use sinks::{io_metrics, storage_metrics, NopSink};
