//! Defines abstract traits for metrics reporting, decoupling core logic from the backend.

use once_cell::sync::OnceCell;

// --- Static Sink Access ---

/// A no-op sink for use in tests or when telemetry is disabled.
#[derive(Debug, Clone, Copy)]
pub struct NopSink;

/// A lazily-initialized static reference to the global `MetricsSink` implementation.
pub static SINK: OnceCell<&'static dyn MetricsSink> = OnceCell::new();
static NOP_SINK: NopSink = NopSink;

/// Returns a static reference to the configured storage metrics sink.
/// If no sink has been initialized, it returns a no-op sink.
pub fn storage_metrics() -> &'static dyn StorageMetricsSink {
    SINK.get().copied().unwrap_or(&NOP_SINK)
}

/// Returns a static reference to the configured io metrics sink.
/// If no sink has been initialized, it returns a no-op sink.
pub fn io_metrics() -> &'static dyn IoMetricsSink {
    SINK.get().copied().unwrap_or(&NOP_SINK)
}

// --- Trait Definitions ---

/// A sink for metrics related to the trie storage layer.
pub trait StorageMetricsSink: Send + Sync + std::fmt::Debug {
    /// Increments the total number of node records appended to the write streams.
    fn inc_nodes_written(&self, count: u64);
    /// Increments the total number of bytes appended to the write streams.
    fn inc_bytes_written_total(&self, bytes: u64);
    /// Increments the total number of versions expired out of the history window.
    fn inc_versions_expired(&self, count: u64);
    /// Increments the total number of chunks returned to the free list.
    fn inc_chunks_recycled(&self, count: u64);
    /// Sets the gauge for the number of versions currently retained.
    fn set_retained_versions(&self, count: u64);
}
impl StorageMetricsSink for NopSink {
    fn inc_nodes_written(&self, _count: u64) {}
    fn inc_bytes_written_total(&self, _bytes: u64) {}
    fn inc_versions_expired(&self, _count: u64) {}
    fn inc_chunks_recycled(&self, _count: u64) {}
    fn set_retained_versions(&self, _count: u64) {}
}

/// A sink for metrics related to the async i/o engine.
pub trait IoMetricsSink: Send + Sync + std::fmt::Debug {
    /// Increments the counter for read operations submitted to the read ring.
    fn inc_reads_submitted(&self);
    /// Increments the counter for write operations submitted to the write ring.
    fn inc_writes_submitted(&self);
    /// Increments the counter for reads served from the write-back cache.
    fn inc_writeback_cache_hits(&self);
    /// Increments the counter for reads that joined an already inflight read.
    fn inc_coalesced_reads(&self);
    /// Increments the counter for times an initiator had to wait for a free buffer.
    fn inc_buffer_waits(&self);
}
impl IoMetricsSink for NopSink {
    fn inc_reads_submitted(&self) {}
    fn inc_writes_submitted(&self) {}
    fn inc_writeback_cache_hits(&self) {}
    fn inc_coalesced_reads(&self) {}
    fn inc_buffer_waits(&self) {}
}

/// A unified sink that implements all domain-specific traits, providing a single
/// point of implementation for metrics backends.
pub trait MetricsSink: StorageMetricsSink + IoMetricsSink {}

// Blanket implementation to allow any type that implements all sub-traits
// to be used as a `MetricsSink`.
impl<T> MetricsSink for T where T: StorageMetricsSink + IoMetricsSink {}
