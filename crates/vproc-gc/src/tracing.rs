//! GC tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! spans and events for collections and execution-loop transitions. Without
//! the feature every function here compiles to nothing.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    use crate::gc::check::HeapDiagnostic;
    use crate::metrics::MinorGcMetrics;

    /// Identifier correlating the events of one collection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique GC ID.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Guard returned by span constructors.
    pub type SpanGuard = span::EnteredSpan;

    /// Create a span for one minor collection.
    pub fn trace_minor_gc(vproc: usize, gc_id: GcId) -> SpanGuard {
        span!(Level::DEBUG, "minor_gc", vproc = vproc, gc_id = gc_id.0).entered()
    }

    /// Log the end of a minor collection.
    pub fn log_minor_gc_end(metrics: &MinorGcMetrics) {
        tracing::debug!(
            local_ptrs = metrics.local_ptrs,
            global_ptrs = metrics.global_ptrs,
            bytes_copied = metrics.bytes_copied,
            available = metrics.available,
            "minor_gc_end"
        );
    }

    /// Log a hand-off to the major collector.
    pub fn log_escalation(available: usize, global_pending: bool) {
        tracing::debug!(available, global_pending, "escalate_major_gc");
    }

    /// Log an asynchronous preemption being turned into a signal.
    pub fn log_preempt_signal(vproc: usize) {
        tracing::trace!(vproc, "preempt_signal");
    }

    /// Log a vproc entering its execution loop.
    pub fn log_run(vproc: usize) {
        tracing::debug!(vproc, "vproc_run");
    }

    /// Log a vproc leaving its execution loop.
    pub fn log_stop(vproc: usize, reason: &str) {
        tracing::debug!(vproc, reason, "vproc_stop");
    }

    /// Log a heap consistency finding.
    pub fn log_diagnostic(diag: &HeapDiagnostic) {
        tracing::warn!(%diag, "heap_check");
    }

    /// Log a fatal error.
    pub fn log_fatal(msg: &str) {
        tracing::error!(msg, "fatal");
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn)]
pub mod internal {
    use crate::gc::check::HeapDiagnostic;
    use crate::metrics::MinorGcMetrics;

    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Stub function when tracing is disabled.
    pub fn next_gc_id() -> GcId {
        GcId(0)
    }

    /// Stub guard when tracing is disabled.
    pub type SpanGuard = ();

    /// Stub function when tracing is disabled.
    pub fn trace_minor_gc(_vproc: usize, _gc_id: GcId) -> SpanGuard {}

    /// Stub function when tracing is disabled.
    pub fn log_minor_gc_end(_metrics: &MinorGcMetrics) {}

    /// Stub function when tracing is disabled.
    pub fn log_escalation(_available: usize, _global_pending: bool) {}

    /// Stub function when tracing is disabled.
    pub fn log_preempt_signal(_vproc: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_run(_vproc: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_stop(_vproc: usize, _reason: &str) {}

    /// Stub function when tracing is disabled.
    pub fn log_diagnostic(_diag: &HeapDiagnostic) {}

    /// Stub function when tracing is disabled.
    pub fn log_fatal(_msg: &str) {}
}
