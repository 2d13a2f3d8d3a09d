//! GC metrics and statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Statistics from one minor collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinorGcMetrics {
    /// Wall time of the whole collection, escalation included.
    pub duration: Duration,
    /// Time spent forwarding the roots.
    pub root_duration: Duration,
    /// Time spent scanning the copies.
    pub scan_duration: Duration,
    /// Time spent in the major collector, zero unless escalated.
    pub major_duration: Duration,
    /// Pointers into the nursery that were forwarded.
    pub local_ptrs: usize,
    /// Pointers seen that lead outside the nursery.
    pub global_ptrs: usize,
    /// Root slots examined.
    pub roots: usize,
    /// Bytes allocated in the nursery before the collection.
    pub nursery_bytes: usize,
    /// Bytes copied into old space, headers included.
    pub bytes_copied: usize,
    /// Free bytes above old space after copying.
    pub available: usize,
    /// Whether the collection escalated.
    pub collection_type: CollectionType,
}

impl MinorGcMetrics {
    /// All-zero metrics.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::ZERO,
            root_duration: Duration::ZERO,
            scan_duration: Duration::ZERO,
            major_duration: Duration::ZERO,
            local_ptrs: 0,
            global_ptrs: 0,
            roots: 0,
            nursery_bytes: 0,
            bytes_copied: 0,
            available: 0,
            collection_type: CollectionType::None,
        }
    }

    /// Nursery bytes that did not survive.
    #[must_use]
    pub const fn bytes_reclaimed(&self) -> usize {
        self.nursery_bytes.saturating_sub(self.bytes_copied)
    }
}

impl Default for MinorGcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Kind of collection a vproc last ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionType {
    /// No collection has run yet.
    #[default]
    None = 0,
    /// A local collection of the nursery only.
    Minor = 1,
    /// A minor collection that handed off to the major collector.
    Escalated = 2,
}

/// Times the phases of a minor collection.
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimer {
    /// Root forwarding.
    pub roots: Duration,
    /// Scan of the copies.
    pub scan: Duration,
    /// Major collection.
    pub major: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// A timer with all phases at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            roots: Duration::ZERO,
            scan: Duration::ZERO,
            major: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// End the root phase.
    pub fn end_roots(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.roots = start.elapsed();
        }
    }

    /// End the scan phase.
    pub fn end_scan(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.scan = start.elapsed();
        }
    }

    /// End the major phase.
    pub fn end_major(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.major = start.elapsed();
        }
    }
}

impl Default for PhaseTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Running totals for one vproc.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VProcStats {
    /// Minor collections run.
    pub minor_collections: usize,
    /// Minor collections that escalated.
    pub escalations: usize,
    /// Bytes copied by all minor collections.
    pub bytes_copied: usize,
    /// Summed minor collection pause.
    pub total_pause: Duration,
    /// Asynchronous preemptions observed.
    pub preemptions: usize,
    /// Sleep requests served.
    pub sleeps: usize,
    /// The most recent minor collection.
    pub last: MinorGcMetrics,
}

impl VProcStats {
    pub(crate) fn record_minor(&mut self, metrics: &MinorGcMetrics) {
        self.minor_collections += 1;
        if metrics.collection_type == CollectionType::Escalated {
            self.escalations += 1;
        }
        self.bytes_copied += metrics.bytes_copied;
        self.total_pause += metrics.duration;
        self.last = *metrics;
        GLOBAL_METRICS.record_minor(metrics);
    }

    pub(crate) fn record_preemption(&mut self) {
        self.preemptions += 1;
        GLOBAL_METRICS.preemptions.fetch_add(1, Ordering::Relaxed);
    }
}

/// Process-wide cumulative statistics, summed over every vproc.
///
/// # Example
///
/// ```
/// use vproc_gc::global_metrics;
///
/// let metrics = global_metrics();
/// println!("minor collections: {}", metrics.total_minor_collections());
/// ```
#[derive(Debug)]
pub struct GlobalMetrics {
    minor_collections: AtomicUsize,
    escalations: AtomicUsize,
    bytes_copied: AtomicUsize,
    pause_ns: AtomicU64,
    preemptions: AtomicUsize,
}

impl GlobalMetrics {
    /// All counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            minor_collections: AtomicUsize::new(0),
            escalations: AtomicUsize::new(0),
            bytes_copied: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
            preemptions: AtomicUsize::new(0),
        }
    }

    fn record_minor(&self, metrics: &MinorGcMetrics) {
        self.minor_collections.fetch_add(1, Ordering::Relaxed);
        if metrics.collection_type == CollectionType::Escalated {
            self.escalations.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_copied
            .fetch_add(metrics.bytes_copied, Ordering::Relaxed);
        let ns = u64::try_from(metrics.duration.as_nanos()).unwrap_or(u64::MAX);
        self.pause_ns.fetch_add(ns, Ordering::Relaxed);
    }

    /// Minor collections run by all vprocs.
    #[inline]
    #[must_use]
    pub fn total_minor_collections(&self) -> usize {
        self.minor_collections.load(Ordering::Relaxed)
    }

    /// Minor collections that escalated to the major collector.
    #[inline]
    #[must_use]
    pub fn total_escalations(&self) -> usize {
        self.escalations.load(Ordering::Relaxed)
    }

    /// Bytes copied into old space.
    #[inline]
    #[must_use]
    pub fn total_bytes_copied(&self) -> usize {
        self.bytes_copied.load(Ordering::Relaxed)
    }

    /// Summed minor collection pause in nanoseconds.
    #[inline]
    #[must_use]
    pub fn total_pause_ns(&self) -> u64 {
        self.pause_ns.load(Ordering::Relaxed)
    }

    /// Asynchronous preemptions observed.
    #[inline]
    #[must_use]
    pub fn total_preemptions(&self) -> usize {
        self.preemptions.load(Ordering::Relaxed)
    }
}

impl Default for GlobalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_METRICS: GlobalMetrics = GlobalMetrics::new();

/// The process-level counters.
#[must_use]
pub fn global_metrics() -> &'static GlobalMetrics {
    &GLOBAL_METRICS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_accumulate() {
        let mut stats = VProcStats::default();
        let mut m = MinorGcMetrics::new();
        m.bytes_copied = 64;
        m.nursery_bytes = 256;
        m.collection_type = CollectionType::Minor;
        stats.record_minor(&m);
        m.collection_type = CollectionType::Escalated;
        stats.record_minor(&m);

        assert_eq!(stats.minor_collections, 2);
        assert_eq!(stats.escalations, 1);
        assert_eq!(stats.bytes_copied, 128);
        assert_eq!(stats.last.collection_type, CollectionType::Escalated);
        assert_eq!(m.bytes_reclaimed(), 192);
        assert!(global_metrics().total_minor_collections() >= 2);
    }

    #[test]
    fn test_phase_timer() {
        let mut timer = PhaseTimer::new();
        timer.end_roots();
        assert_eq!(timer.roots, Duration::ZERO);
        timer.start();
        timer.end_scan();
        assert!(timer.current_start.is_none());
    }
}
