use serde::Serialize;
/// Broker metrics collection
///
/// Hub-level counters are atomics shared between the dispatch loop and any
/// reader holding a `BrokerHandle`. Per-connection stats are plain counters
/// owned by the dispatch loop alongside the connection's send queue.
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

// ============================================================================
// CONNECTION STATS
// ============================================================================

/// Per-connection statistics, owned by the dispatch loop
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionStats {
    /// Frames handed to the transport
    pub frames_sent: u64,

    /// Frames dropped because the send queue was full
    pub overflow_drops: u64,

    /// Frames currently waiting in the send queue
    pub queue_size: usize,

    /// Highest send queue size seen
    pub peak_queue_size: usize,

    /// Smoothed round-trip time in milliseconds
    pub rtt_avg_ms: Option<f64>,
}

impl ConnectionStats {
    pub fn inc_sent(&mut self) {
        self.frames_sent += 1;
    }

    pub fn inc_overflow(&mut self) {
        self.overflow_drops += 1;
    }

    /// Update queue size and peak
    pub fn set_queue_size(&mut self, size: usize) {
        self.queue_size = size;
        if size > self.peak_queue_size {
            self.peak_queue_size = size;
        }
    }
}

// ============================================================================
// HUB METRICS
// ============================================================================

/// Hub-level metrics (aggregate across all connections)
#[derive(Debug, Default)]
pub struct HubMetrics {
    total_connections: AtomicU64,
    active_connections: AtomicUsize,
    frames_sent: AtomicU64,
    overflow_drops: AtomicU64,
    published: AtomicU64,
    outbound_queue_full: AtomicU64,
    inbound_queue_full: AtomicU64,
    inbound_applied: AtomicU64,
    malformed_payloads: AtomicU64,
    unknown_topics: AtomicU64,
    throttled: AtomicU64,
    evictions: AtomicU64,
    probes_sent: AtomicU64,
    /// Global RTT average in microseconds, 0 until the first sample
    rtt_avg_us: AtomicU64,
}

impl HubMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Teardown is idempotent upstream, but never wrap below zero
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn overflow_drop(&self) {
        self.overflow_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn outbound_queue_full(&self) {
        self.outbound_queue_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inbound_queue_full(&self) {
        self.inbound_queue_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inbound_applied(&self) {
        self.inbound_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_payload(&self) {
        self.malformed_payloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unknown_topic(&self) {
        self.unknown_topics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_throttled(&self) {
        self.throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_evicted(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn probes_sent(&self, count: u64) {
        self.probes_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_rtt_avg_ms(&self, avg_ms: f64) {
        self.rtt_avg_us
            .store((avg_ms * 1000.0).round() as u64, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get snapshot
    pub fn snapshot(&self) -> HubMetricsSnapshot {
        let rtt_us = self.rtt_avg_us.load(Ordering::Relaxed);
        HubMetricsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            overflow_drops: self.overflow_drops.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            outbound_queue_full: self.outbound_queue_full.load(Ordering::Relaxed),
            inbound_queue_full: self.inbound_queue_full.load(Ordering::Relaxed),
            inbound_applied: self.inbound_applied.load(Ordering::Relaxed),
            malformed_payloads: self.malformed_payloads.load(Ordering::Relaxed),
            unknown_topics: self.unknown_topics.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            probes_sent: self.probes_sent.load(Ordering::Relaxed),
            rtt_avg_ms: (rtt_us > 0).then(|| rtt_us as f64 / 1000.0),
        }
    }
}

/// Hub metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct HubMetricsSnapshot {
    pub total_connections: u64,
    pub active_connections: usize,
    pub frames_sent: u64,
    pub overflow_drops: u64,
    pub published: u64,
    pub outbound_queue_full: u64,
    pub inbound_queue_full: u64,
    pub inbound_applied: u64,
    pub malformed_payloads: u64,
    pub unknown_topics: u64,
    pub throttled: u64,
    pub evictions: u64,
    pub probes_sent: u64,
    pub rtt_avg_ms: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_stats() {
        let mut stats = ConnectionStats::default();

        stats.inc_sent();
        stats.inc_sent();
        stats.inc_overflow();
        stats.set_queue_size(10);
        stats.set_queue_size(20);
        stats.set_queue_size(15);

        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.overflow_drops, 1);
        assert_eq!(stats.queue_size, 15);
        assert_eq!(stats.peak_queue_size, 20);
    }

    #[test]
    fn test_hub_metrics() {
        let metrics = HubMetrics::new();

        metrics.connection_opened();
        metrics.connection_opened();
        metrics.frame_sent();
        metrics.frame_sent();
        metrics.overflow_drop();
        metrics.connection_closed();
        metrics.set_rtt_avg_ms(12.5);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_connections, 2);
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.frames_sent, 2);
        assert_eq!(snapshot.overflow_drops, 1);
        assert_eq!(snapshot.rtt_avg_ms, Some(12.5));
    }

    #[test]
    fn test_close_never_underflows() {
        let metrics = HubMetrics::new();
        metrics.connection_closed();
        assert_eq!(metrics.active_connections(), 0);
        assert_eq!(metrics.snapshot().rtt_avg_ms, None);
    }
}
