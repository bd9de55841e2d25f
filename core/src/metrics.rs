//! # FluxQ Metrics
//!
//! Lock-free counters for the broker's hot paths. Every counter is an atomic
//! updated with relaxed ordering; aggregation happens in [`MetricsSnapshot`]
//! or in the periodic report task started by
//! [`MetricsRegistry::start_reporting`].
//!
//! - [`ConnectionMetrics`]: open connections and channels
//! - [`ThroughputMetrics`]: published, delivered and acknowledged messages
//! - [`RoutingMetrics`]: unroutable, returned and dead-lettered messages

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::info;

/// Keeps hot counters on separate cache lines.
#[repr(align(64))]
#[derive(Debug, Default)]
struct CacheLineAligned<T>(T);

#[derive(Debug)]
pub struct MetricsRegistry {
    pub connections: ConnectionMetrics,
    pub throughput: ThroughputMetrics,
    pub routing: RoutingMetrics,
    started: Instant,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            connections: ConnectionMetrics::default(),
            throughput: ThroughputMetrics::default(),
            routing: RoutingMetrics::default(),
            started: Instant::now(),
        }
    }

    /// Logs a report every `period` until the runtime shuts down.
    pub fn start_reporting(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.report();
            }
        })
    }

    pub fn report(&self) {
        let snapshot = self.snapshot();
        info!(
            connections = snapshot.active_connections,
            channels = snapshot.active_channels,
            published = snapshot.messages_published,
            delivered = snapshot.messages_delivered,
            acknowledged = snapshot.messages_acknowledged,
            unroutable = snapshot.messages_unroutable,
            returned = snapshot.messages_returned,
            dead_lettered = snapshot.messages_dead_lettered,
            uptime_secs = snapshot.uptime_seconds,
            "Broker metrics"
        );
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: chrono::Utc::now().timestamp(),
            active_connections: self.connections.active_connections(),
            total_connections: self.connections.total_connections(),
            active_channels: self.connections.active_channels(),
            messages_published: self.throughput.published(),
            bytes_published: self.throughput.bytes_published(),
            messages_delivered: self.throughput.delivered(),
            messages_acknowledged: self.throughput.acknowledged(),
            messages_unroutable: self.routing.unroutable(),
            messages_returned: self.routing.returned(),
            messages_dead_lettered: self.routing.dead_lettered(),
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    active_connections: CacheLineAligned<AtomicUsize>,
    total_connections: AtomicU64,
    active_channels: CacheLineAligned<AtomicUsize>,
}

impl ConnectionMetrics {
    pub fn connection_opened(&self) {
        self.active_connections.0.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn channel_opened(&self) {
        self.active_channels.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn channel_closed(&self) {
        let _ = self
            .active_channels
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.0.load(Ordering::Relaxed)
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn active_channels(&self) -> usize {
        self.active_channels.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct ThroughputMetrics {
    published: CacheLineAligned<AtomicU64>,
    bytes_published: AtomicU64,
    delivered: CacheLineAligned<AtomicU64>,
    acknowledged: CacheLineAligned<AtomicU64>,
}

impl ThroughputMetrics {
    #[inline(always)]
    pub fn record_published(&self, bytes: u64) {
        self.published.0.fetch_add(1, Ordering::Relaxed);
        self.bytes_published.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_delivered(&self) {
        self.delivered.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_acknowledged(&self, count: u64) {
        self.acknowledged.0.fetch_add(count, Ordering::Relaxed);
    }

    pub fn published(&self) -> u64 {
        self.published.0.load(Ordering::Relaxed)
    }

    pub fn bytes_published(&self) -> u64 {
        self.bytes_published.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.0.load(Ordering::Relaxed)
    }

    pub fn acknowledged(&self) -> u64 {
        self.acknowledged.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct RoutingMetrics {
    unroutable: AtomicU64,
    returned: AtomicU64,
    dead_lettered: AtomicU64,
}

impl RoutingMetrics {
    /// A message matched no queue and was dropped.
    pub fn record_unroutable(&self) {
        self.unroutable.fetch_add(1, Ordering::Relaxed);
    }

    /// A message went back to its publisher with `basic.return`.
    pub fn record_returned(&self) {
        self.returned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unroutable(&self) -> u64 {
        self.unroutable.load(Ordering::Relaxed)
    }

    pub fn returned(&self) -> u64 {
        self.returned.load(Ordering::Relaxed)
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    pub active_connections: usize,
    pub total_connections: u64,
    pub active_channels: usize,
    pub messages_published: u64,
    pub bytes_published: u64,
    pub messages_delivered: u64,
    pub messages_acknowledged: u64,
    pub messages_unroutable: u64,
    pub messages_returned: u64,
    pub messages_dead_lettered: u64,
    pub uptime_seconds: u64,
}

impl MetricsSnapshot {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let gauges = [
            ("fluxq_connections_active", self.active_connections as u64),
            ("fluxq_channels_active", self.active_channels as u64),
            ("fluxq_uptime_seconds", self.uptime_seconds),
        ];
        let counters = [
            ("fluxq_connections_total", self.total_connections),
            ("fluxq_messages_published_total", self.messages_published),
            ("fluxq_bytes_published_total", self.bytes_published),
            ("fluxq_messages_delivered_total", self.messages_delivered),
            ("fluxq_messages_acknowledged_total", self.messages_acknowledged),
            ("fluxq_messages_unroutable_total", self.messages_unroutable),
            ("fluxq_messages_returned_total", self.messages_returned),
            ("fluxq_messages_dead_lettered_total", self.messages_dead_lettered),
        ];

        let mut output = String::new();
        for (name, value) in gauges {
            output.push_str(&format!("# TYPE {name} gauge\n{name} {value}\n"));
        }
        for (name, value) in counters {
            output.push_str(&format!("# TYPE {name} counter\n{name} {value}\n"));
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let metrics = MetricsRegistry::new();
        metrics.connections.connection_opened();
        metrics.connections.connection_opened();
        metrics.connections.connection_closed();
        metrics.connections.channel_opened();
        metrics.throughput.record_published(10);
        metrics.throughput.record_published(5);
        metrics.throughput.record_delivered();
        metrics.throughput.record_acknowledged(1);
        metrics.routing.record_unroutable();
        metrics.routing.record_returned();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.total_connections, 2);
        assert_eq!(snapshot.active_channels, 1);
        assert_eq!(snapshot.messages_published, 2);
        assert_eq!(snapshot.bytes_published, 15);
        assert_eq!(snapshot.messages_delivered, 1);
        assert_eq!(snapshot.messages_acknowledged, 1);
        assert_eq!(snapshot.messages_unroutable, 1);
        assert_eq!(snapshot.messages_returned, 1);
        assert_eq!(snapshot.messages_dead_lettered, 0);
    }

    #[test]
    fn test_gauges_never_underflow() {
        let metrics = ConnectionMetrics::default();
        metrics.connection_closed();
        metrics.channel_closed();
        assert_eq!(metrics.active_connections(), 0);
        assert_eq!(metrics.active_channels(), 0);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = MetricsRegistry::new();
        metrics.throughput.record_published(3);
        let text = metrics.snapshot().to_prometheus();
        assert!(text.contains("fluxq_messages_published_total 1\n"));
        assert!(text.contains("# TYPE fluxq_connections_active gauge\n"));
        assert!(metrics.snapshot().to_json().unwrap().contains("\"messages_published\": 1"));
    }
}
