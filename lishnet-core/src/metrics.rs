//! Prometheus metrics
//!
//! Thread-safe counters shared by every network session and transfer.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Peer connection metrics
    peer_connections: AtomicUsize,
    total_peers_seen: AtomicU64,

    // Chunks served to peers
    chunks_served: AtomicU64,
    bytes_served: AtomicU64,

    // Chunks fetched and verified
    chunks_fetched: AtomicU64,
    bytes_fetched: AtomicU64,
    verification_failures: AtomicU64,

    downloads_completed: AtomicU64,
    downloads_failed: AtomicU64,

    // Chunk fetch latency (simple average in milliseconds)
    total_fetch_time_ms: AtomicU64,
    total_fetches: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                peer_connections: AtomicUsize::new(0),
                total_peers_seen: AtomicU64::new(0),
                chunks_served: AtomicU64::new(0),
                bytes_served: AtomicU64::new(0),
                chunks_fetched: AtomicU64::new(0),
                bytes_fetched: AtomicU64::new(0),
                verification_failures: AtomicU64::new(0),
                downloads_completed: AtomicU64::new(0),
                downloads_failed: AtomicU64::new(0),
                total_fetch_time_ms: AtomicU64::new(0),
                total_fetches: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    // Peer connection metrics

    pub fn peer_connected(&self) {
        self.inner.peer_connections.fetch_add(1, Ordering::Relaxed);
        self.inner.total_peers_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_disconnected(&self) {
        let _ = self
            .inner
            .peer_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn peer_connections(&self) -> usize {
        self.inner.peer_connections.load(Ordering::Relaxed)
    }

    pub fn total_peers_seen(&self) -> u64 {
        self.inner.total_peers_seen.load(Ordering::Relaxed)
    }

    // Chunk transfer metrics

    pub fn chunk_served(&self, size: usize) {
        self.inner.chunks_served.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_served.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn chunk_fetched(&self, size: usize, duration_ms: u64) {
        self.inner.chunks_fetched.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_fetched.fetch_add(size as u64, Ordering::Relaxed);
        self.inner
            .total_fetch_time_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        self.inner.total_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn verification_failed(&self) {
        self.inner
            .verification_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunks_served(&self) -> u64 {
        self.inner.chunks_served.load(Ordering::Relaxed)
    }

    pub fn bytes_served(&self) -> u64 {
        self.inner.bytes_served.load(Ordering::Relaxed)
    }

    pub fn chunks_fetched(&self) -> u64 {
        self.inner.chunks_fetched.load(Ordering::Relaxed)
    }

    pub fn bytes_fetched(&self) -> u64 {
        self.inner.bytes_fetched.load(Ordering::Relaxed)
    }

    pub fn verification_failures(&self) -> u64 {
        self.inner.verification_failures.load(Ordering::Relaxed)
    }

    // Download outcomes

    pub fn download_completed(&self) {
        self.inner.downloads_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn download_failed(&self) {
        self.inner.downloads_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn downloads_completed(&self) -> u64 {
        self.inner.downloads_completed.load(Ordering::Relaxed)
    }

    pub fn downloads_failed(&self) -> u64 {
        self.inner.downloads_failed.load(Ordering::Relaxed)
    }

    pub fn avg_fetch_time_ms(&self) -> f64 {
        let total = self.inner.total_fetch_time_ms.load(Ordering::Relaxed);
        let count = self.inner.total_fetches.load(Ordering::Relaxed);
        if count == 0 {
            0.0
        } else {
            total as f64 / count as f64
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    /// Prometheus text exposition
    pub fn to_prometheus(&self, dataset_count: usize, enabled_networks: usize) -> String {
        format!(
            "# HELP lishnet_datasets Number of datasets in the chunk store\n\
             # TYPE lishnet_datasets gauge\n\
             lishnet_datasets {}\n\
             \n\
             # HELP lishnet_enabled_networks Number of networks currently enabled\n\
             # TYPE lishnet_enabled_networks gauge\n\
             lishnet_enabled_networks {}\n\
             \n\
             # HELP lishnet_uptime_seconds Time since node started in seconds\n\
             # TYPE lishnet_uptime_seconds counter\n\
             lishnet_uptime_seconds {}\n\
             \n\
             # HELP lishnet_peer_connections Current number of peer connections across networks\n\
             # TYPE lishnet_peer_connections gauge\n\
             lishnet_peer_connections {}\n\
             \n\
             # HELP lishnet_total_peers_seen Total peer connections since start\n\
             # TYPE lishnet_total_peers_seen counter\n\
             lishnet_total_peers_seen {}\n\
             \n\
             # HELP lishnet_chunks_served_total Chunks sent to peers\n\
             # TYPE lishnet_chunks_served_total counter\n\
             lishnet_chunks_served_total {}\n\
             \n\
             # HELP lishnet_bytes_served_total Bytes sent to peers\n\
             # TYPE lishnet_bytes_served_total counter\n\
             lishnet_bytes_served_total {}\n\
             \n\
             # HELP lishnet_chunks_fetched_total Chunks fetched and verified\n\
             # TYPE lishnet_chunks_fetched_total counter\n\
             lishnet_chunks_fetched_total {}\n\
             \n\
             # HELP lishnet_bytes_fetched_total Bytes fetched and verified\n\
             # TYPE lishnet_bytes_fetched_total counter\n\
             lishnet_bytes_fetched_total {}\n\
             \n\
             # HELP lishnet_verification_failures_total Chunks discarded after a digest mismatch\n\
             # TYPE lishnet_verification_failures_total counter\n\
             lishnet_verification_failures_total {}\n\
             \n\
             # HELP lishnet_downloads_completed_total Downloads that reached Complete\n\
             # TYPE lishnet_downloads_completed_total counter\n\
             lishnet_downloads_completed_total {}\n\
             \n\
             # HELP lishnet_downloads_failed_total Downloads that ended Failed\n\
             # TYPE lishnet_downloads_failed_total counter\n\
             lishnet_downloads_failed_total {}\n\
             \n\
             # HELP lishnet_avg_fetch_time_ms Average chunk fetch time in milliseconds\n\
             # TYPE lishnet_avg_fetch_time_ms gauge\n\
             lishnet_avg_fetch_time_ms {:.2}\n",
            dataset_count,
            enabled_networks,
            self.uptime_seconds(),
            self.peer_connections(),
            self.total_peers_seen(),
            self.chunks_served(),
            self.bytes_served(),
            self.chunks_fetched(),
            self.bytes_fetched(),
            self.verification_failures(),
            self.downloads_completed(),
            self.downloads_failed(),
            self.avg_fetch_time_ms(),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_connections() {
        let metrics = Metrics::new();
        metrics.peer_connected();
        metrics.peer_connected();
        metrics.peer_disconnected();
        assert_eq!(metrics.peer_connections(), 1);
        assert_eq!(metrics.total_peers_seen(), 2);
    }

    #[test]
    fn test_disconnect_never_underflows() {
        let metrics = Metrics::new();
        metrics.peer_disconnected();
        assert_eq!(metrics.peer_connections(), 0);
    }

    #[test]
    fn test_chunk_counters() {
        let metrics = Metrics::new();
        metrics.chunk_served(100);
        metrics.chunk_fetched(200, 10);
        metrics.chunk_fetched(50, 30);
        metrics.verification_failed();

        assert_eq!(metrics.chunks_served(), 1);
        assert_eq!(metrics.bytes_served(), 100);
        assert_eq!(metrics.chunks_fetched(), 2);
        assert_eq!(metrics.bytes_fetched(), 250);
        assert_eq!(metrics.verification_failures(), 1);
        assert_eq!(metrics.avg_fetch_time_ms(), 20.0);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = Metrics::new();
        metrics.peer_connected();
        metrics.download_completed();
        metrics.download_failed();

        let output = metrics.to_prometheus(3, 2);
        assert!(output.contains("lishnet_datasets 3"));
        assert!(output.contains("lishnet_enabled_networks 2"));
        assert!(output.contains("lishnet_peer_connections 1"));
        assert!(output.contains("lishnet_downloads_completed_total 1"));
        assert!(output.contains("lishnet_downloads_failed_total 1"));
    }
}
