//! Round-robin pool of upstream proxy endpoints

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::models::{ProxyEndpoint, RequestRecord, UpstreamStatsSnapshot};

/// Per-endpoint counters, observability only
#[derive(Debug, Default)]
struct UpstreamStats {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    total_response_ms: AtomicU64,
}

/// Fixed set of upstream endpoints handed out in round-robin order
///
/// Uses atomic operations for lock-free cursor tracking. Endpoints are never
/// skipped: a failing upstream still gets its turn.
#[derive(Debug)]
pub struct UpstreamPool {
    endpoints: Vec<Arc<ProxyEndpoint>>,
    stats: Vec<UpstreamStats>,
    cursor: AtomicUsize,
}

impl UpstreamPool {
    /// Build the pool; an empty endpoint list is a configuration error.
    pub fn new(endpoints: Vec<ProxyEndpoint>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(RelayError::InvalidConfig(
                "At least one upstream proxy is required".into(),
            ));
        }

        let stats = endpoints.iter().map(|_| UpstreamStats::default()).collect();
        // Ids double as stats indices.
        let endpoints = endpoints
            .into_iter()
            .enumerate()
            .map(|(id, mut endpoint)| {
                endpoint.id = id;
                Arc::new(endpoint)
            })
            .collect();

        Ok(Self {
            endpoints,
            stats,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Endpoints in rotation order
    pub fn endpoints(&self) -> &[Arc<ProxyEndpoint>] {
        &self.endpoints
    }

    /// Next endpoint in rotation
    pub fn next(&self) -> Arc<ProxyEndpoint> {
        let len = self.endpoints.len();
        // Atomically increment and get the previous value, then wrap around
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
        self.endpoints[idx].clone()
    }

    /// Index the next call to [`UpstreamPool::next`] will return
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Relaxed) % self.endpoints.len()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Record the outcome of a relay attempt
    pub fn record(&self, record: &RequestRecord) {
        let Some(stats) = self.stats.get(record.upstream_id) else {
            return;
        };

        stats.requests.fetch_add(1, Ordering::Relaxed);
        if record.success {
            stats.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.failures.fetch_add(1, Ordering::Relaxed);
        }
        stats
            .total_response_ms
            .fetch_add(record.response_time, Ordering::Relaxed);
    }

    /// Counters for every endpoint, credentials excluded
    pub fn snapshot(&self) -> Vec<UpstreamStatsSnapshot> {
        self.endpoints
            .iter()
            .zip(&self.stats)
            .map(|(endpoint, stats)| {
                let requests = stats.requests.load(Ordering::Relaxed);
                let total = stats.total_response_ms.load(Ordering::Relaxed);
                UpstreamStatsSnapshot {
                    id: endpoint.id,
                    address: endpoint.address(),
                    requests,
                    successes: stats.successes.load(Ordering::Relaxed),
                    failures: stats.failures.load(Ordering::Relaxed),
                    avg_response_ms: if requests == 0 { 0 } else { total / requests },
                }
            })
            .collect()
    }
}

/// Milliseconds as stored in [`RequestRecord::response_time`]
pub fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
