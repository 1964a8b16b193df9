use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one relay attempt through an upstream
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub upstream_id: usize,
    pub upstream_address: String,
    pub target: String,
    pub scheme: String,
    pub success: bool,
    pub response_time: u64,
    pub status_code: u16,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time counters for one upstream endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamStatsSnapshot {
    pub id: usize,
    pub address: String,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_response_ms: u64,
}

/// Payload of the admin status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayStatus {
    pub status: String,
    pub uptime_seconds: u64,
    pub started_at: DateTime<Utc>,
    pub pool_size: usize,
    pub cursor: usize,
    pub upstreams: Vec<UpstreamStatsSnapshot>,
}
