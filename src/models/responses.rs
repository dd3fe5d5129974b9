//! Response DTOs for the stats webserver

use serde::Serialize;

use crate::cache::StatsSnapshot;

/// Response body for the stats endpoint (GET /stats)
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    /// Counters and gauges of the cache core
    #[serde(flatten)]
    pub stats: StatsSnapshot,
    /// Current number of entries in the backend
    pub entries: usize,
    /// Sum of entry sizes reported by the backend
    pub size_bytes: i64,
}

impl StatsResponse {
    pub fn new(stats: StatsSnapshot, entries: usize, size_bytes: i64) -> Self {
        Self {
            stats,
            entries,
            size_bytes,
        }
    }
}

/// Response body for the health endpoint (GET /health)
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Health status (e.g., "healthy")
    pub status: String,
    /// Current timestamp in ISO 8601 format
    pub timestamp: String,
}

impl HealthResponse {
    /// Creates a new HealthResponse with current timestamp
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}
