//! API Handlers
//!
//! Read-only handlers of the stats webserver.

use std::sync::Arc;

use axum::{extract::State, Json};

use crate::cache::{CacheStats, SharedCache};
use crate::models::{HealthResponse, StatsResponse};

/// State shared by the stats webserver handlers.
#[derive(Clone)]
pub struct AppState {
    pub stats: Arc<CacheStats>,
    pub cache: SharedCache,
}

impl AppState {
    pub fn new(stats: Arc<CacheStats>, cache: SharedCache) -> Self {
        Self { stats, cache }
    }
}

/// Handler for GET /stats
pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse::new(
        state.stats.snapshot(),
        state.cache.len(),
        state.cache.size(),
    ))
}

/// Handler for GET /health
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}
