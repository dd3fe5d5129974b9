//! Proxy Routes
//!
//! Every request reaching the proxy listener is a proxied request, so the
//! router is a single fallback.

use axum::Router;
use tower_http::trace::TraceLayer;

use super::handler::{proxy_handler, ProxyState};

/// Creates the proxy router.
pub fn create_proxy_router(state: ProxyState) -> Router {
    Router::new()
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
