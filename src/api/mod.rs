//! API Module
//!
//! The optional stats webserver, bound on its own listener.
//!
//! # Endpoints
//! - `GET /stats` - Cache counters, entry count and stored bytes
//! - `GET /health` - Health check endpoint

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;
