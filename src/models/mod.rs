//! Response models for the stats webserver
//!
//! DTOs serialized by the `/health` and `/stats` endpoints.

pub mod responses;

pub use responses::{HealthResponse, StatsResponse};
