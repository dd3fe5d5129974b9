//! Background Tasks Module
//!
//! Contains background tasks that run periodically during server operation.
//!
//! # Tasks
//! - Janitor: expiry sweep and size-bounded eviction for a cache backend

mod janitor;

pub use janitor::{
    enforce_size, eviction_priority, spawn_janitor, sweep_expired, JanitorConfig, JanitorHandle,
};
