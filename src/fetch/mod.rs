//! Fetch Module
//!
//! Upstream client, the single-flight group and the coordinator that decides
//! between the store and the origin.

mod coordinator;
pub mod singleflight;
mod upstream;

pub use coordinator::{BodyStream, DirectResponse, FetchInfo, FetchResult, Fetcher};
pub use singleflight::{Abandoned, Group, Joined};
pub use upstream::Upstream;
