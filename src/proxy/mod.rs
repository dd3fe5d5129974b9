//! Proxy Module
//!
//! The request handler (parse, fetch, write) and its router.

mod handler;
mod request;
mod routes;
mod writer;

pub use handler::{proxy_handler, ProxyOptions, ProxyState};
pub use request::{ProxyRequest, Tunneled};
pub use routes::create_proxy_router;
pub use writer::{ResponseWriter, VIA};
