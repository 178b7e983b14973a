//! HTTP server for health checks, stats and benchmark export
//!
//! Provides a lightweight status API over the running controller.

pub mod http_server;
pub use http_server::{router, run_http_server};
