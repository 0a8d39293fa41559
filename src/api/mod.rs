//! Dashboard HTTP surface
//!
//! Thin read-only view over the pipeline metrics plus the embedded
//! monitoring page.

mod routes;

pub use routes::{router, serve, serve_with_listener, ApiState};
