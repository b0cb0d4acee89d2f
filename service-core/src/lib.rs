//! service-core: shared HTTP infrastructure for the discharge service.
pub mod config;
pub mod error;
pub mod middleware;
pub mod observability;

pub use axum;
pub use serde_json;
pub use tokio;
pub use tower_http;
pub use tracing;
