pub mod metrics;
pub mod rate_limit;
pub mod security_headers;
pub mod tracing;

pub use metrics::metrics_middleware;
pub use rate_limit::{LoginRateLimiter, create_login_rate_limiter, login_rate_limit_middleware};
pub use security_headers::security_headers_middleware;
pub use tracing::request_id_middleware;
