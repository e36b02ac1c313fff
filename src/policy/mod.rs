pub mod cors;
pub mod headers;
pub mod rate_limit;

pub use cors::CorsPolicy;
pub use rate_limit::{FixedWindowLimiter, RateLimitDecision, RateLimitStore};
