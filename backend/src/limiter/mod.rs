pub mod middleware;
pub mod window;

pub use middleware::RateLimitMiddleware;
pub use window::{RateLimit, RateLimited};
