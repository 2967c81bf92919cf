//! 限流：令牌桶与读写分离的双桶限流器

pub mod bucket;
pub mod dual;

pub use bucket::{RateLimiter, RateLimiterStatus};
pub use dual::{DualRateLimiter, DualRateLimiterStatus};
