pub mod rate_limit;
pub mod spam;
pub mod validate;

pub use rate_limit::RateLimiter;
pub use spam::SpamGuard;
pub use validate::validate_payload;
