//! Utility modules
//!
//! Retry with backoff, deadlines, and log-safe string helpers.

pub mod retry;
pub mod string;
pub mod timeout;

pub use retry::{retry_with_backoff, RetryConfig, RetryResult};
pub use string::{mask_secret, truncate_str};
pub use timeout::{with_timeout, TimeoutError};
