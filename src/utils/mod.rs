//! Shared utilities.

pub mod decimal;
pub mod retry;

pub use retry::{retry_with_backoff, RetryConfig};
