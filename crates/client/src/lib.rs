//! Resilient outbound client for LLM hosts and executor endpoints.
//!
//! One dispatch attempt walks the router's candidate chain: per host it
//! retries with exponential backoff and jitter, feeds the per-host circuit
//! breaker, and finally falls back to the configured cloud endpoint for
//! model-inference task types.

mod breaker;
mod http;
mod resilient;
mod retry;

pub use breaker::BreakerRegistry;
pub use http::CallOutput;
pub use resilient::{CloudFallback, ResilientClient};
pub use retry::RetryPolicy;
