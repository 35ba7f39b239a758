//! Dispatcher observability: a line-delimited JSON event stream, a
//! Prometheus-compatible metrics collector, and an error tracker that
//! captures full failure context for post-mortems.

mod error_tracker;
mod events;
mod metrics;
mod server;

pub use error_tracker::{ErrorContext, ErrorTracker};
pub use events::{event, Event, EventLog};
pub use metrics::MetricsCollector;
pub use server::MetricsServer;
