pub mod audit;
pub mod host;
pub mod task;

pub use audit::AuditEntry;
pub use host::{Capability, CircuitState, HostDescriptor};
pub use task::{Task, TaskStatus};
