//! The dispatcher: drains the ledger's ready queue, routes each task to a
//! host, bounds per-host parallelism with semaphores, and commits results
//! back through the ledger's transactional API.

mod controller;
mod handlers;
mod pool;
mod router;

pub use controller::Dispatcher;
pub use handlers::{HandlerContext, HandlerRegistry, TaskHandler};
pub use pool::{HostPool, HostPoolStatus};
pub use router::Router;
