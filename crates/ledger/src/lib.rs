//! Durable task ledger backed by a single SQLite file.
//!
//! The ledger is the source of truth for the dispatcher: every status
//! transition runs inside an immediate-write transaction that also appends
//! one audit row, so a crash at any point reopens consistent. WAL mode
//! keeps concurrent read-only observers safe while the dispatcher writes.

mod interchange;
mod mapping;
mod store;

pub use store::{Ledger, TaskUpdate, MAX_FIELD_BYTES};
