//! Producer election and completion tracking

pub mod sentinel;

pub use sentinel::{JoinOutcome, SentinelRegistry, SentinelState};
