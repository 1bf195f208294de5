pub mod cli;
pub mod config;
pub mod control;
pub mod daemon;
pub mod dns;
pub mod filter;
pub mod models;
pub mod stats;
pub mod sync;
pub mod utils;

pub use filter::engine::{BlockReason, Decision, FlowTarget, PolicyEngine};
pub use sync::snapshot::{PolicySnapshot, SnapshotSlot};
