//! Shared identifiers, the node id error, and time helpers used across all cadence crates.

pub mod error;
pub mod ids;
pub mod time;

pub use {
    error::{Error, Result},
    ids::{JobId, NodeId},
};
