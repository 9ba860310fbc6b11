//! Core logic for cm environment lifecycle management
//!
//! This crate provides:
//! - The environment entity and its lifecycle state machine
//! - A crash-safe JSON ledger of environments and the active pointer
//! - Per-environment networks and explicit linking between environments
//! - The environment manager orchestrating runtime, ledger and networks

mod container;
mod environment;
mod error;
mod manager;
mod network;
mod state;

pub use container::*;
pub use environment::*;
pub use error::*;
pub use manager::*;
pub use network::*;
pub use state::*;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
