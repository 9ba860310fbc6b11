//! Configuration for cm
//!
//! This crate handles:
//! - Global configuration (`~/.config/cm/config.toml`)
//! - devcontainer.json files (VSCode compatible), normalized into an
//!   [`EnvironmentConfig`] through the [`ConfigLoader`] trait

mod devcontainer;
mod error;
mod global;
mod loader;

pub use devcontainer::*;
pub use error::*;
pub use global::*;
pub use loader::*;
