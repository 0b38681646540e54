//! # cask-common
//!
//! Shared utilities and types for the cask volume subsystem.
//!
//! This crate provides common functionality used across all cask crates:
//! - The [`CaskError`] taxonomy and [`CaskResult`] alias
//! - Random identifier generation
//! - Standard filesystem paths
//! - External tool invocation ([`CommandRunner`])

#![warn(missing_docs)]

pub mod error;
pub mod exec;
pub mod id;
pub mod paths;

pub use error::{CaskError, CaskResult};
pub use exec::{CommandRunner, ScriptedRunner, SystemRunner, ToolOutput};
pub use paths::CaskPaths;
