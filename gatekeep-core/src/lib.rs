//! Gatekeep Core - Core data structures and trait definitions
//!
//! This crate defines the shared abstractions of the Gatekeep authorization
//! engine: domain types, the error model, collaborator traits (entity store,
//! audit sink, clock), logging setup and engine configuration.

pub mod async_utils;
pub mod config;
pub mod error;
pub mod logging;
pub mod traits;
pub mod types;

pub use async_utils::*;
pub use config::*;
pub use error::*;
pub use logging::*;
pub use traits::*;
pub use types::*;

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use tokio;
pub use tracing;
