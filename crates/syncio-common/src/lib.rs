//! SyncIO Common - Shared types and utilities
//!
//! This crate provides common types, error definitions, and configuration
//! structures used across all SyncIO components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{HealthConfig, SyncConfig};
pub use error::{Error, Result};
pub use types::*;
