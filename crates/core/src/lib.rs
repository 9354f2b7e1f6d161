//! Core utilities for frameflight.
//!
//! This crate provides foundational types used across the workspace:
//! - Error types and result aliases
//! - Logging initialization
//! - Configuration management

mod config;
mod error;
mod logging;

pub use config::{BackendKind, RenderConfig};
pub use error::{Error, Result};
pub use logging::{init_logging, try_init_logging};
