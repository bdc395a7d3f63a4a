//! # Larder Common Library
//!
//! Shared code for the larder maintenance tools:
//! - Common error type
//! - Configuration file discovery, loading and env overrides
//! - Tracing subscriber initialisation

pub mod config;
pub mod error;
pub mod logging;

pub use error::{Error, Result};
