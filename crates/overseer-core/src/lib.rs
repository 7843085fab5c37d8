//! # Overseer Core
//!
//! Shared configuration and error types used by every Overseer crate.

pub mod config;
pub mod error;
pub mod time;

pub use config::OverseerConfig;
pub use error::{OverseerError, Result};
