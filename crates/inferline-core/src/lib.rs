//! inferline-core — shared types for the inferline serving core.
//!
//! Holds the static [`ServeConfig`] consumed at startup, the request and
//! snapshot types passed between components, and the [`ServeError`]
//! taxonomy reported to callers.

pub mod config;
pub mod error;
pub mod types;

pub use config::{ServeConfig, parse_duration};
pub use error::{ConfigError, ServeError};
pub use types::*;
