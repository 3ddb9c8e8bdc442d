//! Shared types for the marketing API gateway workspace
//!
//! Holds the configuration error type used by every loader and the `Secret`
//! wrapper that keeps the upstream access token out of logs.

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::{Secret, load_secret};
