//! cabflow common library
//!
//! Shared plumbing for the cabflow workspace:
//!
//! - **Logging**: `tracing` subscriber setup driven by `LOG_*` variables
//! - **Environment**: typed lookups of environment variables with defaults
//! - **Errors**: the error type those helpers return
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod env;
pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
