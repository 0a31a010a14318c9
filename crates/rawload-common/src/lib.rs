//! rawload common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared logging setup, error types and environment helpers for the rawload
//! workspace.
//!
//! # Overview
//!
//! - **Logging**: `tracing` subscriber initialization driven by `LOG_*` variables
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Environment**: typed lookups that collect every missing variable at once
//!
//! # Example
//!
//! ```no_run
//! use rawload_common::env::EnvReader;
//! use rawload_common::Result;
//!
//! fn bucket() -> Result<String> {
//!     let mut env = EnvReader::new();
//!     let bucket = env.required("S3_BUCKET");
//!     env.finish()?;
//!     Ok(bucket.unwrap_or_default())
//! }
//! ```

pub mod env;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
