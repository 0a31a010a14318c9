//! rawload
//!
//! Loads a fixed catalog of raw CSV datasets from an object storage prefix
//! into PostgreSQL tables, parents before children.
//!
//! # Overview
//!
//! - **Catalog** ([`catalog`]): datasets, their tables, columns and parents
//! - **Resolver** ([`resolver`]): deterministic dependency-respecting load order
//! - **Schema** ([`schema`]): creates (or recreates) the managed tables
//! - **Detector** ([`detector`]): row-count based skip/replace decision
//! - **Loader** ([`loader`]): transactional clear-and-insert of one table
//! - **Pipeline** ([`pipeline`]): sequences a run and produces a summary
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use rawload::catalog::olist_catalog;
//! use rawload::config::Config;
//! use rawload::pipeline::{Pipeline, PipelineOptions};
//! use rawload::store::{PgDestination, S3ObjectSource};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let source = S3ObjectSource::new(&config.storage);
//!     let destination = PgDestination::connect(&config.database).await?;
//!
//!     let pipeline = Pipeline::new(
//!         Arc::new(olist_catalog()?),
//!         Arc::new(source),
//!         Arc::new(destination),
//!         PipelineOptions::from_config(&config, false),
//!     );
//!     let summary = pipeline.run(&CancellationToken::new()).await;
//!     println!("{}", summary.render_text());
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod catalog;
pub mod cli;
pub mod config;
pub mod detector;
pub mod error;
pub mod loader;
pub mod pipeline;
pub mod records;
pub mod resolver;
pub mod schema;
pub mod source;
pub mod store;

pub use error::{LoadError, Result};
