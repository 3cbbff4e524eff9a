//! CCW Pipeline Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling and logging for the CCW pipeline workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`PipelineError`] and the [`Result`] alias used by every
//!   component that talks to the object store
//! - **Logging**: environment-driven `tracing` initialisation
//!
//! # Example
//!
//! ```no_run
//! use ccw_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!("pipeline starting");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

pub use error::{PipelineError, Result};
