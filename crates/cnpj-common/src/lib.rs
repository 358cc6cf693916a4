//! CNPJ Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error type, logging setup, environment helpers and retry policy used
//! by the CNPJ ingestion workspace.
//!
//! # Example
//!
//! ```no_run
//! use cnpj_common::logging::{init_logging, LogConfig};
//! use cnpj_common::retry::RetryPolicy;
//!
//! # async fn example() -> anyhow::Result<()> {
//! init_logging(&LogConfig::from_env()?)?;
//!
//! let policy = RetryPolicy::fixed(3, std::time::Duration::from_secs(10));
//! let body = policy
//!     .run("fetch listing", || async { Ok::<_, std::io::Error>("<html/>") })
//!     .await?;
//! # let _ = body;
//! # Ok(())
//! # }
//! ```

pub mod env;
pub mod error;
pub mod logging;
pub mod retry;

pub use error::{CnpjError, Result};
