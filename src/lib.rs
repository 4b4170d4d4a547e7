#![forbid(unsafe_code)]

//! Incremental YouTube channel archiver.
//!
//! The library holds the archiving engine: channel resolution and caching,
//! uploads enumeration, video selectors, the download worker pool, and the
//! startup disk reconciliation. The `ytarchiver` binary wraps it in a
//! scheduling loop.

pub mod api;
pub mod archiver;
pub mod channel;
pub mod config;
pub mod download;
pub mod error;
pub mod logging;
pub mod pool;
pub mod preflight;
pub mod reconcile;
pub mod selector;

pub use archiver::{Archiver, ChannelTarget};
pub use config::{ArchiverConfig, RetryPolicy};
pub use error::{ArchiveError, StartupError};
