pub mod categories;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod log_sanitize;
pub mod logging;
pub mod ops;
pub mod snapshots;
pub mod storage;

pub use error::{Error, Result};
