//! # agentup Common
//!
//! Shared utilities for the agentup crates.
//!
//! ```rust,ignore
//! use agentup_common::{init_logging, LogFormat};
//!
//! init_logging("info", LogFormat::Pretty).unwrap();
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, init_logging_pretty, LogFormat};
