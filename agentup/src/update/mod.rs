//! Release server, package transport, and archive handling.
//!
//! These are the production implementations of the orchestrator's
//! [`VersionSource`](agentup_core::VersionSource),
//! [`PackageFetcher`](agentup_core::PackageFetcher), and
//! [`ArchiveExtractor`](agentup_core::ArchiveExtractor) seams.

pub mod downloader;
pub mod extract;
pub mod manifest;
pub mod source;

pub use downloader::HttpPackageFetcher;
pub use extract::TarExtractor;
pub use source::HttpVersionSource;
