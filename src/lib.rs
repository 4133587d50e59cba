//! previewd - on-demand preview builds
//!
//! Builds a branch, commit or pull request the first time it is requested
//! and serves the output, with at most one build in flight per ref.

pub mod artifact;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod journal;
pub mod refs;
pub mod runner;
pub mod server;

pub use error::{PreviewError, PreviewResult};
