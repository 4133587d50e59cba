//! CLI command implementations

pub mod config;
pub mod resolve;
pub mod serve;

pub use config::execute as config;
pub use resolve::execute as resolve;
pub use serve::execute as serve;
