//! Error types for previewd
//!
//! All modules use `PreviewResult<T>` as their return type. Request-facing
//! variants map onto an HTTP status through [`PreviewError::status`].

use axum::http::StatusCode;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for previewd operations
pub type PreviewResult<T> = Result<T, PreviewError>;

/// All errors that can occur in previewd
#[derive(Error, Debug)]
pub enum PreviewError {
    // Request errors
    #[error("{0}")]
    Validation(String),

    #[error("Ambiguous commit abbreviation: {prefix}")]
    AmbiguousRef {
        prefix: String,
        candidates: Vec<String>,
    },

    #[error("No such commit: {0}")]
    UnknownRef(String),

    #[error("404 Not Found: {0}")]
    NotFound(String),

    // Build errors
    #[error("Build failed for {key}")]
    BuildFailed { key: String, log: String },

    #[error("Could not resolve commit {prefix}")]
    ResolveFailed { prefix: String, log: String },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PreviewError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// HTTP status reported to the requester
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::AmbiguousRef { .. } => StatusCode::MULTIPLE_CHOICES,
            Self::UnknownRef(_) | Self::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Response body for the requester
    ///
    /// Build and resolution failures carry the combined command log; the
    /// service is an internal tool so the full output is returned.
    pub fn body(&self) -> String {
        match self {
            Self::AmbiguousRef { candidates, .. } => {
                let mut body = candidates.join("\n");
                body.push('\n');
                body
            }
            Self::BuildFailed { log, .. } | Self::ResolveFailed { log, .. } => log.clone(),
            _ => self.to_string(),
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ConfigInvalid { .. } => Some("Run: previewd config init --force"),
            Self::ResolveFailed { .. } => Some("Check repo.git_dir points at a git repository"),
            _ => None,
        }
    }
}
