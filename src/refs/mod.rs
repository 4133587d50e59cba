//! Ref parsing and commit disambiguation
//!
//! A request names a ref by kind and identifier. Branch and pull request
//! identifiers are used as-is; commit identifiers may be abbreviated and are
//! expanded to a full hash by a [`RefResolver`] before they become build keys.

pub mod parse;
pub mod resolve;

pub use parse::{parse_request_path, validate_commit, RefPolicy, RefRequest};
pub use resolve::{resolve_commit, CommitRef, GitResolver, RefResolver};

use std::fmt;

/// Length of a full commit hash
pub const FULL_HASH_LEN: usize = 40;

/// Kind of ref named by a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefKind {
    /// Branch name, mutable
    Branch,
    /// Commit hash, immutable once built
    Commit,
    /// Pull request number, mutable
    Pull,
}

impl RefKind {
    /// Path segment naming this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Branch => "branch",
            Self::Commit => "commit",
            Self::Pull => "pull",
        }
    }

    /// Look up a kind by its path segment
    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "branch" => Some(Self::Branch),
            "commit" => Some(Self::Commit),
            "pull" => Some(Self::Pull),
            _ => None,
        }
    }

    /// Whether builds of this kind can go stale
    pub fn is_mutable(&self) -> bool {
        !matches!(self, Self::Commit)
    }
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
