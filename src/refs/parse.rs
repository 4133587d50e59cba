//! Request path parsing and ref validation

use crate::config::schema::CoordinatorConfig;
use crate::error::{PreviewError, PreviewResult};
use crate::refs::{RefKind, FULL_HASH_LEN};
use percent_encoding::percent_decode_str;

/// Validation knobs taken from configuration
#[derive(Debug, Clone, Copy)]
pub struct RefPolicy {
    /// Shortest accepted commit abbreviation
    pub min_abbrev_len: usize,
}

impl From<&CoordinatorConfig> for RefPolicy {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            min_abbrev_len: config.min_abbrev_len,
        }
    }
}

impl Default for RefPolicy {
    fn default() -> Self {
        Self { min_abbrev_len: 4 }
    }
}

/// A validated request for a ref
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefRequest {
    /// Ref kind from the first path segment
    pub kind: RefKind,
    /// Percent-decoded identifier
    pub id: String,
    /// Remainder of the path, served from the build output (empty or `/...`)
    pub rest: String,
}

/// Split `/<kind>/<identifier>[/<rest>]` and validate the identifier
pub fn parse_request_path(path: &str, policy: &RefPolicy) -> PreviewResult<RefRequest> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let (segment, tail) = trimmed.split_once('/').unwrap_or((trimmed, ""));

    let kind =
        RefKind::from_segment(segment).ok_or_else(|| PreviewError::NotFound(path.to_string()))?;

    let (raw_id, rest) = match tail.find('/') {
        Some(idx) => (&tail[..idx], &tail[idx..]),
        None => (tail, ""),
    };

    let id = percent_decode_str(raw_id)
        .decode_utf8()
        .map_err(|_| PreviewError::Validation(format!("Invalid encoding in {} name", kind)))?
        .into_owned();

    if id.is_empty() {
        return Err(PreviewError::Validation(format!("Missing {} name", kind)));
    }

    match kind {
        RefKind::Commit => validate_commit(&id, policy)?,
        RefKind::Pull => validate_pull(&id)?,
        RefKind::Branch => validate_branch(&id)?,
    }

    Ok(RefRequest {
        kind,
        id,
        rest: rest.to_string(),
    })
}

/// Check that `id` is a lowercase hex hash or an acceptable abbreviation of one
pub fn validate_commit(id: &str, policy: &RefPolicy) -> PreviewResult<()> {
    let is_hex = id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    if !is_hex || id.len() > FULL_HASH_LEN {
        return Err(PreviewError::Validation(format!("Invalid commit hash: {}", id)));
    }
    if id.len() < policy.min_abbrev_len {
        return Err(PreviewError::Validation(format!(
            "Commit hash abbreviation too short: {}",
            id
        )));
    }
    Ok(())
}

fn validate_pull(id: &str) -> PreviewResult<()> {
    if !id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PreviewError::Validation(format!(
            "Invalid pull request number: {}",
            id
        )));
    }
    Ok(())
}

// Branch names end up as git arguments and directory names.
fn validate_branch(id: &str) -> PreviewResult<()> {
    if id.starts_with('-') || id == "." || id == ".." || id.contains('\0') {
        return Err(PreviewError::Validation(format!("Invalid branch name: {}", id)));
    }
    Ok(())
}
