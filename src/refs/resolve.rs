//! Commit abbreviation resolution
//!
//! Expands an abbreviated hash to the full hash of the single commit it
//! names, or reports that it names none or several.

use crate::error::{PreviewError, PreviewResult};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Source of commit hashes matching a prefix
#[async_trait]
pub trait RefResolver: Send + Sync {
    /// All commit hashes starting with `prefix`
    async fn candidates(&self, prefix: &str) -> PreviewResult<Vec<String>>;
}

/// Outcome of a successful resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitRef {
    /// The request already used the full hash
    Exact(String),
    /// The request used an abbreviation of this hash
    Redirect(String),
}

impl CommitRef {
    /// The canonical hash
    pub fn hash(&self) -> &str {
        match self {
            Self::Exact(hash) | Self::Redirect(hash) => hash,
        }
    }
}

/// Resolve `prefix` to exactly one commit
pub async fn resolve_commit(resolver: &dyn RefResolver, prefix: &str) -> PreviewResult<CommitRef> {
    let mut candidates = resolver.candidates(prefix).await?;

    match candidates.len() {
        0 => Err(PreviewError::UnknownRef(prefix.to_string())),
        1 => {
            let hash = candidates.remove(0);
            if hash == prefix {
                Ok(CommitRef::Exact(hash))
            } else {
                Ok(CommitRef::Redirect(hash))
            }
        }
        _ => {
            candidates.sort();
            Err(PreviewError::AmbiguousRef {
                prefix: prefix.to_string(),
                candidates,
            })
        }
    }
}

/// Resolver backed by the shared git clone
pub struct GitResolver {
    git: String,
    git_dir: PathBuf,
}

impl GitResolver {
    /// Create a resolver running `git` in `git_dir`
    pub fn new(git: impl Into<String>, git_dir: impl Into<PathBuf>) -> Self {
        Self {
            git: git.into(),
            git_dir: git_dir.into(),
        }
    }

    /// Every object whose hash starts with `prefix`, of any type
    async fn disambiguate(&self, prefix: &str) -> PreviewResult<Vec<String>> {
        let arg = format!("--disambiguate={}", prefix);
        debug!("Executing: {} rev-parse {}", self.git, arg);

        let output = Command::new(&self.git)
            .args(["rev-parse", &arg])
            .current_dir(&self.git_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| PreviewError::command_failed(format!("{} rev-parse", self.git), e))?;

        if !output.status.success() {
            return Err(PreviewError::ResolveFailed {
                prefix: prefix.to_string(),
                log: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Keep only the hashes that name commits
    async fn commits_only(&self, prefix: &str, objects: Vec<String>) -> PreviewResult<Vec<String>> {
        let mut child = Command::new(&self.git)
            .args(["cat-file", "--batch-check"])
            .current_dir(&self.git_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| PreviewError::command_failed(format!("{} cat-file", self.git), e))?;

        let mut input = objects.join("\n");
        input.push('\n');

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| PreviewError::Internal("cat-file stdin not piped".to_string()))?;
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(|e| PreviewError::io("writing to git cat-file", e))?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| PreviewError::command_failed(format!("{} cat-file", self.git), e))?;

        if !output.status.success() {
            return Err(PreviewError::ResolveFailed {
                prefix: prefix.to_string(),
                log: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        Ok(parse_batch_check(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[async_trait]
impl RefResolver for GitResolver {
    async fn candidates(&self, prefix: &str) -> PreviewResult<Vec<String>> {
        let objects = self.disambiguate(prefix).await?;
        if objects.is_empty() {
            return Ok(objects);
        }
        self.commits_only(prefix, objects).await
    }
}

/// Parse `<hash> <type> <size>` lines, keeping commits
fn parse_batch_check(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let hash = fields.next()?;
            (fields.next()? == "commit").then(|| hash.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedResolver(Vec<&'static str>);

    #[async_trait]
    impl RefResolver for FixedResolver {
        async fn candidates(&self, prefix: &str) -> PreviewResult<Vec<String>> {
            Ok(self
                .0
                .iter()
                .filter(|hash| hash.starts_with(prefix))
                .map(|hash| hash.to_string())
                .collect())
        }
    }

    const A: &str = "abcd000000000000000000000000000000000001";
    const B: &str = "abcd000000000000000000000000000000000002";
    const C: &str = "1234567890123456789012345678901234567890";

    #[tokio::test]
    async fn no_match_is_unknown() {
        let resolver = FixedResolver(vec![A]);
        let err = resolve_commit(&resolver, "0000").await.unwrap_err();
        assert_eq!(err.to_string(), "No such commit: 0000");
    }

    #[tokio::test]
    async fn several_matches_are_ambiguous() {
        let resolver = FixedResolver(vec![B, A, C]);
        match resolve_commit(&resolver, "abcd").await.unwrap_err() {
            PreviewError::AmbiguousRef { prefix, candidates } => {
                assert_eq!(prefix, "abcd");
                assert_eq!(candidates, vec![A.to_string(), B.to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn abbreviation_redirects() {
        let resolver = FixedResolver(vec![A, C]);
        let resolved = resolve_commit(&resolver, "1234").await.unwrap();
        assert_eq!(resolved, CommitRef::Redirect(C.to_string()));
        assert_eq!(resolved.hash(), C);
    }

    #[tokio::test]
    async fn full_hash_is_exact() {
        let resolver = FixedResolver(vec![A, C]);
        let resolved = resolve_commit(&resolver, C).await.unwrap();
        assert_eq!(resolved, CommitRef::Exact(C.to_string()));
    }

    #[test]
    fn batch_check_keeps_commits() {
        let output = format!("{A} commit 210\n{B} tree 33\n{C} missing\n");
        assert_eq!(parse_batch_check(&output), vec![A.to_string()]);
    }

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn git(dir: &std::path::Path, args: &[&str]) -> String {
        let output = std::process::Command::new("git")
            .args(["-c", "user.name=test", "-c", "user.email=test@example.com"])
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(output.status.success(), "git {:?} failed", args);
        String::from_utf8(output.stdout).unwrap().trim().to_string()
    }

    #[tokio::test]
    async fn git_resolver_expands_abbreviation() {
        if !git_available() {
            return;
        }
        let temp = tempfile::TempDir::new().unwrap();
        git(temp.path(), &["init", "-q"]);
        git(temp.path(), &["commit", "-q", "--allow-empty", "-m", "first"]);
        let head = git(temp.path(), &["rev-parse", "HEAD"]);

        let resolver = GitResolver::new("git", temp.path());
        let resolved = resolve_commit(&resolver, &head[..10]).await.unwrap();
        assert_eq!(resolved, CommitRef::Redirect(head.clone()));

        let resolved = resolve_commit(&resolver, &head).await.unwrap();
        assert_eq!(resolved, CommitRef::Exact(head));
    }

    #[tokio::test]
    async fn git_resolver_rejects_trees() {
        if !git_available() {
            return;
        }
        let temp = tempfile::TempDir::new().unwrap();
        git(temp.path(), &["init", "-q"]);
        git(temp.path(), &["commit", "-q", "--allow-empty", "-m", "first"]);
        let tree = git(temp.path(), &["rev-parse", "HEAD^{tree}"]);

        let resolver = GitResolver::new("git", temp.path());
        assert!(matches!(
            resolve_commit(&resolver, &tree).await,
            Err(PreviewError::UnknownRef(_))
        ));
    }
}
