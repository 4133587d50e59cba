//! Checkout and build pipelines
//!
//! Every build key gets its own git worktree under `repo.worktree_root`,
//! added from the shared clone in `repo.git_dir`. A full pipeline creates the
//! worktree and builds it; a refresh fetches the ref again, resets the
//! worktree onto it and rebuilds incrementally.
//!
//! Creating the worktree directory is an exclusive filesystem operation. If
//! the directory is already there when a full build starts, it was left by an
//! earlier process and its contents are adopted instead of rebuilt.

use crate::config::Config;
use crate::coordinator::state::BuildTarget;
use crate::error::{PreviewError, PreviewResult};
use crate::journal::Journal;
use crate::refs::RefKind;
use crate::runner::{BuildOutcome, BuildRunner, BuildStep};
use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tokio::process::Command;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Characters escaped when a ref identifier becomes a directory name
const DIR_NAME: &AsciiSet = &CONTROLS.add(b'/').add(b'\\').add(b'%');

/// Which pipeline a build runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    /// Checkout and build from scratch
    Full,
    /// Fetch, reset and rebuild an existing worktree
    Refresh,
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Refresh => write!(f, "refresh"),
        }
    }
}

/// How a pipeline ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineReport {
    /// Every step succeeded
    Built,
    /// Output from an earlier process was found and kept
    Adopted,
    /// A step failed or could not be started
    Failed {
        exit_code: Option<i32>,
        log: String,
    },
}

/// Steps sharing a working directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub working_dir: PathBuf,
    pub steps: Vec<BuildStep>,
}

/// Ordered stages; execution stops at the first failing step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
}

impl Pipeline {
    fn stage(mut self, working_dir: &Path, steps: Vec<BuildStep>) -> Self {
        if !steps.is_empty() {
            self.stages.push(Stage {
                working_dir: working_dir.to_path_buf(),
                steps,
            });
        }
        self
    }

    /// Run every stage, concatenating the logs
    pub async fn execute(&self, runner: &dyn BuildRunner) -> PipelineReport {
        let mut log = String::new();

        for stage in &self.stages {
            match runner.run(&stage.working_dir, &stage.steps).await {
                Ok(outcome) => {
                    log.push_str(outcome.log());
                    if let BuildOutcome::Failure { exit_code, .. } = outcome {
                        return PipelineReport::Failed {
                            exit_code: Some(exit_code),
                            log,
                        };
                    }
                }
                Err(e) => {
                    log.push_str(&format!("{}\n", e));
                    if let Some(source) = std::error::Error::source(&e) {
                        log.push_str(&format!("  caused by: {}\n", source));
                    }
                    return PipelineReport::Failed {
                        exit_code: None,
                        log,
                    };
                }
            }
        }

        PipelineReport::Built
    }
}

/// Result of claiming a worktree directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The directory was created by this call
    Created,
    /// The directory already existed
    Existing,
}

/// Worktree layout and git command templates
#[derive(Debug, Clone)]
pub struct Workspace {
    git: String,
    git_dir: PathBuf,
    worktree_root: PathBuf,
    remote: String,
    build_steps: Vec<BuildStep>,
    rebuild_on_refresh: bool,
}

impl Workspace {
    pub fn from_config(config: &Config) -> Self {
        Self {
            git: config.repo.git.clone(),
            git_dir: config.repo.git_dir.clone(),
            worktree_root: config.repo.worktree_root.clone(),
            remote: config.repo.remote.clone(),
            build_steps: config.build.steps.iter().map(BuildStep::from).collect(),
            rebuild_on_refresh: config.build.rebuild_on_refresh,
        }
    }

    /// Directory holding the worktree (and build output) for `target`
    pub fn worktree_path(&self, target: &BuildTarget) -> PathBuf {
        let name = utf8_percent_encode(&target.id, DIR_NAME).to_string();
        self.worktree_root.join(target.kind.as_str()).join(name)
    }

    fn git<I, S>(&self, args: I) -> BuildStep
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        BuildStep::new(self.git.clone(), args)
    }

    /// Remote-tracking ref a mutable target is fetched into
    fn tracking_ref(&self, target: &BuildTarget) -> String {
        match target.kind {
            RefKind::Pull => format!("refs/remotes/{}/pull/{}", self.remote, target.id),
            _ => format!("refs/remotes/{}/{}", self.remote, target.id),
        }
    }

    fn fetch(&self, target: &BuildTarget) -> BuildStep {
        let source = match target.kind {
            RefKind::Pull => format!("refs/pull/{}/head", target.id),
            _ => format!("refs/heads/{}", target.id),
        };
        self.git([
            "fetch".to_string(),
            "--no-write-fetch-head".to_string(),
            self.remote.clone(),
            format!("+{}:{}", source, self.tracking_ref(target)),
        ])
    }

    /// Commands for `kind` of build of `target`
    pub fn pipeline(&self, target: &BuildTarget, kind: PipelineKind) -> Pipeline {
        let worktree = self.worktree_path(target);
        let worktree_arg = worktree.display().to_string();

        match (kind, target.kind) {
            (PipelineKind::Full, RefKind::Commit) => Pipeline::default()
                .stage(
                    &self.git_dir,
                    vec![self.git([
                        "worktree",
                        "add",
                        "--detach",
                        worktree_arg.as_str(),
                        target.id.as_str(),
                    ])],
                )
                .stage(&worktree, self.build_steps.clone()),
            (PipelineKind::Full, _) => {
                let tracking = self.tracking_ref(target);
                Pipeline::default()
                    .stage(
                        &self.git_dir,
                        vec![
                            self.fetch(target),
                            self.git([
                                "worktree",
                                "add",
                                "--detach",
                                worktree_arg.as_str(),
                                tracking.as_str(),
                            ]),
                        ],
                    )
                    .stage(&worktree, self.build_steps.clone())
            }
            // Commits are immutable; there is nothing to refresh
            (PipelineKind::Refresh, RefKind::Commit) => Pipeline::default(),
            (PipelineKind::Refresh, _) => {
                let tracking = self.tracking_ref(target);
                let rebuild = if self.rebuild_on_refresh {
                    self.build_steps.clone()
                } else {
                    Vec::new()
                };
                Pipeline::default()
                    .stage(
                        &worktree,
                        vec![
                            self.fetch(target),
                            self.git(["reset", "--hard", tracking.as_str()]),
                        ],
                    )
                    .stage(&worktree, rebuild)
            }
        }
    }

    /// Exclusively create the worktree directory for `target`
    pub async fn claim(&self, target: &BuildTarget) -> PreviewResult<Claim> {
        let path = self.worktree_path(target);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| PreviewError::io(format!("creating {}", parent.display()), e))?;
        }

        match fs::create_dir(&path).await {
            Ok(()) => Ok(Claim::Created),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(Claim::Existing),
            Err(e) => Err(PreviewError::io(format!("creating {}", path.display()), e)),
        }
    }

    /// Remove a failed worktree so the next request starts clean
    pub async fn discard(&self, target: &BuildTarget) {
        let path = self.worktree_path(target);
        if let Err(e) = fs::remove_dir_all(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove worktree {}: {}", path.display(), e);
            }
        }

        let pruned = Command::new(&self.git)
            .args(["worktree", "prune"])
            .current_dir(&self.git_dir)
            .output()
            .await;
        match pruned {
            Ok(output) if output.status.success() => {}
            Ok(output) => warn!(
                "git worktree prune failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => warn!("git worktree prune failed: {}", e),
        }
    }
}

/// Produces build output for targets
#[async_trait]
pub trait Builder: Send + Sync {
    /// Directory artifacts for `target` are served from
    fn artifact_root(&self, target: &BuildTarget) -> PathBuf;

    /// Run the `kind` pipeline for `target` to completion
    async fn build(&self, target: &BuildTarget, kind: PipelineKind) -> PipelineReport;
}

/// Builder running git and the configured build steps
pub struct GitBuilder {
    workspace: Workspace,
    runner: Arc<dyn BuildRunner>,
    journal: Journal,
}

impl GitBuilder {
    pub fn new(workspace: Workspace, runner: Arc<dyn BuildRunner>, journal: Journal) -> Self {
        Self {
            workspace,
            runner,
            journal,
        }
    }

    async fn run(&self, target: &BuildTarget, kind: PipelineKind) -> PipelineReport {
        let key = target.key();

        if kind == PipelineKind::Full {
            match self.workspace.claim(target).await {
                Ok(Claim::Created) => {}
                Ok(Claim::Existing) => {
                    info!("Adopting existing build output for {}", key);
                    return PipelineReport::Adopted;
                }
                Err(e) => {
                    return PipelineReport::Failed {
                        exit_code: None,
                        log: format!("{}\n", e),
                    };
                }
            }
        }

        let report = self
            .workspace
            .pipeline(target, kind)
            .execute(self.runner.as_ref())
            .await;

        if kind == PipelineKind::Full && matches!(report, PipelineReport::Failed { .. }) {
            self.workspace.discard(target).await;
        }
        report
    }
}

#[async_trait]
impl Builder for GitBuilder {
    fn artifact_root(&self, target: &BuildTarget) -> PathBuf {
        self.workspace.worktree_path(target)
    }

    async fn build(&self, target: &BuildTarget, kind: PipelineKind) -> PipelineReport {
        let key = target.key();
        let build_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        self.journal
            .log(
                "build.started",
                &serde_json::json!({
                    "build_id": build_id,
                    "key": key.to_string(),
                    "kind": target.kind.as_str(),
                    "pipeline": kind.to_string(),
                }),
            )
            .await;

        let span = info_span!("build", key = %key, pipeline = %kind);
        let report = self.run(target, kind).instrument(span).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let (event, exit_code) = match (&report, kind) {
            (PipelineReport::Built, _) => ("build.succeeded", None),
            (PipelineReport::Adopted, _) => ("build.adopted", None),
            (PipelineReport::Failed { exit_code, .. }, PipelineKind::Full) => {
                ("build.failed", *exit_code)
            }
            (PipelineReport::Failed { exit_code, .. }, PipelineKind::Refresh) => {
                ("refresh.failed", *exit_code)
            }
        };
        info!("{} {} pipeline for {} in {}ms", event, kind, key, elapsed_ms);

        self.journal
            .log(
                event,
                &serde_json::json!({
                    "build_id": build_id,
                    "key": key.to_string(),
                    "exit_code": exit_code,
                    "elapsed_ms": elapsed_ms,
                }),
            )
            .await;

        report
    }
}
