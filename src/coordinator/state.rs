//! Per-key build state and the transitions between states
//!
//! The registry is a plain data structure: every decision the dispatcher
//! makes is a method call here, so the state machine can be exercised
//! without a runtime.

use crate::config::RefreshFailurePolicy;
use crate::coordinator::pipeline::{PipelineKind, PipelineReport};
use crate::refs::RefKind;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

/// Registry key for a ref
///
/// Keys of different kinds never compare equal, even when the identifiers
/// match (a branch named after a full commit hash). Displayed as the branch
/// name, the full hash, or `PR:#<n>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildKey {
    kind: RefKind,
    id: String,
}

impl fmt::Display for BuildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RefKind::Pull => write!(f, "PR:#{}", self.id),
            RefKind::Branch | RefKind::Commit => f.write_str(&self.id),
        }
    }
}

/// A ref whose identifier is canonical
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildTarget {
    pub kind: RefKind,
    pub id: String,
}

impl BuildTarget {
    pub fn new(kind: RefKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn key(&self) -> BuildKey {
        BuildKey {
            kind: self.kind,
            id: self.id.clone(),
        }
    }

    /// Freshness of a build that completed at `now`
    fn fresh_at(&self, now: Instant) -> Freshness {
        if self.kind.is_mutable() {
            Freshness::Since(now)
        } else {
            Freshness::Permanent
        }
    }
}

/// What a waiter is told once its build settles
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Serve files from this build output directory
    Serve { root: PathBuf },
    /// The build failed; `log` is the combined command output
    Failed { log: String },
}

/// A pending requester, resolved exactly once
#[derive(Debug)]
pub struct Waiter {
    tx: oneshot::Sender<Resolution>,
}

impl Waiter {
    /// Create a waiter and the receiver its requester awaits
    pub fn new() -> (Self, oneshot::Receiver<Resolution>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Deliver the outcome; a requester that went away is ignored
    pub fn resolve(self, resolution: Resolution) {
        if self.tx.send(resolution).is_err() {
            debug!("Requester disconnected before its build settled");
        }
    }
}

/// How long a successful build stays valid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Commit builds never go stale
    Permanent,
    /// Mutable ref built (or refreshed) at this instant
    Since(Instant),
}

/// In-flight build for one key
#[derive(Debug)]
pub struct Pending {
    pub pipeline: PipelineKind,
    pub waiters: Vec<Waiter>,
    /// Freshness to restore when a refresh fails under the `fail` policy
    stale: Option<Freshness>,
}

/// State of one key
#[derive(Debug)]
pub enum BuildState {
    Absent,
    Pending(Pending),
    Ready(Freshness),
}

/// What the dispatcher must do after admitting a request
#[derive(Debug)]
pub enum Admission {
    /// Joined an in-flight build
    Queued,
    /// The build output is current; serve it now
    Serve(Waiter),
    /// The caller became the builder and must start this pipeline
    Dispatch(PipelineKind),
}

/// What completion means for the drained waiters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Serve,
    Fail { log: String },
}

/// Waiters captured at completion along with their common outcome
#[derive(Debug)]
pub struct Drain {
    pub waiters: Vec<Waiter>,
    pub verdict: Verdict,
}

/// Build states for every key seen by this process
#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<BuildKey, BuildState>,
}

impl Registry {
    #[cfg(test)]
    fn get(&self, key: &BuildKey) -> Option<&BuildState> {
        self.entries.get(key)
    }

    /// Whether `key` is built or being built
    pub fn is_tracked(&self, key: &BuildKey) -> bool {
        matches!(
            self.entries.get(key),
            Some(BuildState::Pending(_) | BuildState::Ready(_))
        )
    }

    /// Decide what to do with a new request for `target`
    pub fn admit(
        &mut self,
        target: &BuildTarget,
        waiter: Waiter,
        now: Instant,
        ttl: Duration,
    ) -> Admission {
        let state = self
            .entries
            .entry(target.key())
            .or_insert(BuildState::Absent);

        match state {
            BuildState::Pending(pending) => {
                pending.waiters.push(waiter);
                Admission::Queued
            }
            BuildState::Ready(Freshness::Permanent) => Admission::Serve(waiter),
            BuildState::Ready(Freshness::Since(built)) => {
                let built = *built;
                if now.saturating_duration_since(built) < ttl {
                    return Admission::Serve(waiter);
                }
                let stale = Some(Freshness::Since(built));
                *state = BuildState::Pending(Pending {
                    pipeline: PipelineKind::Refresh,
                    waiters: vec![waiter],
                    stale,
                });
                Admission::Dispatch(PipelineKind::Refresh)
            }
            BuildState::Absent => {
                *state = BuildState::Pending(Pending {
                    pipeline: PipelineKind::Full,
                    waiters: vec![waiter],
                    stale: None,
                });
                Admission::Dispatch(PipelineKind::Full)
            }
        }
    }

    /// Settle the in-flight build for `target`, draining its waiters
    ///
    /// Returns `None` when nothing was pending for the key.
    pub fn complete(
        &mut self,
        target: &BuildTarget,
        report: &PipelineReport,
        now: Instant,
        policy: RefreshFailurePolicy,
    ) -> Option<Drain> {
        let state = self.entries.get_mut(&target.key())?;
        let pending = match std::mem::replace(state, BuildState::Absent) {
            BuildState::Pending(pending) => pending,
            other => {
                *state = other;
                return None;
            }
        };

        let (next, verdict) = match (pending.pipeline, report) {
            (_, PipelineReport::Built | PipelineReport::Adopted) => {
                (BuildState::Ready(target.fresh_at(now)), Verdict::Serve)
            }
            (PipelineKind::Full, PipelineReport::Failed { log, .. }) => {
                (BuildState::Absent, Verdict::Fail { log: log.clone() })
            }
            (PipelineKind::Refresh, PipelineReport::Failed { log, .. }) => match policy {
                RefreshFailurePolicy::ServeStale => {
                    (BuildState::Ready(target.fresh_at(now)), Verdict::Serve)
                }
                RefreshFailurePolicy::Fail => (
                    BuildState::Ready(pending.stale.unwrap_or(Freshness::Since(now))),
                    Verdict::Fail { log: log.clone() },
                ),
            },
        };

        *state = next;
        Some(Drain {
            waiters: pending.waiters,
            verdict,
        })
    }
}
