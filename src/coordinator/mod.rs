//! Single-flight build coordination
//!
//! One dispatcher task owns the registry of build states. Requests and build
//! completions reach it as messages on one channel, so every
//! read-decide-write step on the registry is serialized without locks.
//! Builds run in their own tasks and never block the dispatcher.
//!
//! # Build States
//!
//! | State | Meaning |
//! |-------|---------|
//! | Absent | Never built, or the last full build failed |
//! | Pending | A pipeline is running; later requests queue behind it |
//! | Ready | Built; commits forever, branches and pulls until the TTL lapses |

pub mod pipeline;
pub mod state;

pub use pipeline::{Builder, GitBuilder, PipelineKind, PipelineReport, Workspace};
pub use state::{BuildKey, BuildTarget, Resolution, Waiter};

use crate::config::schema::{CoordinatorConfig, RefreshFailurePolicy};
use crate::error::{PreviewError, PreviewResult};
use state::{Admission, Registry, Verdict};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Coordinator behaviour knobs
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    /// How long a mutable ref build is served before it is refreshed
    pub ttl: Duration,
    /// What waiters get when a refresh fails
    pub refresh_failure: RefreshFailurePolicy,
}

impl From<&CoordinatorConfig> for CoordinatorSettings {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            ttl: config.ttl(),
            refresh_failure: config.refresh_failure,
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from(&CoordinatorConfig::default())
    }
}

enum Message {
    Handle {
        target: BuildTarget,
        waiter: Waiter,
    },
    Probe {
        key: BuildKey,
        reply: oneshot::Sender<bool>,
    },
    Completed {
        target: BuildTarget,
        report: PipelineReport,
    },
}

/// Handle to the dispatcher task
///
/// Cheap to clone. The dispatcher stops once every handle is dropped and no
/// build is still running.
#[derive(Clone)]
pub struct Coordinator {
    tx: mpsc::UnboundedSender<Message>,
}

impl Coordinator {
    /// Start a dispatcher on the current runtime
    pub fn spawn(builder: Arc<dyn Builder>, settings: CoordinatorSettings) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher {
            registry: Registry::default(),
            builder,
            settings,
            rx,
            tx: tx.downgrade(),
        };
        tokio::spawn(dispatcher.run());
        Self { tx }
    }

    /// Hand `waiter` to the coordinator for `target`
    ///
    /// The waiter is resolved exactly once: immediately if the build output
    /// is current, otherwise when the build it joined settles.
    pub fn submit(&self, target: BuildTarget, waiter: Waiter) {
        if let Err(mpsc::error::SendError(message)) =
            self.tx.send(Message::Handle { target, waiter })
        {
            if let Message::Handle { waiter, .. } = message {
                waiter.resolve(Resolution::Failed {
                    log: "build coordinator is not running\n".to_string(),
                });
            }
        }
    }

    /// Wait for build output for `target`, building it if needed
    pub async fn request(&self, target: BuildTarget) -> PreviewResult<PathBuf> {
        let key = target.key();
        let (waiter, rx) = Waiter::new();
        self.submit(target, waiter);

        match rx.await {
            Ok(Resolution::Serve { root }) => Ok(root),
            Ok(Resolution::Failed { log }) => Err(PreviewError::BuildFailed {
                key: key.to_string(),
                log,
            }),
            Err(_) => Err(PreviewError::Internal(format!(
                "request for {} was dropped",
                key
            ))),
        }
    }

    /// Whether `key` is built or being built
    pub async fn is_tracked(&self, key: &BuildKey) -> bool {
        let (reply, rx) = oneshot::channel();
        let probe = Message::Probe {
            key: key.clone(),
            reply,
        };
        if self.tx.send(probe).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

struct Dispatcher {
    registry: Registry,
    builder: Arc<dyn Builder>,
    settings: CoordinatorSettings,
    rx: mpsc::UnboundedReceiver<Message>,
    tx: mpsc::WeakUnboundedSender<Message>,
}

impl Dispatcher {
    async fn run(mut self) {
        while let Some(message) = self.rx.recv().await {
            match message {
                Message::Handle { target, waiter } => self.handle(target, waiter),
                Message::Probe { key, reply } => {
                    let _ = reply.send(self.registry.is_tracked(&key));
                }
                Message::Completed { target, report } => self.complete(&target, report),
            }
        }
        debug!("Build coordinator stopped");
    }

    fn handle(&mut self, target: BuildTarget, waiter: Waiter) {
        let now = Instant::now();
        match self.registry.admit(&target, waiter, now, self.settings.ttl) {
            Admission::Queued => debug!("Queued request for {}", target.key()),
            Admission::Serve(waiter) => waiter.resolve(Resolution::Serve {
                root: self.builder.artifact_root(&target),
            }),
            Admission::Dispatch(pipeline) => self.dispatch(target, pipeline),
        }
    }

    fn dispatch(&mut self, target: BuildTarget, pipeline: PipelineKind) {
        let Some(tx) = self.tx.upgrade() else {
            // Every handle is gone; nobody could report completion
            let report = PipelineReport::Failed {
                exit_code: None,
                log: "build coordinator is shutting down\n".to_string(),
            };
            self.complete(&target, report);
            return;
        };

        info!("Starting {} pipeline for {}", pipeline, target.key());
        let builder = Arc::clone(&self.builder);
        tokio::spawn(async move {
            let build_target = target.clone();
            let build =
                tokio::spawn(async move { builder.build(&build_target, pipeline).await });

            let report = match build.await {
                Ok(report) => report,
                Err(e) => PipelineReport::Failed {
                    exit_code: None,
                    log: format!("build task failed: {}\n", e),
                },
            };
            let _ = tx.send(Message::Completed { target, report });
        });
    }

    fn complete(&mut self, target: &BuildTarget, report: PipelineReport) {
        let key = target.key();
        let Some(drain) =
            self.registry
                .complete(target, &report, Instant::now(), self.settings.refresh_failure)
        else {
            warn!("Completion for {} arrived with no build pending", key);
            return;
        };

        if let PipelineReport::Failed { log, .. } = &report {
            if drain.verdict == Verdict::Serve {
                warn!("Refresh of {} failed; serving the previous build\n{}", key, log);
            }
        }

        debug!(
            "Draining {} waiter(s) for {}: {:?}",
            drain.waiters.len(),
            key,
            drain.verdict
        );
        let resolution = match drain.verdict {
            Verdict::Serve => Resolution::Serve {
                root: self.builder.artifact_root(target),
            },
            Verdict::Fail { log } => Resolution::Failed { log },
        };
        for waiter in drain.waiters {
            waiter.resolve(resolution.clone());
        }
    }
}
