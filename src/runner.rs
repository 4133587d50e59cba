//! Build command execution
//!
//! Runs an ordered list of external commands in a working directory,
//! stopping at the first failure. Output from every step is captured into a
//! single combined log and mirrored to the operational log as it arrives.

use crate::config::StepConfig;
use crate::error::{PreviewError, PreviewResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// One external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStep {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl BuildStep {
    /// Create a step with no extra environment
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: HashMap::new(),
        }
    }
}

impl From<&StepConfig> for BuildStep {
    fn from(step: &StepConfig) -> Self {
        Self {
            program: step.program.clone(),
            args: step.args.clone(),
            env: step.env.clone(),
        }
    }
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Result of running a list of steps
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Every step exited zero
    Success { log: String },
    /// A step exited non-zero; later steps did not run
    Failure { exit_code: i32, log: String },
}

impl BuildOutcome {
    /// Combined output of the steps that ran
    pub fn log(&self) -> &str {
        match self {
            Self::Success { log } | Self::Failure { log, .. } => log,
        }
    }
}

/// Executes build steps
#[async_trait]
pub trait BuildRunner: Send + Sync {
    /// Run `steps` in order inside `working_dir`
    async fn run(&self, working_dir: &Path, steps: &[BuildStep]) -> PreviewResult<BuildOutcome>;
}

/// Runner that spawns real processes
///
/// Mirrored output inherits the caller's tracing span, so the build key is
/// attached by instrumenting the call.
#[derive(Debug, Default)]
pub struct CommandRunner;

impl CommandRunner {
    /// Create a new command runner
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BuildRunner for CommandRunner {
    async fn run(&self, working_dir: &Path, steps: &[BuildStep]) -> PreviewResult<BuildOutcome> {
        let mut log = String::new();

        for step in steps {
            let command_line = step.to_string();
            debug!("Executing in {}: {}", working_dir.display(), command_line);
            info!(target: "previewd::build", "$ {}", command_line);
            log.push_str(&format!("$ {}\n", command_line));

            let mut child = Command::new(&step.program)
                .args(&step.args)
                .envs(&step.env)
                .current_dir(working_dir)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| PreviewError::command_failed(command_line.clone(), e))?;

            let lines = stream_child_output(&mut child, &|line: &str| {
                info!(target: "previewd::build", "{}", line);
            })
            .await?;
            for line in lines {
                log.push_str(&line);
                log.push('\n');
            }

            let status = child
                .wait()
                .await
                .map_err(|e| PreviewError::command_failed(command_line.clone(), e))?;

            if !status.success() {
                let exit_code = status.code().unwrap_or(-1);
                info!(target: "previewd::build", "{} exited with {}", command_line, exit_code);
                log.push_str(&format!("{} exited with {}\n", command_line, exit_code));
                return Ok(BuildOutcome::Failure { exit_code, log });
            }
        }

        Ok(BuildOutcome::Success { log })
    }
}

/// Stream stdout+stderr from a child process, calling `on_output` for each line.
///
/// Returns all collected lines in arrival order.
async fn stream_child_output(
    child: &mut Child,
    on_output: &(dyn Fn(&str) + Send + Sync),
) -> PreviewResult<Vec<String>> {
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| PreviewError::Internal("stderr not piped".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| PreviewError::Internal("stdout not piped".to_string()))?;

    let mut stderr_reader = BufReader::new(stderr).lines();
    let mut stdout_reader = BufReader::new(stdout).lines();

    let mut all_output = Vec::new();
    let mut stderr_done = false;
    let mut stdout_done = false;

    while !stderr_done || !stdout_done {
        tokio::select! {
            line = stderr_reader.next_line(), if !stderr_done => {
                match line {
                    Ok(Some(line)) => {
                        on_output(&line);
                        all_output.push(line);
                    }
                    _ => stderr_done = true,
                }
            }
            line = stdout_reader.next_line(), if !stdout_done => {
                match line {
                    Ok(Some(line)) => {
                        on_output(&line);
                        all_output.push(line);
                    }
                    _ => stdout_done = true,
                }
            }
        }
    }

    Ok(all_output)
}
