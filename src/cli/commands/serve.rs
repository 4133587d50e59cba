//! Serve command - run the HTTP service

use crate::cli::args::ServeArgs;
use crate::config::Config;
use crate::error::PreviewResult;
use crate::server;
use tracing::debug;

/// Execute the serve command
pub async fn execute(args: ServeArgs, config: &Config) -> PreviewResult<()> {
    let port = args.port.unwrap_or(config.server.port);
    debug!(
        "Mirror at {}, worktrees under {}",
        config.repo.git_dir.display(),
        config.repo.worktree_root.display()
    );
    server::run(config, port).await
}
