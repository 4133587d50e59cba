//! Resolve command - expand a commit abbreviation

use crate::cli::args::ResolveArgs;
use crate::config::Config;
use crate::error::{PreviewError, PreviewResult};
use crate::refs::{resolve_commit, validate_commit, GitResolver, RefPolicy};

/// Execute the resolve command
///
/// Prints the full hash, or every candidate when the abbreviation is
/// ambiguous (and then fails).
pub async fn execute(args: ResolveArgs, config: &Config) -> PreviewResult<()> {
    validate_commit(&args.prefix, &RefPolicy::from(&config.coordinator))?;

    let resolver = GitResolver::new(config.repo.git.clone(), config.repo.git_dir.clone());

    match resolve_commit(&resolver, &args.prefix).await {
        Ok(commit) => {
            println!("{}", commit.hash());
            Ok(())
        }
        Err(PreviewError::AmbiguousRef {
            prefix,
            candidates,
        }) => {
            for candidate in &candidates {
                println!("{}", candidate);
            }
            Err(PreviewError::AmbiguousRef { prefix, candidates })
        }
        Err(e) => Err(e),
    }
}
