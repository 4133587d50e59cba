//! HTTP surface
//!
//! Only the request path is interpreted, whatever the method:
//!
//! | Path | Ref |
//! |------|-----|
//! | `/branch/<name>[/<file>]` | branch, refreshed after the TTL |
//! | `/commit/<hex>[/<file>]` | commit, 4-40 hex chars, built once |
//! | `/pull/<number>[/<file>]` | pull request, refreshed after the TTL |

use crate::artifact;
use crate::config::Config;
use crate::coordinator::{BuildTarget, Coordinator, CoordinatorSettings, GitBuilder, Workspace};
use crate::error::{PreviewError, PreviewResult};
use crate::journal::Journal;
use crate::refs::{
    parse_request_path, resolve_commit, CommitRef, GitResolver, RefKind, RefPolicy, RefRequest,
    RefResolver, FULL_HASH_LEN,
};
use crate::runner::CommandRunner;
use axum::extract::{Request, State};
use axum::http::header::{CONTENT_TYPE, LOCATION};
use axum::http::{StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use chrono::{SecondsFormat, Utc};
use percent_encoding::percent_decode_str;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Shared request handling state
pub struct AppState {
    coordinator: Coordinator,
    resolver: Arc<dyn RefResolver>,
    policy: RefPolicy,
}

impl AppState {
    pub fn new(coordinator: Coordinator, resolver: Arc<dyn RefResolver>, policy: RefPolicy) -> Self {
        Self {
            coordinator,
            resolver,
            policy,
        }
    }
}

/// What a commit request turns into
enum CommitTarget {
    Build(BuildTarget),
    Redirect(String),
}

/// Build the router; every path goes through one handler
pub fn router(state: AppState) -> Router {
    Router::new()
        .fallback(handle)
        .layer(middleware::from_fn(access_log))
        .with_state(Arc::new(state))
}

/// Serve until interrupted
pub async fn run(config: &Config, port: u16) -> PreviewResult<()> {
    let builder = GitBuilder::new(
        Workspace::from_config(config),
        Arc::new(CommandRunner::new()),
        Journal::new(config),
    );
    let coordinator = Coordinator::spawn(
        Arc::new(builder),
        CoordinatorSettings::from(&config.coordinator),
    );
    let resolver = GitResolver::new(config.repo.git.clone(), config.repo.git_dir.clone());
    let policy = RefPolicy::from(&config.coordinator);
    let app = router(AppState::new(coordinator, Arc::new(resolver), policy));

    let addr = format!("{}:{}", config.server.bind, port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| PreviewError::io(format!("binding {}", addr), e))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| PreviewError::io("serving HTTP", e))
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutting down");
    }
}

async fn handle(State(state): State<Arc<AppState>>, uri: Uri) -> Response {
    match respond(&state, &uri).await {
        Ok(response) => response,
        Err(e) => {
            if e.status().is_server_error() {
                error!("{} failed: {}", uri.path(), e);
            }
            (
                e.status(),
                [(CONTENT_TYPE, "text/plain; charset=utf-8")],
                e.body(),
            )
                .into_response()
        }
    }
}

async fn respond(state: &AppState, uri: &Uri) -> PreviewResult<Response> {
    let path = uri.path();
    let request = parse_request_path(path, &state.policy)?;

    let target = match request.kind {
        RefKind::Commit => match commit_target(state, &request).await? {
            CommitTarget::Build(target) => target,
            CommitTarget::Redirect(hash) => {
                let mut location = format!("/commit/{}{}", hash, request.rest);
                if let Some(query) = uri.query() {
                    location.push('?');
                    location.push_str(query);
                }
                return Ok((StatusCode::MOVED_PERMANENTLY, [(LOCATION, location)]).into_response());
            }
        },
        kind => BuildTarget::new(kind, request.id.clone()),
    };

    let root = state.coordinator.request(target).await?;

    let rest = percent_decode_str(&request.rest).decode_utf8_lossy();
    let artifact = artifact::serve(&root, &rest).await.map_err(|e| match e {
        PreviewError::NotFound(_) => PreviewError::NotFound(path.to_string()),
        other => other,
    })?;

    Ok(([(CONTENT_TYPE, artifact.content_type)], artifact.body).into_response())
}

async fn commit_target(state: &AppState, request: &RefRequest) -> PreviewResult<CommitTarget> {
    if request.id.len() == FULL_HASH_LEN {
        let target = BuildTarget::new(RefKind::Commit, request.id.clone());
        if state.coordinator.is_tracked(&target.key()).await {
            return Ok(CommitTarget::Build(target));
        }
    }

    match resolve_commit(state.resolver.as_ref(), &request.id).await? {
        CommitRef::Exact(hash) => Ok(CommitTarget::Build(BuildTarget::new(RefKind::Commit, hash))),
        CommitRef::Redirect(hash) => Ok(CommitTarget::Redirect(hash)),
    }
}

/// One line per completed request
async fn access_log(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let method = request.method().clone();
    let path = request.uri().to_string();

    let response = next.run(request).await;

    info!(
        target: "previewd::access",
        "[{}] {} {} {} - {}ms",
        timestamp,
        response.status().as_u16(),
        method,
        path,
        started.elapsed().as_millis()
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{Builder, PipelineKind, PipelineReport};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use futures_util::future::join_all;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tower::ServiceExt;

    const HASH_A: &str = "abcd000000000000000000000000000000000001";
    const HASH_B: &str = "abcd000000000000000000000000000000000002";
    const HASH_C: &str = "1234567890123456789012345678901234567890";

    /// Writes an index.html naming the target, or fails for `broken`
    struct SiteBuilder {
        root: PathBuf,
        builds: AtomicUsize,
    }

    #[async_trait]
    impl Builder for SiteBuilder {
        fn artifact_root(&self, target: &BuildTarget) -> PathBuf {
            self.root.join(target.kind.as_str()).join(&target.id)
        }

        async fn build(&self, target: &BuildTarget, _kind: PipelineKind) -> PipelineReport {
            self.builds.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if target.id == "broken" {
                return PipelineReport::Failed {
                    exit_code: Some(2),
                    log: "$ make test\nmake: *** [test] Error 2\n".to_string(),
                };
            }
            let dir = self.artifact_root(target);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("index.html"), format!("built {}", target.key())).unwrap();
            PipelineReport::Built
        }
    }

    struct FixedResolver;

    #[async_trait]
    impl RefResolver for FixedResolver {
        async fn candidates(&self, prefix: &str) -> PreviewResult<Vec<String>> {
            Ok([HASH_A, HASH_B, HASH_C]
                .iter()
                .filter(|hash| hash.starts_with(prefix))
                .map(|hash| hash.to_string())
                .collect())
        }
    }

    fn app(root: &Path) -> (Router, Arc<SiteBuilder>) {
        let builder = Arc::new(SiteBuilder {
            root: root.to_path_buf(),
            builds: AtomicUsize::new(0),
        });
        let coordinator = Coordinator::spawn(builder.clone(), CoordinatorSettings::default());
        let state = AppState::new(coordinator, Arc::new(FixedResolver), RefPolicy::default());
        (router(state), builder)
    }

    async fn get(app: &Router, path: &str) -> (StatusCode, Option<String>, String) {
        let request = HttpRequest::builder().uri(path).body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let location = response
            .headers()
            .get(LOCATION)
            .map(|v| v.to_str().unwrap().to_string());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, location, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn simultaneous_branch_requests_share_one_build() {
        let temp = TempDir::new().unwrap();
        let (app, builder) = app(temp.path());

        let responses = join_all([get(&app, "/branch/feature-x"), get(&app, "/branch/feature-x")]).await;

        for (status, _, body) in responses {
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, "built feature-x");
        }
        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pull_request_is_served() {
        let temp = TempDir::new().unwrap();
        let (app, _) = app(temp.path());

        let (status, _, body) = get(&app, "/pull/42/index.html").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "built PR:#42");
    }

    #[tokio::test]
    async fn short_abbreviation_is_bad_request() {
        let temp = TempDir::new().unwrap();
        let (app, builder) = app(temp.path());

        let (status, _, _) = get(&app, "/commit/abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _, _) = get(&app, "/branch/").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(builder.builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_commit_is_not_found() {
        let temp = TempDir::new().unwrap();
        let (app, _) = app(temp.path());

        let (status, _, body) = get(&app, "/commit/0000").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "No such commit: 0000");
    }

    #[tokio::test]
    async fn abbreviation_redirects_to_canonical_path() {
        let temp = TempDir::new().unwrap();
        let (app, builder) = app(temp.path());

        let (status, location, _) = get(&app, "/commit/1234/index.html").await;
        assert_eq!(status, StatusCode::MOVED_PERMANENTLY);
        assert_eq!(location, Some(format!("/commit/{HASH_C}/index.html")));
        assert_eq!(builder.builds.load(Ordering::SeqCst), 0);

        let (status, location, body) = get(&app, &format!("/commit/{HASH_C}/index.html")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(location, None);
        assert_eq!(body, format!("built {HASH_C}"));

        // Cached now, so the fast path serves it again without a rebuild
        let (status, _, _) = get(&app, &format!("/commit/{HASH_C}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ambiguous_abbreviation_lists_candidates() {
        let temp = TempDir::new().unwrap();
        let (app, _) = app(temp.path());

        let (status, _, body) = get(&app, "/commit/abcd").await;
        assert_eq!(status, StatusCode::MULTIPLE_CHOICES);
        assert_eq!(body, format!("{HASH_A}\n{HASH_B}\n"));
    }

    #[tokio::test]
    async fn build_failure_returns_log() {
        let temp = TempDir::new().unwrap();
        let (app, builder) = app(temp.path());

        let (status, _, body) = get(&app, "/branch/broken").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "$ make test\nmake: *** [test] Error 2\n");

        // Failure is not cached
        get(&app, "/branch/broken").await;
        assert_eq!(builder.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let temp = TempDir::new().unwrap();
        let (app, _) = app(temp.path());

        let (status, _, body) = get(&app, "/favicon.ico").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "404 Not Found: /favicon.ico");

        let (status, _, body) = get(&app, "/branch/main/missing.css").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "404 Not Found: /branch/main/missing.css");
    }

    #[tokio::test]
    async fn method_is_ignored() {
        let temp = TempDir::new().unwrap();
        let (app, _) = app(temp.path());

        let request = HttpRequest::builder()
            .method("POST")
            .uri("/branch/main")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
