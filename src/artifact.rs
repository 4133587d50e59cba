//! Static serving of build output

use crate::error::{PreviewError, PreviewResult};
use std::path::{Component, Path, PathBuf};
use tokio::fs;

/// A file or listing ready to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactResponse {
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

/// Serve `rest` (a `/`-separated path, possibly empty) from under `root`
pub async fn serve(root: &Path, rest: &str) -> PreviewResult<ArtifactResponse> {
    let path = confine(root, rest).ok_or_else(|| PreviewError::NotFound(rest.to_string()))?;

    let metadata = match fs::metadata(&path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PreviewError::NotFound(rest.to_string()))
        }
        Err(e) => return Err(PreviewError::io(format!("reading {}", path.display()), e)),
    };

    if metadata.is_dir() {
        let index = path.join("index.html");
        if fs::metadata(&index).await.is_ok_and(|m| m.is_file()) {
            return read_file(&index).await;
        }
        return list_dir(&path).await;
    }

    read_file(&path).await
}

/// Join `rest` onto `root`, refusing anything that could escape it
fn confine(root: &Path, rest: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for component in Path::new(rest.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(path)
}

async fn read_file(path: &Path) -> PreviewResult<ArtifactResponse> {
    let body = fs::read(path)
        .await
        .map_err(|e| PreviewError::io(format!("reading {}", path.display()), e))?;
    Ok(ArtifactResponse {
        content_type: content_type(path),
        body,
    })
}

async fn list_dir(path: &Path) -> PreviewResult<ArtifactResponse> {
    let mut entries = fs::read_dir(path)
        .await
        .map_err(|e| PreviewError::io(format!("listing {}", path.display()), e))?;

    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| PreviewError::io(format!("listing {}", path.display()), e))?
    {
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
            name.push('/');
        }
        names.push(name);
    }
    names.sort();

    let mut body = names.join("\n");
    body.push('\n');
    Ok(ArtifactResponse {
        content_type: "text/plain; charset=utf-8",
        body: body.into_bytes(),
    })
}

fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js" | "mjs") => "text/javascript; charset=utf-8",
        Some("json" | "map") => "application/json",
        Some("txt" | "log") => "text/plain; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("wasm") => "application/wasm",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}
