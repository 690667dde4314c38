//! Static file serving for plain (non-upgrade) HTTP requests.
//!
//! The bridge usually runs next to a browser client such as noVNC, so it can
//! serve that client's HTML/JS from `--web DIR` on the same port the
//! WebSocket sessions use.

use std::io;
use std::path::{Component, Path, PathBuf};

use tokio_tungstenite::tungstenite::http::{Method, StatusCode};
use tracing::{debug, warn};

use crate::infrastructure::http::HttpResponse;

/// File served when the request names a directory.
const INDEX_FILE: &str = "index.html";

/// Resolves and reads the file for `method` + `uri_path` under `web_root`.
///
/// Never fails: every outcome, including I/O errors, is mapped to a response.
pub async fn serve(web_root: Option<&Path>, method: &Method, uri_path: &str) -> HttpResponse {
    let Some(web_root) = web_root else {
        return HttpResponse::text(StatusCode::FORBIDDEN, "403 Permission Denied");
    };

    if method != Method::GET && method != Method::HEAD {
        return HttpResponse::text(StatusCode::METHOD_NOT_ALLOWED, "405 Method Not Allowed");
    }

    let Some(mut path) = resolve(web_root, uri_path) else {
        debug!("rejected path outside web root: {uri_path}");
        return HttpResponse::text(StatusCode::FORBIDDEN, "403 Permission Denied");
    };

    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_dir() => path.push(INDEX_FILE),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return HttpResponse::text(StatusCode::NOT_FOUND, "404 Not Found");
        }
        Err(e) => return read_failure(&path, &e),
    }

    match tokio::fs::read(&path).await {
        Ok(body) => HttpResponse {
            status: StatusCode::OK,
            content_type: mime_guess::from_path(&path).first().map(|m| m.to_string()),
            body,
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            HttpResponse::text(StatusCode::NOT_FOUND, "404 Not Found")
        }
        Err(e) => read_failure(&path, &e),
    }
}

/// Maps a URI path onto the file system under `web_root`.
///
/// The query string is ignored.  Returns `None` if the path tries to climb
/// out of the root with `..`.
pub fn resolve(web_root: &Path, uri_path: &str) -> Option<PathBuf> {
    let path_only = uri_path.split(|c| c == '?' || c == '#').next().unwrap_or("");
    let relative = Path::new(path_only.trim_start_matches('/'));

    let mut resolved = web_root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(resolved)
}

fn read_failure(path: &Path, e: &io::Error) -> HttpResponse {
    warn!("failed to read {}: {e}", path.display());
    HttpResponse::text(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
