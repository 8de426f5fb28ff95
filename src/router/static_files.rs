//! Static pot serving.
//!
//! Blobs are read straight out of the bare repository's HEAD tree on
//! every request; no working tree or cache sits in between, so a push is
//! visible on the next request.

use std::path::{Path, PathBuf};

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use git2::{ErrorCode, Repository};
use tracing::{debug, warn};

/// Serves `file_path` from the HEAD tree of the bare repo at `repo_path`.
///
/// Repository-not-found and file-not-found are 404; other repository
/// errors are 500. Paths with parent components never resolve in a git
/// tree lookup and fall out as 404.
pub async fn serve_from_head(repo_path: &Path, file_path: &str) -> Response {
    let repo_path = repo_path.to_path_buf();
    let file_path = file_path.to_string();

    // libgit2 reads block; keep them off the request executor.
    let result =
        tokio::task::spawn_blocking(move || read_blob(&repo_path, &file_path)).await;

    match result {
        Ok(Ok((name, bytes))) => blob_response(&name, bytes),
        Ok(Err(status)) => status.into_response(),
        Err(e) => {
            warn!(error = %e, "static read task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Serves a single blob by repository path, for `/cdn` and `/uri/git`.
pub async fn serve_blob(repo_path: PathBuf, file_path: String) -> Response {
    serve_from_head(&repo_path, &file_path).await
}

fn read_blob(repo_path: &Path, file_path: &str) -> Result<(String, Vec<u8>), StatusCode> {
    // A traversal attempt cannot address a tree entry; answer as not found
    // without touching the repository.
    if file_path.split('/').any(|seg| seg == "..") {
        return Err(StatusCode::NOT_FOUND);
    }

    let repo = Repository::open_bare(repo_path).map_err(|e| {
        if e.code() == ErrorCode::NotFound {
            debug!(repo = %repo_path.display(), "repository not found");
            StatusCode::NOT_FOUND
        } else {
            warn!(repo = %repo_path.display(), error = %e, "failed to open repository");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    })?;

    let head = repo.head().map_err(internal)?;
    let commit = head.peel_to_commit().map_err(internal)?;
    let tree = commit.tree().map_err(internal)?;

    let entry = tree.get_path(Path::new(file_path)).map_err(|e| {
        if e.code() == ErrorCode::NotFound {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    })?;
    let blob = repo.find_blob(entry.id()).map_err(internal)?;

    Ok((file_path.to_string(), blob.content().to_vec()))
}

fn internal(e: git2::Error) -> StatusCode {
    warn!(error = %e, "repository read failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

fn blob_response(name: &str, bytes: Vec<u8>) -> Response {
    let mime = mime_guess::from_path(name).first_or_octet_stream();
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, mime.to_string()),
            (header::CONTENT_LENGTH, bytes.len().to_string()),
        ],
        Body::from(bytes),
    )
        .into_response()
}
