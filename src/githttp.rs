//! Git Smart-HTTP bridge.
//!
//! Pushes and clones against the internal listener are delegated to
//! `git http-backend` over its CGI contract: one child per request, the
//! request body on stdin, CGI headers + payload on stdout. The host only
//! translates between HTTP and CGI; the wire protocol stays git's
//! problem.

use std::path::Path;
use std::process::Stdio;

use axum::body::Body;
use axum::http::{header::HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Largest request body accepted from a git client (1 GiB).
const MAX_BODY: usize = 1024 * 1024 * 1024;

/// Handles one Smart-HTTP request for `path_info`, a path of the form
/// `/<owner>/<name>.git/<action>` under `repo_root`.
pub async fn handle(repo_root: &Path, path_info: &str, req: Request<Body>) -> Response {
    let method = req.method().as_str().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let content_type = req
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let body = match axum::body::to_bytes(req.into_body(), MAX_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to read git request body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let mut cmd = Command::new("git");
    cmd.arg("http-backend")
        .env("GIT_PROJECT_ROOT", repo_root)
        .env("GIT_HTTP_EXPORT_ALL", "1")
        .env("PATH_INFO", path_info)
        .env("REQUEST_METHOD", &method)
        .env("QUERY_STRING", &query)
        .env("CONTENT_TYPE", &content_type)
        .env("CONTENT_LENGTH", body.len().to_string())
        .env("REMOTE_ADDR", "127.0.0.1")
        .env("GIT_HTTP_RECEIVE_PACK", "true")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(error = %e, "failed to spawn git http-backend");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(&body).await {
            warn!(error = %e, "failed to feed git http-backend");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        drop(stdin);
    }

    let output = match child.wait_with_output().await {
        Ok(output) => output,
        Err(e) => {
            warn!(error = %e, "git http-backend failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    if !output.status.success() {
        warn!(
            status = %output.status,
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "git http-backend exited abnormally"
        );
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    cgi_to_response(&output.stdout)
}

/// Splits CGI output into headers and payload.
fn cgi_to_response(raw: &[u8]) -> Response {
    let Some(split) = find_header_end(raw) else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let (head, payload) = raw.split_at(split.0);
    let payload = &payload[split.1..];

    let mut status = StatusCode::OK;
    let mut builder = Response::builder();

    for line in String::from_utf8_lossy(head).lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key.eq_ignore_ascii_case("status") {
            if let Some(code) = value.split_whitespace().next() {
                if let Ok(code) = code.parse::<u16>() {
                    status = StatusCode::from_u16(code).unwrap_or(StatusCode::OK);
                }
            }
            continue;
        }
        if let (Ok(name), Ok(val)) = (
            key.parse::<HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, val);
        }
    }

    debug!(status = %status, bytes = payload.len(), "git http-backend responded");
    builder
        .status(status)
        .body(Body::from(payload.to_vec()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Locates the blank line ending the CGI header block. Returns the header
/// length and the separator length.
fn find_header_end(raw: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((pos, 4));
    }
    raw.windows(2).position(|w| w == b"\n\n").map(|pos| (pos, 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_end_handles_both_separators() {
        assert_eq!(find_header_end(b"a: b\r\n\r\nxyz"), Some((6, 4)));
        assert_eq!(find_header_end(b"a: b\n\nxyz"), Some((5, 2)));
        assert_eq!(find_header_end(b"no separator"), None);
    }

    #[test]
    fn cgi_output_maps_status_and_headers() {
        let raw = b"Status: 404 Not Found\r\nContent-Type: text/plain\r\n\r\nmissing";
        let resp = cgi_to_response(raw);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "text/plain"
        );
    }
}
