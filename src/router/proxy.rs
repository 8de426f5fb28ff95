//! Reverse proxy to exe sandboxes.
//!
//! A single shared HTTP/1.1 client forwards rewritten requests to the
//! child's loopback port, streaming bodies in both directions.

use axum::body::Body;
use axum::http::{Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::warn;

/// Shared single-host reverse proxy.
#[derive(Clone)]
pub struct ReverseProxy {
    client: Client<HttpConnector, Body>,
}

impl ReverseProxy {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    /// Forwards `req` to `127.0.0.1:<port>` with `path` substituted for
    /// the original path, preserving the query string.
    pub async fn forward(&self, mut req: Request<Body>, port: u16, path: &str) -> Response {
        let query = req
            .uri()
            .query()
            .map(|q| format!("?{q}"))
            .unwrap_or_default();
        let target = format!("http://127.0.0.1:{port}{path}{query}");

        let uri = match Uri::try_from(&target) {
            Ok(uri) => uri,
            Err(e) => {
                warn!(target = %target, error = %e, "bad proxy target");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };
        *req.uri_mut() = uri;

        match self.client.request(req).await {
            Ok(resp) => resp.map(Body::new).into_response(),
            Err(e) => {
                warn!(port, error = %e, "backend unreachable");
                StatusCode::BAD_GATEWAY.into_response()
            }
        }
    }
}

impl Default for ReverseProxy {
    fn default() -> Self {
        Self::new()
    }
}
