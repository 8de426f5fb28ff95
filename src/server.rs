//! HTTP façade.
//!
//! Three listeners share one routing core with distinct handler subsets:
//!
//! | Listener | Exposes                                         | TLS |
//! |----------|-------------------------------------------------|-----|
//! | business | `/web`, `/api`, `/cdn`, `/uri`, `/health`       | yes |
//! | admin    | `/admin`, cert + store admin, `/health`         | yes |
//! | internal | `/pot`, `/repo` (git), router refresh, `/health`| no  |
//!
//! `/cdn` and `/health` are open; everything else honours the shared
//! token when one is configured.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path as AxumPath, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get, post};
use axum::{Json, Router};
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tokio_rustls::TlsAcceptor;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::constants::{CDN_OWNER, INTERNAL_PORT, SHUTDOWN_GRACE, SYSTEM_OWNER};
use crate::error::Error;
use crate::githttp;
use crate::https::CertManager;
use crate::repo;
use crate::router::{serve_blob, DynamicRouter};
use crate::store::{RepoStore, UserStore};

/// Shared state behind every handler.
pub struct ServerState {
    pub config: Config,
    pub router: Arc<DynamicRouter>,
    pub users: Arc<dyn UserStore>,
    pub repos: Arc<dyn RepoStore>,
    pub certs: CertManager,
}

type AppState = Arc<ServerState>;

// =============================================================================
// Listener Assembly
// =============================================================================

/// Builds the business listener app.
pub fn business_app(state: AppState) -> Router {
    let protected = Router::new()
        .route("/uri/*path", get(uri_handler))
        .fallback(business_dispatch)
        .layer(middleware::from_fn_with_state(state.clone(), token_auth));

    Router::new()
        .route("/health", get(health))
        .route("/cdn/*path", get(cdn_handler))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Builds the admin listener app.
pub fn admin_app(state: AppState) -> Router {
    let admin_api = Router::new()
        .route("/api/v1/admin/users", post(create_owner_handler))
        .route("/api/v1/admin/users/:username", delete(delete_owner_handler))
        .route("/api/v1/admin/users/:username/repos", post(create_repo_handler))
        .route("/api/v1/admin/certs/info", get(cert_info_handler))
        .route("/api/v1/admin/certs/renew", post(cert_renew_handler))
        .route("/api/v1/repos/:owner/:repo", get(get_repo_handler))
        .route("/api/v1/repos/:owner/:repo", delete(delete_repo_handler))
        .route(
            "/api/v1/repos/:owner/:repo/collaborators",
            get(list_collaborators_handler),
        )
        .route(
            "/api/v1/repos/:owner/:repo/collaborators/:collaborator",
            get(check_collaborator_handler)
                .put(add_collaborator_handler)
                .delete(remove_collaborator_handler),
        )
        .fallback(admin_dispatch)
        .layer(middleware::from_fn_with_state(state.clone(), token_auth));

    Router::new()
        .route("/health", get(health))
        .merge(admin_api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Builds the internal listener app. Always plaintext, never
/// authenticated; it exists for loopback collaborators only.
pub fn internal_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            &format!("/pot/{SYSTEM_OWNER}/router/refresh"),
            post(refresh_handler),
        )
        .route("/repo/*path", any(git_handler))
        .fallback(internal_dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Serving
// =============================================================================

/// Serves an app over plain HTTP until `shutdown` fires.
pub async fn serve_plain(
    addr: SocketAddr,
    app: Router,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

/// Serves an app over TLS until `shutdown` fires. Certificates resolve
/// per-handshake through the manager, so hot swaps need no rebind.
pub async fn serve_tls(
    addr: SocketAddr,
    app: Router,
    tls: Arc<rustls::ServerConfig>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> crate::error::Result<()> {
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use hyper_util::service::TowerToHyperService;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let acceptor = TlsAcceptor::from(tls);
    info!(addr = %addr, "HTTPS listening");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tokio::time::sleep(SHUTDOWN_GRACE).await;
                return Ok(());
            }
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else { continue };
                let acceptor = acceptor.clone();
                let app = app.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "TLS handshake failed");
                            return;
                        }
                    };
                    let service = TowerToHyperService::new(app);
                    if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
                        .await
                    {
                        debug!(peer = %peer, error = %e, "connection error");
                    }
                });
            }
        }
    }
}

// =============================================================================
// Auth
// =============================================================================

/// Accepts `Authorization: token <t>` or HTTP Basic with the token as
/// either user or password. With no token configured every request
/// passes; startup warns about that separately.
async fn token_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.token.as_deref() else {
        return next.run(req).await;
    };

    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("token ") {
            if token == expected {
                return next.run(req).await;
            }
        }
        if let Some(encoded) = value.strip_prefix("Basic ") {
            if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) {
                if let Ok(text) = String::from_utf8(decoded) {
                    let (user, pass) = text.split_once(':').unwrap_or((text.as_str(), ""));
                    if user == expected || pass == expected {
                        return next.run(req).await;
                    }
                }
            }
        }
    }

    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"PotStack\"")],
    )
        .into_response()
}

// =============================================================================
// Core Handlers
// =============================================================================

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Dispatches `/web` and `/api` through the dynamic router.
async fn business_dispatch(State(state): State<AppState>, req: Request) -> Response {
    let path = req.uri().path();
    if path.starts_with("/web/") || path.starts_with("/api/") {
        return state.router.dispatch(req).await;
    }
    StatusCode::NOT_FOUND.into_response()
}

/// Dispatches `/admin` through the dynamic router.
async fn admin_dispatch(State(state): State<AppState>, req: Request) -> Response {
    if req.uri().path().starts_with("/admin/") {
        return state.router.dispatch(req).await;
    }
    StatusCode::NOT_FOUND.into_response()
}

/// Dispatches `/pot` through the dynamic router.
async fn internal_dispatch(State(state): State<AppState>, req: Request) -> Response {
    if req.uri().path().starts_with("/pot/") {
        return state.router.dispatch(req).await;
    }
    StatusCode::NOT_FOUND.into_response()
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    org: String,
    name: String,
}

/// `POST /pot/potstack/router/refresh`: re-reads `pot.yml` and swaps the
/// pot's routes.
async fn refresh_handler(
    State(state): State<AppState>,
    body: Result<Json<RefreshRequest>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let Ok(Json(req)) = body else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid request" })))
            .into_response();
    };
    if req.org.is_empty() || req.name.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid request" })))
            .into_response();
    }

    match state.router.refresh(&req.org, &req.name) {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "org": req.org, "name": req.name })),
        )
            .into_response(),
        Err(Error::ManifestNotFound { .. }) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "pot.yml not found" })),
        )
            .into_response(),
        Err(e) => {
            warn!(pot = %format!("{}/{}", req.org, req.name), error = %e, "route refresh failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// `/cdn/<repo>/<path>`: serves from the fixed CDN owner's repos.
async fn cdn_handler(State(state): State<AppState>, AxumPath(path): AxumPath<String>) -> Response {
    let path = path.trim_start_matches('/');
    let Some((repo_name, file_path)) = path.split_once('/') else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid path format, expected /<repo>/<file-path>" })),
        )
            .into_response();
    };
    let repo_path = repo::bare_repo_path(&state.config.repo_dir(), CDN_OWNER, repo_name);
    serve_blob(repo_path, file_path.to_string()).await
}

/// `/uri/git/...` serves from HEAD; `/uri/dat/...` serves the bare repo's
/// `data/` working area with traversal protection.
async fn uri_handler(State(state): State<AppState>, AxumPath(path): AxumPath<String>) -> Response {
    let path = path.trim_start_matches('/');

    if let Some(rest) = path.strip_prefix("git/") {
        let parts: Vec<&str> = rest.splitn(3, '/').collect();
        if parts.len() < 3 {
            return bad_uri_format("/git/<owner>/<repo>/<file-path>");
        }
        let repo_path = repo::bare_repo_path(&state.config.repo_dir(), parts[0], parts[1]);
        return serve_blob(repo_path, parts[2].to_string()).await;
    }

    if let Some(rest) = path.strip_prefix("dat/") {
        let parts: Vec<&str> = rest.splitn(3, '/').collect();
        if parts.len() < 3 {
            return bad_uri_format("/dat/<owner>/<repo>/<file-path>");
        }
        let data_root = repo::bare_repo_path(&state.config.repo_dir(), parts[0], parts[1])
            .join("data");
        return serve_data_file(&data_root, parts[2]).await;
    }

    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "invalid path prefix, must start with /git/ or /dat/" })),
    )
        .into_response()
}

fn bad_uri_format(expected: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": format!("invalid path format, expected {expected}") })),
    )
        .into_response()
}

/// Serves a file beneath `data_root`, rejecting escapes with 403.
async fn serve_data_file(data_root: &std::path::Path, rel: &str) -> Response {
    let full = data_root.join(rel);

    // Normalise without touching the filesystem, then require the result
    // to stay under the data root.
    let mut cleaned = PathBuf::new();
    for comp in full.components() {
        match comp {
            std::path::Component::ParentDir => {
                cleaned.pop();
            }
            std::path::Component::CurDir => {}
            other => cleaned.push(other),
        }
    }
    if !cleaned.starts_with(data_root) {
        warn!(path = %full.display(), "path traversal attempt blocked");
        return StatusCode::FORBIDDEN.into_response();
    }

    match tokio::fs::read(&cleaned).await {
        Ok(bytes) => {
            let mime = mime_guess::from_path(&cleaned).first_or_octet_stream();
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, mime.to_string())],
                Body::from(bytes),
            )
                .into_response()
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// `/repo/<owner>/<name>.git/...`: Git Smart-HTTP.
async fn git_handler(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
    req: Request,
) -> Response {
    let path_info = format!("/{}", path.trim_start_matches('/'));
    githttp::handle(&state.config.repo_dir(), &path_info, req).await
}

// =============================================================================
// Admin Handlers
// =============================================================================

#[derive(Debug, Deserialize)]
struct CreateOwnerRequest {
    username: String,
    #[serde(default)]
    email: String,
}

async fn create_owner_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateOwnerRequest>,
) -> Response {
    let email = if req.email.is_empty() {
        format!("{}@potstack.local", req.username)
    } else {
        req.email
    };
    match state.users.create_owner(&req.username, &email).await {
        Ok(owner) => (StatusCode::CREATED, Json(owner)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_owner_handler(
    State(state): State<AppState>,
    AxumPath(username): AxumPath<String>,
) -> Response {
    match state.users.delete_owner(&username).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct CreateRepoRequest {
    name: String,
}

async fn create_repo_handler(
    State(state): State<AppState>,
    AxumPath(username): AxumPath<String>,
    Json(req): Json<CreateRepoRequest>,
) -> Response {
    match state.repos.create_repo(&username, &req.name).await {
        Ok(record) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_repo_handler(
    State(state): State<AppState>,
    AxumPath((owner, repo_name)): AxumPath<(String, String)>,
) -> Response {
    match state.repos.get_repo(&owner, &repo_name).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_repo_handler(
    State(state): State<AppState>,
    AxumPath((owner, repo_name)): AxumPath<(String, String)>,
) -> Response {
    match state.repos.delete_repo(&owner, &repo_name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_collaborators_handler(
    State(state): State<AppState>,
    AxumPath((owner, repo_name)): AxumPath<(String, String)>,
) -> Response {
    match state.repos.list_collaborators(&owner, &repo_name).await {
        Ok(list) => Json(list).into_response(),
        Err(e) => error_response(e),
    }
}

async fn check_collaborator_handler(
    State(state): State<AppState>,
    AxumPath((owner, repo_name, user)): AxumPath<(String, String, String)>,
) -> Response {
    match state.repos.is_collaborator(&owner, &repo_name, &user).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct AddCollaboratorRequest {
    #[serde(default = "default_permission")]
    permission: String,
}

fn default_permission() -> String {
    "write".to_string()
}

async fn add_collaborator_handler(
    State(state): State<AppState>,
    AxumPath((owner, repo_name, user)): AxumPath<(String, String, String)>,
    body: Option<Json<AddCollaboratorRequest>>,
) -> Response {
    let permission = body
        .map(|Json(b)| b.permission)
        .unwrap_or_else(default_permission);
    match state
        .repos
        .add_collaborator(&owner, &repo_name, &user, &permission)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn remove_collaborator_handler(
    State(state): State<AppState>,
    AxumPath((owner, repo_name, user)): AxumPath<(String, String, String)>,
) -> Response {
    match state
        .repos
        .remove_collaborator(&owner, &repo_name, &user)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn cert_info_handler(State(state): State<AppState>) -> Response {
    match state.certs.cert_info() {
        Ok(info) => Json(info).into_response(),
        Err(e) => error_response(e),
    }
}

async fn cert_renew_handler(State(state): State<AppState>) -> Response {
    match state.certs.force_renew().await {
        Ok(archive) => Json(json!({ "status": "ok", "archive": archive })).into_response(),
        Err(e) => error_response(e),
    }
}

/// Maps store and lifecycle errors onto HTTP statuses.
fn error_response(e: Error) -> Response {
    let status = match &e {
        Error::OwnerNotFound(_) | Error::PotNotFound { .. } | Error::ManifestNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        Error::OwnerAlreadyExists(_)
        | Error::PotAlreadyExists { .. }
        | Error::CollaboratorExists { .. } => StatusCode::CONFLICT,
        Error::InvalidInput(_) | Error::InvalidFormat(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

/// Loopback URL of the internal listener, for readiness checks.
pub fn internal_url() -> String {
    format!("http://localhost:{INTERNAL_PORT}")
}
