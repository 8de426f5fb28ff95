//! Integration tests for the dynamic router: registration atomicity,
//! longest-prefix dispatch, static serving from HEAD, and reverse
//! proxying to a live backend.

use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use potstack::pot::{PotManifest, RunState};
use potstack::repo;
use potstack::router::DynamicRouter;

// =============================================================================
// Test Helpers
// =============================================================================

fn static_manifest(root: &str) -> PotManifest {
    PotManifest::from_yaml(format!("type: static\nroot: {root}\n").as_bytes()).unwrap()
}

/// Creates a bare repo for `(owner, name)` holding a static site.
fn make_static_pot(repo_root: &Path, owner: &str, name: &str, body: &str) {
    let bare = repo::bare_repo_path(repo_root, owner, name);
    repo::init_bare(&bare).unwrap();

    let work = repo_root.join(format!("work-{owner}-{name}"));
    std::fs::create_dir_all(work.join("public")).unwrap();
    std::fs::write(work.join("pot.yml"), "type: static\nroot: public\n").unwrap();
    std::fs::write(work.join("public/index.html"), body).unwrap();
    repo::push_tree(&bare, &work).unwrap();
}

fn write_run_state(repo_root: &Path, owner: &str, name: &str, port: u16) {
    let dir = repo::bare_repo_path(repo_root, owner, name).join("data/faaspot");
    std::fs::create_dir_all(&dir).unwrap();
    let rs = RunState::running(1, port, "2026-08-02T00:00:00Z".to_string());
    std::fs::write(dir.join("run.yml"), serde_yaml::to_string(&rs).unwrap()).unwrap();
}

async fn get(router: &DynamicRouter, path: &str) -> (StatusCode, Vec<u8>) {
    let req = Request::get(path).body(Body::empty()).unwrap();
    let resp = router.dispatch(req).await;
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

// =============================================================================
// Registration
// =============================================================================

#[tokio::test]
async fn registration_installs_all_four_prefixes() {
    let dir = tempfile::tempdir().unwrap();
    let router = DynamicRouter::new(dir.path());
    make_static_pot(dir.path(), "acme", "site", "<h1>hi</h1>");

    router
        .register_static("acme", "site", &static_manifest("public"))
        .unwrap();

    let mut routes = router.routes_for("acme", "site");
    routes.sort();
    assert_eq!(
        routes,
        vec![
            "/admin/acme/site".to_string(),
            "/api/acme/site".to_string(),
            "/pot/acme/site".to_string(),
            "/web/acme/site".to_string(),
        ]
    );
}

#[tokio::test]
async fn remove_routes_clears_every_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let router = DynamicRouter::new(dir.path());
    make_static_pot(dir.path(), "acme", "site", "x");
    router
        .register_static("acme", "site", &static_manifest("public"))
        .unwrap();

    router.remove_routes("acme", "site");
    assert!(router.routes_for("acme", "site").is_empty());

    let (status, _) = get(&router, "/web/acme/site/index.html").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn register_exe_requires_run_state_with_port() {
    let dir = tempfile::tempdir().unwrap();
    let router = DynamicRouter::new(dir.path());
    repo::init_bare(&repo::bare_repo_path(dir.path(), "o", "svc")).unwrap();

    // No run.yml at all.
    assert!(router.register_exe("o", "svc").is_err());

    // run.yml with port zero.
    let sandbox = repo::bare_repo_path(dir.path(), "o", "svc").join("data/faaspot");
    std::fs::create_dir_all(&sandbox).unwrap();
    std::fs::write(sandbox.join("run.yml"), "target_status: running\n").unwrap();
    assert!(matches!(
        router.register_exe("o", "svc"),
        Err(potstack::Error::NoPortAssigned { .. })
    ));
}

// =============================================================================
// Dispatch
// =============================================================================

#[tokio::test]
async fn static_pot_serves_blob_from_head() {
    let dir = tempfile::tempdir().unwrap();
    let router = DynamicRouter::new(dir.path());
    make_static_pot(dir.path(), "acme", "site", "<h1>hello</h1>");
    router
        .register_static("acme", "site", &static_manifest("public"))
        .unwrap();

    let (status, body) = get(&router, "/web/acme/site/index.html").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"<h1>hello</h1>");
}

#[tokio::test]
async fn static_pot_missing_file_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let router = DynamicRouter::new(dir.path());
    make_static_pot(dir.path(), "acme", "site", "x");
    router
        .register_static("acme", "site", &static_manifest("public"))
        .unwrap();

    let (status, _) = get(&router, "/web/acme/site/missing.html").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn traversal_out_of_tree_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let router = DynamicRouter::new(dir.path());
    make_static_pot(dir.path(), "acme", "site", "x");
    router
        .register_static("acme", "site", &static_manifest("public"))
        .unwrap();

    let (status, _) = get(&router, "/web/acme/site/../../../etc/passwd").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unmatched_path_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let router = DynamicRouter::new(dir.path());
    let (status, _) = get(&router, "/web/nobody/nothing/x").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn longest_prefix_wins_between_similar_names() {
    let dir = tempfile::tempdir().unwrap();
    let router = DynamicRouter::new(dir.path());
    make_static_pot(dir.path(), "a", "b", "pot b");
    make_static_pot(dir.path(), "a", "bb", "pot bb");
    router.register_static("a", "b", &static_manifest("public")).unwrap();
    router.register_static("a", "bb", &static_manifest("public")).unwrap();

    let (_, body) = get(&router, "/web/a/b/index.html").await;
    assert_eq!(body, b"pot b");
    let (_, body) = get(&router, "/web/a/bb/index.html").await;
    assert_eq!(body, b"pot bb");
}

// =============================================================================
// Reverse Proxy
// =============================================================================

/// Echo backend reporting the path and forwarded prefix it saw.
async fn spawn_backend() -> (u16, tokio::task::JoinHandle<()>) {
    use axum::routing::any;

    let app = axum::Router::new().fallback(any(|req: Request<Body>| async move {
        let prefix = req
            .headers()
            .get("x-forwarded-prefix")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        format!("{} {}", req.uri().path(), prefix)
    }));

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (port, handle)
}

#[tokio::test]
async fn exe_pot_proxies_with_rewritten_path() {
    let dir = tempfile::tempdir().unwrap();
    let router = Arc::new(DynamicRouter::new(dir.path()));
    let (port, _backend) = spawn_backend().await;

    repo::init_bare(&repo::bare_repo_path(dir.path(), "o", "svc")).unwrap();
    write_run_state(dir.path(), "o", "svc", port);
    router.register_exe("o", "svc").unwrap();

    // /pot strips the whole prefix.
    let (status, body) = get(&router, "/pot/o/svc/ping").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"/ping /pot/o/svc");

    // /api keeps the route class.
    let (_, body) = get(&router, "/api/o/svc/users").await;
    assert_eq!(body, b"/api/users /o/svc");
}

#[tokio::test]
async fn proxy_to_dead_backend_is_502() {
    let dir = tempfile::tempdir().unwrap();
    let router = DynamicRouter::new(dir.path());

    repo::init_bare(&repo::bare_repo_path(dir.path(), "o", "svc")).unwrap();
    // A port with no listener behind it.
    let port = potstack::keeper::free_port().unwrap();
    write_run_state(dir.path(), "o", "svc", port);
    router.register_exe("o", "svc").unwrap();

    let (status, _) = get(&router, "/web/o/svc/ping").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

// =============================================================================
// Refresh
// =============================================================================

#[tokio::test]
async fn refresh_registers_by_manifest_kind() {
    let dir = tempfile::tempdir().unwrap();
    let router = DynamicRouter::new(dir.path());
    make_static_pot(dir.path(), "acme", "site", "fresh");

    router.refresh("acme", "site").unwrap();
    let (status, body) = get(&router, "/web/acme/site/index.html").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"fresh");
}

#[tokio::test]
async fn refresh_without_manifest_is_manifest_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let router = DynamicRouter::new(dir.path());
    repo::init_bare(&repo::bare_repo_path(dir.path(), "o", "bare")).unwrap();

    assert!(matches!(
        router.refresh("o", "bare"),
        Err(potstack::Error::ManifestNotFound { .. })
    ));
}
