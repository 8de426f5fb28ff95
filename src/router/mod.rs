//! Dynamic HTTP routing for pots.
//!
//! A thread-safe longest-prefix registry maps path prefixes to pot
//! handlers: static pots serve straight out of their repository's HEAD
//! tree, exe pots are reverse-proxied to the child's loopback port. All
//! four prefixes of a pot are swapped atomically under one writer lock,
//! so requests never observe a partially registered pot.

mod proxy;
mod static_files;

pub use proxy::ReverseProxy;
pub use static_files::serve_blob;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use axum::body::Body;
use axum::http::{header::HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::constants::RUN_STATE;
use crate::constants::SANDBOX_DIR;
use crate::error::{Error, Result};
use crate::pot::{PotManifest, RunState};
use crate::repo;

/// Header recording the stripped portion of the path, so downstreams can
/// build self-links.
pub const FORWARDED_PREFIX: &str = "x-forwarded-prefix";

/// Where a matched request goes.
#[derive(Debug, Clone)]
enum RouteTarget {
    /// Serve blobs from the repo's HEAD under this document root.
    Static { root: String },
    /// Reverse-proxy to the child on this loopback port.
    Proxy { port: u16 },
}

/// How the matched prefix rewrites the downstream path.
#[derive(Debug, Clone, Copy)]
enum Rewrite {
    /// `/pot/o/n/x` → `/x`
    StripPrefix,
    /// `/api/o/n/x` → `/api/x` (removes only `/o/n`)
    StripOwnerName,
}

#[derive(Debug, Clone)]
struct RouteEntry {
    owner: String,
    name: String,
    rewrite: Rewrite,
    target: RouteTarget,
}

#[derive(Default)]
struct Tables {
    /// prefix → entry, scanned for the longest match.
    path_routes: HashMap<String, RouteEntry>,
    /// `owner/name` → registered prefixes, for bulk removal.
    pot_routes: HashMap<String, Vec<String>>,
}

/// Thread-safe longest-prefix route registry.
pub struct DynamicRouter {
    repo_root: PathBuf,
    proxy: ReverseProxy,
    tables: RwLock<Tables>,
}

impl DynamicRouter {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            proxy: ReverseProxy::new(),
            tables: RwLock::new(Tables::default()),
        }
    }

    /// The four prefixes registered for a pot.
    pub fn prefixes(owner: &str, name: &str) -> [String; 4] {
        [
            format!("/pot/{owner}/{name}"),
            format!("/api/{owner}/{name}"),
            format!("/web/{owner}/{name}"),
            format!("/admin/{owner}/{name}"),
        ]
    }

    /// Registers a static pot. Replaces any previous registration.
    pub fn register_static(&self, owner: &str, name: &str, manifest: &PotManifest) -> Result<()> {
        self.install_routes(
            owner,
            name,
            RouteTarget::Static {
                root: manifest.root.clone(),
            },
        );
        Ok(())
    }

    /// Registers an exe pot, targeting the port recorded in `run.yml`.
    pub fn register_exe(&self, owner: &str, name: &str) -> Result<()> {
        let run_file = repo::bare_repo_path(&self.repo_root, owner, name)
            .join(SANDBOX_DIR)
            .join(RUN_STATE);
        let bytes = std::fs::read(&run_file).map_err(|_| Error::ManifestNotFound {
            owner: owner.to_string(),
            name: name.to_string(),
        })?;
        let rs: RunState = serde_yaml::from_slice(&bytes)?;
        if rs.runtime.port == 0 {
            return Err(Error::NoPortAssigned {
                owner: owner.to_string(),
                name: name.to_string(),
            });
        }

        self.install_routes(
            owner,
            name,
            RouteTarget::Proxy {
                port: rs.runtime.port,
            },
        );
        Ok(())
    }

    /// Removes all routes for a pot.
    pub fn remove_routes(&self, owner: &str, name: &str) {
        let mut tables = self.write_tables();
        Self::remove_locked(&mut tables, owner, name);
    }

    /// Registered prefixes for a pot, for introspection and tests.
    pub fn routes_for(&self, owner: &str, name: &str) -> Vec<String> {
        self.read_tables()
            .pot_routes
            .get(&format!("{owner}/{name}"))
            .cloned()
            .unwrap_or_default()
    }

    fn install_routes(&self, owner: &str, name: &str, target: RouteTarget) {
        let mut tables = self.write_tables();
        Self::remove_locked(&mut tables, owner, name);

        let prefixes = Self::prefixes(owner, name);
        let mut registered = Vec::with_capacity(prefixes.len());
        for (i, prefix) in prefixes.iter().enumerate() {
            let rewrite = if i == 0 {
                Rewrite::StripPrefix
            } else {
                Rewrite::StripOwnerName
            };
            tables.path_routes.insert(
                prefix.clone(),
                RouteEntry {
                    owner: owner.to_string(),
                    name: name.to_string(),
                    rewrite,
                    target: target.clone(),
                },
            );
            registered.push(prefix.clone());
            debug!(prefix = %prefix, "registered route");
        }
        tables
            .pot_routes
            .insert(format!("{owner}/{name}"), registered);
    }

    fn remove_locked(tables: &mut Tables, owner: &str, name: &str) {
        if let Some(prefixes) = tables.pot_routes.remove(&format!("{owner}/{name}")) {
            for prefix in prefixes {
                tables.path_routes.remove(&prefix);
            }
        }
    }

    /// Dispatches a request to the longest matching prefix, or 404.
    pub async fn dispatch(&self, req: Request<Body>) -> Response {
        let path = req.uri().path().to_string();

        let matched = {
            let tables = self.read_tables();
            let mut best: Option<(&String, &RouteEntry)> = None;
            for (prefix, entry) in &tables.path_routes {
                if path.starts_with(prefix.as_str())
                    && best.map(|(b, _)| prefix.len() > b.len()).unwrap_or(true)
                {
                    best = Some((prefix, entry));
                }
            }
            best.map(|(prefix, entry)| (prefix.clone(), entry.clone()))
        };

        let Some((prefix, entry)) = matched else {
            debug!(path = %path, "no route matched");
            return StatusCode::NOT_FOUND.into_response();
        };

        let (rewritten, stripped) = rewrite_path(&path, &prefix, &entry);
        match entry.target {
            RouteTarget::Static { ref root } => {
                // Static lookups always strip the full prefix: /web/o/n/x
                // resolves to <root>/x in the tree regardless of route
                // class. Class-preserving rewrites matter only to proxied
                // backends.
                let rest = path.strip_prefix(prefix.as_str()).unwrap_or("");
                let repo_path = repo::bare_repo_path(&self.repo_root, &entry.owner, &entry.name);
                let file = tree_path(root, rest);
                static_files::serve_from_head(&repo_path, &file).await
            }
            RouteTarget::Proxy { port } => {
                let mut req = req;
                if let Ok(value) = HeaderValue::from_str(&stripped) {
                    req.headers_mut()
                        .insert(HeaderName::from_static(FORWARDED_PREFIX), value);
                }
                self.proxy.forward(req, port, &rewritten).await
            }
        }
    }

    /// Refresh-control entry: re-reads `pot.yml` and re-registers.
    pub fn refresh(&self, owner: &str, name: &str) -> Result<()> {
        let manifest = repo::read_pot_manifest(&self.repo_root, owner, name)?;
        match manifest.kind {
            crate::pot::PotKind::Static => self.register_static(owner, name, &manifest),
            crate::pot::PotKind::Exe => self.register_exe(owner, name),
        }
    }

    fn read_tables(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_tables(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Computes the downstream path and the stripped portion for a match.
fn rewrite_path(path: &str, prefix: &str, entry: &RouteEntry) -> (String, String) {
    match entry.rewrite {
        Rewrite::StripPrefix => {
            let rest = path.strip_prefix(prefix).unwrap_or(path);
            (ensure_leading_slash(rest), prefix.to_string())
        }
        Rewrite::StripOwnerName => {
            let segment = format!("/{}/{}", entry.owner, entry.name);
            let rewritten = path.replacen(&segment, "", 1);
            (ensure_leading_slash(&rewritten), segment)
        }
    }
}

fn ensure_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Joins the document root and a request path into a tree path.
fn tree_path(root: &str, request_path: &str) -> String {
    let rel = request_path.trim_start_matches('/');
    if root.is_empty() {
        rel.to_string()
    } else {
        format!("{}/{}", root.trim_matches('/'), rel)
    }
}

impl std::fmt::Debug for DynamicRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.read_tables();
        f.debug_struct("DynamicRouter")
            .field("routes", &tables.path_routes.len())
            .field("pots", &tables.pot_routes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(rewrite: Rewrite) -> RouteEntry {
        RouteEntry {
            owner: "o".to_string(),
            name: "n".to_string(),
            rewrite,
            target: RouteTarget::Proxy { port: 1 },
        }
    }

    #[test]
    fn strip_prefix_drops_everything() {
        let (path, stripped) =
            rewrite_path("/pot/o/n/files/x.txt", "/pot/o/n", &entry(Rewrite::StripPrefix));
        assert_eq!(path, "/files/x.txt");
        assert_eq!(stripped, "/pot/o/n");
    }

    #[test]
    fn strip_owner_name_keeps_route_class() {
        let (path, stripped) =
            rewrite_path("/api/o/n/users", "/api/o/n", &entry(Rewrite::StripOwnerName));
        assert_eq!(path, "/api/users");
        assert_eq!(stripped, "/o/n");
    }

    #[test]
    fn bare_prefix_rewrites_to_root() {
        let (path, _) = rewrite_path("/pot/o/n", "/pot/o/n", &entry(Rewrite::StripPrefix));
        assert_eq!(path, "/");
    }

    #[test]
    fn tree_path_joins_root() {
        assert_eq!(tree_path("public", "/index.html"), "public/index.html");
        assert_eq!(tree_path("", "/index.html"), "index.html");
        assert_eq!(tree_path("/public/", "/a/b"), "public/a/b");
    }
}
