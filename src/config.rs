//! Host configuration.
//!
//! Everything is driven by a handful of environment variables read once at
//! startup; all other locations derive from the data directory.

use std::path::{Path, PathBuf};

use crate::constants::{DEFAULT_ADMIN_PORT, DEFAULT_HTTP_PORT, INTERNAL_PORT};

/// Resolved host configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data root directory (`POTSTACK_DATA_DIR`, default `data`).
    pub data_dir: PathBuf,
    /// Business listener port (`POTSTACK_HTTP_PORT`).
    pub http_port: u16,
    /// Admin listener port (`POTSTACK_ADMIN_PORT`).
    pub admin_port: u16,
    /// Shared bearer/basic-auth secret (`POTSTACK_TOKEN`). Empty means all
    /// endpoints are open.
    pub token: Option<String>,
}

impl Config {
    /// Reads configuration from the environment.
    pub fn from_env() -> Self {
        Self {
            data_dir: PathBuf::from(env_or("POTSTACK_DATA_DIR", "data")),
            http_port: env_port("POTSTACK_HTTP_PORT", DEFAULT_HTTP_PORT),
            admin_port: env_port("POTSTACK_ADMIN_PORT", DEFAULT_ADMIN_PORT),
            token: std::env::var("POTSTACK_TOKEN").ok().filter(|t| !t.is_empty()),
        }
    }

    /// Repository root: `<data>/repo`.
    pub fn repo_dir(&self) -> PathBuf {
        self.data_dir.join("repo")
    }

    /// Certificate directory: `<data>/certs`.
    pub fn certs_dir(&self) -> PathBuf {
        self.data_dir.join("certs")
    }

    /// Leaf certificate path: `<data>/certs/cert.pem`.
    pub fn cert_file(&self) -> PathBuf {
        self.certs_dir().join("cert.pem")
    }

    /// Private key path: `<data>/certs/key.pem`.
    pub fn key_file(&self) -> PathBuf {
        self.certs_dir().join("key.pem")
    }

    /// HTTPS configuration file: `<data>/https.yaml`.
    pub fn https_config(&self) -> PathBuf {
        self.data_dir.join("https.yaml")
    }

    /// Log file: `<data>/log/potstack.log`.
    pub fn log_file(&self) -> PathBuf {
        self.data_dir.join("log").join("potstack.log")
    }

    /// Base URL of the internal listener, as injected into children.
    pub fn internal_base_url(&self) -> String {
        format!("http://localhost:{INTERNAL_PORT}")
    }

    /// Path of the bare repo for `(owner, name)`.
    pub fn bare_repo_path(repo_root: &Path, owner: &str, name: &str) -> PathBuf {
        repo_root.join(owner).join(format!("{name}.git"))
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_port(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths_hang_off_data_dir() {
        let cfg = Config {
            data_dir: PathBuf::from("/tmp/ps"),
            http_port: DEFAULT_HTTP_PORT,
            admin_port: DEFAULT_ADMIN_PORT,
            token: None,
        };
        assert_eq!(cfg.repo_dir(), PathBuf::from("/tmp/ps/repo"));
        assert_eq!(cfg.cert_file(), PathBuf::from("/tmp/ps/certs/cert.pem"));
        assert_eq!(cfg.https_config(), PathBuf::from("/tmp/ps/https.yaml"));
        assert_eq!(cfg.internal_base_url(), "http://localhost:61082");
    }

    #[test]
    fn bare_repo_path_appends_git_suffix() {
        let p = Config::bare_repo_path(Path::new("/d/repo"), "acme", "hello");
        assert_eq!(p, PathBuf::from("/d/repo/acme/hello.git"));
    }
}
