//! HTTPS configuration cell.
//!
//! `https.yaml` lives under the data directory and is hot-reloaded by an
//! mtime poll. Readers always re-fetch the cell; a snapshot must never be
//! cached across an await.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::constants::WATCH_INTERVAL;
use crate::error::Result;

/// Serving mode.
pub const MODE_HTTP: &str = "http";
pub const MODE_HTTPS: &str = "https";

/// Top-level `https.yaml` schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpsConfig {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub acme: AcmeConfig,
}

/// ACME configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_challenge")]
    pub challenge: String,
    #[serde(default)]
    pub http: HttpChallenge,
    #[serde(default)]
    pub dns: DnsChallenge,
    #[serde(default = "default_directories")]
    pub directories: Vec<String>,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_renew_before")]
    pub renew_before_days: u32,
    #[serde(default)]
    pub email: String,
}

/// HTTP-01 challenge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpChallenge {
    #[serde(default = "default_http_port")]
    pub port: u16,
}

/// DNS-01 challenge settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsChallenge {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub credentials: HashMap<String, String>,
}

fn default_mode() -> String {
    MODE_HTTP.to_string()
}
fn default_true() -> bool {
    true
}
fn default_challenge() -> String {
    "dns-01".to_string()
}
fn default_directories() -> Vec<String> {
    vec!["https://acme-v02.api.letsencrypt.org/directory".to_string()]
}
fn default_retry_count() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    5
}
fn default_renew_before() -> u32 {
    30
}
fn default_http_port() -> u16 {
    80
}

impl Default for HttpChallenge {
    fn default() -> Self {
        Self {
            port: default_http_port(),
        }
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            domain: String::new(),
            challenge: default_challenge(),
            http: HttpChallenge::default(),
            dns: DnsChallenge {
                provider: "dnspod".to_string(),
                credentials: HashMap::new(),
            },
            directories: default_directories(),
            retry_count: default_retry_count(),
            retry_delay_seconds: default_retry_delay(),
            renew_before_days: default_renew_before(),
            email: String::new(),
        }
    }
}

impl Default for HttpsConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            acme: AcmeConfig::default(),
        }
    }
}

impl HttpsConfig {
    /// Normalises empty fields back to their defaults, so a hand-edited
    /// file with blanked values keeps working.
    fn normalise(mut self) -> Self {
        if self.acme.challenge.is_empty() {
            self.acme.challenge = default_challenge();
        }
        if self.acme.retry_count == 0 {
            self.acme.retry_count = default_retry_count();
        }
        if self.acme.retry_delay_seconds == 0 {
            self.acme.retry_delay_seconds = default_retry_delay();
        }
        if self.acme.renew_before_days == 0 {
            self.acme.renew_before_days = default_renew_before();
        }
        if self.acme.directories.is_empty() {
            self.acme.directories = default_directories();
        }
        self
    }

    pub fn is_https(&self) -> bool {
        self.mode == MODE_HTTPS
    }

    /// The first configured directory URL.
    pub fn directory_url(&self) -> &str {
        self.acme
            .directories
            .first()
            .map(String::as_str)
            .unwrap_or("https://acme-v02.api.letsencrypt.org/directory")
    }
}

/// Guarded live value of `https.yaml`.
pub struct HttpsState {
    path: PathBuf,
    current: RwLock<Arc<HttpsConfig>>,
    last_mod: Mutex<Option<SystemTime>>,
}

impl HttpsState {
    /// Loads the config, creating a default file when none exists.
    pub fn init(path: &Path) -> Result<Arc<Self>> {
        let state = Arc::new(Self {
            path: path.to_path_buf(),
            current: RwLock::new(Arc::new(HttpsConfig::default())),
            last_mod: Mutex::new(None),
        });

        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let body = serde_yaml::to_string(&HttpsConfig::default())?;
            let header = "# PotStack HTTPS configuration\n# Edits take effect within ~30 seconds.\n\n";
            std::fs::write(path, format!("{header}{body}"))?;
            info!(config = %path.display(), "created default https config");
        }

        state.reload()?;
        Ok(state)
    }

    /// Current snapshot. Re-fetch on every use.
    pub fn get(&self) -> Arc<HttpsConfig> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn reload(&self) -> Result<()> {
        let cfg = match std::fs::read(&self.path) {
            Ok(bytes) => serde_yaml::from_slice::<HttpsConfig>(&bytes)?.normalise(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HttpsConfig::default(),
            Err(e) => return Err(e.into()),
        };
        info!(mode = %cfg.mode, "https config loaded");
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(cfg);
        Ok(())
    }

    /// Spawns the mtime-poll hot-reload task.
    pub fn spawn_watcher(
        self: &Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WATCH_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Ok(meta) = std::fs::metadata(&state.path) else { continue };
                        let Ok(modified) = meta.modified() else { continue };
                        let changed = {
                            let mut last = state.last_mod.lock().unwrap_or_else(|e| e.into_inner());
                            let changed = last.map(|t| modified > t).unwrap_or(true);
                            *last = Some(modified);
                            changed
                        };
                        if changed {
                            if let Err(e) = state.reload() {
                                warn!(error = %e, "failed to reload https config");
                            }
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = HttpsConfig::default();
        assert_eq!(cfg.mode, "http");
        assert!(cfg.acme.enabled);
        assert_eq!(cfg.acme.challenge, "dns-01");
        assert_eq!(cfg.acme.renew_before_days, 30);
        assert_eq!(cfg.acme.retry_count, 3);
        assert!(cfg.directory_url().contains("letsencrypt"));
    }

    #[test]
    fn init_creates_file_and_parses_it_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("https.yaml");
        let state = HttpsState::init(&path).unwrap();
        assert!(path.exists());
        assert!(!state.get().is_https());
    }

    #[test]
    fn partial_yaml_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("https.yaml");
        std::fs::write(&path, "mode: https\nacme:\n  domain: pots.example.com\n").unwrap();
        let state = HttpsState::init(&path).unwrap();
        let cfg = state.get();
        assert!(cfg.is_https());
        assert_eq!(cfg.acme.domain, "pots.example.com");
        assert_eq!(cfg.acme.challenge, "dns-01");
        assert_eq!(cfg.acme.renew_before_days, 30);
    }
}
