//! Certificate lifecycle management.
//!
//! The current leaf + key live in memory behind a reader/writer lock and
//! feed TLS handshakes through a `rustls` certificate resolver, so a
//! renewal is a pointer swap rather than a listener restart. On disk the
//! authoritative copies are `certs/cert.pem` and `certs/key.pem`;
//! renewals archive the previous pair first.

mod acme;
pub mod config;
mod dns;

pub use acme::AcmeClient;
pub use config::{HttpsConfig, HttpsState};
pub use dns::{provider_from_config, DnsProvider};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use chrono::Utc;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tracing::{debug, info, warn};

use crate::constants::{RENEWAL_CHECK_DELAY, RENEWAL_CHECK_INTERVAL, WATCH_INTERVAL};
use crate::error::{Error, Result};

/// Facts extracted from the on-disk certificate.
#[derive(Debug, Clone)]
pub struct CertFacts {
    pub not_before: i64,
    pub not_after: i64,
    pub names: Vec<String>,
    pub issuer: String,
}

impl CertFacts {
    pub fn remaining_days(&self) -> i64 {
        (self.not_after - Utc::now().timestamp()) / 86_400
    }

    pub fn expired(&self) -> bool {
        self.not_after <= Utc::now().timestamp()
    }

    pub fn covers(&self, domain: &str) -> bool {
        self.names.iter().any(|n| n == domain)
    }

    pub fn within_renew_window(&self, renew_before_days: u32) -> bool {
        self.not_after - Utc::now().timestamp() < i64::from(renew_before_days) * 86_400
    }
}

struct Inner {
    certs_dir: PathBuf,
    cert_file: PathBuf,
    key_file: PathBuf,
    state: Arc<HttpsState>,
    current: RwLock<Option<Arc<CertifiedKey>>>,
    last_mod: Mutex<Option<SystemTime>>,
}

/// Owns the in-memory certificate and its renewal schedule.
#[derive(Clone)]
pub struct CertManager {
    inner: Arc<Inner>,
}

impl CertManager {
    pub fn new(certs_dir: &Path, cert_file: &Path, key_file: &Path, state: Arc<HttpsState>) -> Self {
        Self {
            inner: Arc::new(Inner {
                certs_dir: certs_dir.to_path_buf(),
                cert_file: cert_file.to_path_buf(),
                key_file: key_file.to_path_buf(),
                state,
                current: RwLock::new(None),
                last_mod: Mutex::new(None),
            }),
        }
    }

    /// Startup: returns a TLS server config when HTTPS mode is on, `None`
    /// for plain HTTP. Performs initial issuance when no usable
    /// certificate exists.
    pub async fn setup(&self) -> Result<Option<Arc<ServerConfig>>> {
        let cfg = self.inner.state.get();
        if !cfg.is_https() {
            info!("mode: HTTP");
            return Ok(None);
        }

        std::fs::create_dir_all(&self.inner.certs_dir)?;

        if let Some(facts) = self.usable_cert(&cfg) {
            info!(
                remaining_days = facts.remaining_days(),
                "using existing certificate"
            );
            self.load_current()?;
            if facts.within_renew_window(cfg.acme.renew_before_days) {
                info!("certificate inside renewal window, scheduling renewal");
                let manager = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = manager.renew(true).await {
                        warn!(error = %e, "background renewal failed");
                    }
                });
            }
            return Ok(Some(self.server_config()));
        }

        // No usable certificate: issuance is required.
        if !cfg.acme.enabled {
            return Err(Error::CertificateInvalid(
                "HTTPS enabled but no certificate and ACME disabled".to_string(),
            ));
        }
        if cfg.acme.domain.is_empty() {
            return Err(Error::CertificateInvalid(
                "HTTPS enabled but no certificate and ACME domain not set".to_string(),
            ));
        }

        info!(
            domain = %cfg.acme.domain,
            challenge = %cfg.acme.challenge,
            "no usable certificate, starting issuance"
        );
        let client = AcmeClient::new(
            cfg.clone(),
            &self.inner.certs_dir,
            &self.inner.cert_file,
            &self.inner.key_file,
        );
        client.obtain_certificate().await?;
        self.load_current()?;
        Ok(Some(self.server_config()))
    }

    /// Builds a rustls config whose certificate resolution reads the
    /// manager's live slot on every handshake.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(CertResolver {
                manager: self.clone(),
            }));
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Arc::new(config)
    }

    /// Parses the on-disk pair into a `CertifiedKey` and swaps it in.
    /// The writer lock is held only for the pointer swap.
    pub fn load_current(&self) -> Result<()> {
        let certified = self.read_certified_key()?;
        let mut slot = self
            .inner
            .current
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::new(certified));
        debug!("certificate loaded into memory");
        Ok(())
    }

    fn read_certified_key(&self) -> Result<CertifiedKey> {
        let cert_bytes = std::fs::read(&self.inner.cert_file)?;
        let key_bytes = std::fs::read(&self.inner.key_file)?;

        let chain: Vec<_> = rustls_pemfile::certs(&mut cert_bytes.as_slice())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::CertificateInvalid(format!("bad cert.pem: {e}")))?;
        if chain.is_empty() {
            return Err(Error::CertificateInvalid("cert.pem holds no certificates".to_string()));
        }
        let key = rustls_pemfile::private_key(&mut key_bytes.as_slice())
            .map_err(|e| Error::CertificateInvalid(format!("bad key.pem: {e}")))?
            .ok_or_else(|| Error::CertificateInvalid("key.pem holds no key".to_string()))?;
        let signing_key = any_supported_type(&key)
            .map_err(|e| Error::CertificateInvalid(format!("unsupported key: {e}")))?;
        Ok(CertifiedKey::new(chain, signing_key))
    }

    /// Current certificate, for handshakes. Reader lock only.
    fn current(&self) -> Option<Arc<CertifiedKey>> {
        self.inner
            .current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Checks whether the on-disk certificate parses, is unexpired, and
    /// covers the configured domain.
    fn usable_cert(&self, cfg: &HttpsConfig) -> Option<CertFacts> {
        if !self.inner.cert_file.exists() || !self.inner.key_file.exists() {
            return None;
        }
        let facts = match parse_cert_file(&self.inner.cert_file) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "failed to parse certificate");
                return None;
            }
        };
        if facts.expired() {
            warn!("certificate has expired");
            return None;
        }
        if cfg.acme.enabled && !cfg.acme.domain.is_empty() && !facts.covers(&cfg.acme.domain) {
            warn!(
                cert_names = ?facts.names,
                domain = %cfg.acme.domain,
                "certificate does not cover configured domain"
            );
            return None;
        }
        Some(facts)
    }

    /// True when the certificate is missing, malformed, expired, or
    /// inside the renewal window.
    pub fn needs_renewal(&self) -> bool {
        let cfg = self.inner.state.get();
        if !cfg.acme.enabled {
            return false;
        }
        let facts = match parse_cert_file(&self.inner.cert_file) {
            Ok(f) => f,
            Err(_) => return true,
        };
        facts.expired() || facts.within_renew_window(cfg.acme.renew_before_days)
    }

    /// Renews the certificate: archive, re-issue, hot swap. Returns the
    /// archive directory when one was created.
    pub async fn renew(&self, with_backup: bool) -> Result<Option<String>> {
        let cfg = self.inner.state.get();
        if !cfg.acme.enabled || cfg.acme.domain.is_empty() {
            return Err(Error::Config("ACME not enabled".to_string()));
        }

        let archive_dir = if with_backup {
            match self.archive_current() {
                Ok(dir) => dir,
                Err(e) => {
                    warn!(error = %e, "failed to archive current certificate");
                    None
                }
            }
        } else {
            None
        };

        let client = AcmeClient::new(
            cfg,
            &self.inner.certs_dir,
            &self.inner.cert_file,
            &self.inner.key_file,
        );
        client.obtain_certificate().await?;
        self.load_current()?;
        info!("certificate renewed");
        Ok(archive_dir)
    }

    /// Admin-triggered renewal; reports the archive path to the caller.
    pub async fn force_renew(&self) -> Result<Option<String>> {
        self.renew(true).await
    }

    /// Copies the current pair into `certs/archive/<timestamp>/`.
    pub fn archive_current(&self) -> Result<Option<String>> {
        if !self.inner.cert_file.exists() {
            return Ok(None);
        }
        let stamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let archive_dir = self.inner.certs_dir.join("archive").join(&stamp);
        std::fs::create_dir_all(&archive_dir)?;
        std::fs::copy(&self.inner.cert_file, archive_dir.join("cert.pem"))?;
        if self.inner.key_file.exists() {
            std::fs::copy(&self.inner.key_file, archive_dir.join("key.pem"))?;
        }
        info!(archive = %archive_dir.display(), "archived certificate");
        Ok(Some(archive_dir.display().to_string()))
    }

    /// Certificate facts for the admin info endpoint.
    pub fn cert_info(&self) -> Result<serde_json::Value> {
        let facts = parse_cert_file(&self.inner.cert_file)?;
        let cfg = self.inner.state.get();
        Ok(serde_json::json!({
            "domain": facts.names,
            "issuer": facts.issuer,
            "not_before": chrono::DateTime::from_timestamp(facts.not_before, 0)
                .map(|t| t.to_rfc3339()),
            "not_after": chrono::DateTime::from_timestamp(facts.not_after, 0)
                .map(|t| t.to_rfc3339()),
            "remaining_days": facts.remaining_days(),
            "needs_renewal": facts.within_renew_window(cfg.acme.renew_before_days),
        }))
    }

    /// Renewal checker task: a startup delay, then one check per interval.
    pub fn spawn_renewal_checker(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(RENEWAL_CHECK_DELAY) => {}
                _ = shutdown.changed() => return,
            }
            let mut ticker = tokio::time::interval(RENEWAL_CHECK_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if manager.needs_renewal() {
                            info!("certificate needs renewal, starting background renewal");
                            if let Err(e) = manager.renew(true).await {
                                warn!(error = %e, "scheduled renewal failed");
                            }
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        })
    }

    /// Cert-file watcher task: reloads on external modification (manual
    /// rotation).
    pub fn spawn_cert_watcher(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WATCH_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Ok(meta) = std::fs::metadata(&manager.inner.cert_file) else { continue };
                        let Ok(modified) = meta.modified() else { continue };
                        let changed = {
                            let mut last = manager
                                .inner
                                .last_mod
                                .lock()
                                .unwrap_or_else(|e| e.into_inner());
                            let changed = last.map(|t| modified > t).unwrap_or(false);
                            *last = Some(modified);
                            changed
                        };
                        if changed {
                            match manager.load_current() {
                                Ok(()) => info!("certificate reloaded from disk"),
                                Err(e) => warn!(error = %e, "failed to reload certificate"),
                            }
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        })
    }
}

/// Resolver handed to rustls; every handshake reads the live slot.
#[derive(Debug)]
struct CertResolver {
    manager: CertManager,
}

impl std::fmt::Debug for CertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertManager")
            .field("cert_file", &self.inner.cert_file)
            .finish()
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.manager.current()
    }
}

/// Extracts validity, names, and issuer from a PEM certificate file.
pub fn parse_cert_file(path: &Path) -> Result<CertFacts> {
    let pem_bytes = std::fs::read(path)?;
    let (_, pem) = x509_parser::pem::parse_x509_pem(&pem_bytes)
        .map_err(|e| Error::CertificateInvalid(format!("bad PEM: {e}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| Error::CertificateInvalid(format!("bad certificate: {e}")))?;

    let mut names = Vec::new();
    if let Some(cn) = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
    {
        names.push(cn.to_string());
    }
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let x509_parser::extensions::GeneralName::DNSName(dns) = name {
                if !names.iter().any(|n| n == dns) {
                    names.push((*dns).to_string());
                }
            }
        }
    }

    Ok(CertFacts {
        not_before: cert.validity().not_before.timestamp(),
        not_after: cert.validity().not_after.timestamp(),
        names,
        issuer: cert.issuer().to_string(),
    })
}
