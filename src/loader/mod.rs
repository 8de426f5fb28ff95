//! Package ingestion and pinning.
//!
//! The loader verifies signed bundles, applies trust-on-first-use key
//! pinning per owner, and materialises package content into bare
//! repositories. Nothing is written for a package until its signature
//! verifies and every owner it touches passes the pin check.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::constants::{
    BASE_BUNDLE_NAME, POT_MANIFEST, SYSTEM_OWNER, SYSTEM_POTS, WAIT_FOR_SERVICE_RETRIES,
};
use crate::docker;
use crate::error::{Error, Result};
use crate::keeper::{PotProvider, UpdateSink};
use crate::package::{self, read_package, PpkHeader};
use crate::pot::{validate_pot_name, InstallManifest, PotManifest, PotUri};
use crate::repo;
use crate::store::{RepoStore, UserStore};

/// Loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Internal listener base URL, used as the readiness barrier.
    pub service_url: String,
    /// Base bundle to deploy at startup, if present on disk.
    pub base_bundle: Option<PathBuf>,
}

/// Orchestrates package verification, pinning, and materialisation.
pub struct Loader {
    cfg: LoaderConfig,
    repo_root: PathBuf,
    client: reqwest::Client,
    users: Arc<dyn UserStore>,
    repos: Arc<dyn RepoStore>,
    update_sink: OnceLock<Arc<dyn UpdateSink>>,
}

impl Loader {
    pub fn new(
        cfg: LoaderConfig,
        repo_root: &Path,
        users: Arc<dyn UserStore>,
        repos: Arc<dyn RepoStore>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            cfg,
            repo_root: repo_root.to_path_buf(),
            client,
            users,
            repos,
            update_sink: OnceLock::new(),
        }
    }

    /// Wires the redeploy capability. Pushes performed after this point
    /// notify the sink.
    pub fn set_update_sink(&self, sink: Arc<dyn UpdateSink>) {
        let _ = self.update_sink.set(sink);
    }

    /// Startup sequence: wait for the façade, ensure system owner and
    /// repos, then deploy the base bundle when one is configured.
    pub async fn initialize(&self) -> Result<()> {
        info!("loader initialisation starting");

        self.wait_for_service().await?;
        self.create_system_owner().await?;
        self.create_system_repos().await?;

        if let Some(bundle) = self.cfg.base_bundle.clone() {
            if bundle.exists() {
                self.deploy(&bundle).await?;
            } else {
                debug!(bundle = %bundle.display(), "no base bundle present, skipping");
            }
        }

        info!("loader initialisation completed");
        Ok(())
    }

    /// Polls the internal health endpoint until it answers 200. Purely a
    /// dependency-ordering barrier; bounded at roughly ten minutes since
    /// first-boot ACME issuance can hold the façade for a while.
    async fn wait_for_service(&self) -> Result<()> {
        info!("loader waiting for service");
        let url = format!("{}/health", self.cfg.service_url);

        for attempt in 0..WAIT_FOR_SERVICE_RETRIES {
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!("service is ready");
                    return Ok(());
                }
                _ => {}
            }
            if attempt > 0 && attempt % 30 == 0 {
                info!(attempt, "still waiting for service");
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        Err(Error::Internal(format!(
            "service not available after {WAIT_FOR_SERVICE_RETRIES} retries"
        )))
    }

    async fn create_system_owner(&self) -> Result<()> {
        match self
            .users
            .create_owner(SYSTEM_OWNER, "system@potstack.local")
            .await
        {
            Ok(_) => info!(owner = SYSTEM_OWNER, "system owner created"),
            Err(e) if e.is_conflict() => debug!("system owner already exists"),
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn create_system_repos(&self) -> Result<()> {
        for name in SYSTEM_POTS {
            match self.repos.create_repo(SYSTEM_OWNER, name).await {
                Ok(_) => info!(repo = %format!("{SYSTEM_OWNER}/{name}"), "system repo created"),
                Err(e) if e.is_conflict() => {
                    debug!(repo = %format!("{SYSTEM_OWNER}/{name}"), "system repo already exists");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Deploys every package listed in a bundle's `install.yml`.
    ///
    /// Per-package failures are logged and do not abort sibling packages;
    /// a corrupt outer bundle or missing manifest aborts the deploy.
    pub async fn deploy(&self, bundle_path: &Path) -> Result<()> {
        info!(bundle = %bundle_path.display(), "deploying bundle");

        let scratch = tempfile::tempdir()?;
        let bundle_bytes = std::fs::read(bundle_path)?;
        package::extract_zip(&bundle_bytes, scratch.path())?;

        let manifest_bytes = std::fs::read(scratch.path().join("install.yml"))
            .map_err(|e| Error::InvalidFormat(format!("install.yml missing: {e}")))?;
        let manifest: InstallManifest = serde_yaml::from_slice(&manifest_bytes)?;
        info!(
            version = %manifest.version,
            packages = manifest.packages.len(),
            "install manifest loaded"
        );

        for ppk_name in &manifest.packages {
            let ppk_path = scratch.path().join(ppk_name);
            if let Err(e) = self.deploy_package(&ppk_path).await {
                warn!(package = %ppk_name, error = %e, "package deployment failed");
            }
        }

        Ok(())
    }

    /// Verifies, pins, and materialises a single `.ppk`.
    pub async fn deploy_package(&self, ppk_path: &Path) -> Result<()> {
        info!(package = %ppk_path.display(), "deploying package");

        let mut file = std::fs::File::open(ppk_path)?;
        let (header, content) = read_package(&mut file)?;

        // Integrity self-check against the embedded key. Rejection here is
        // hard fatal for the package; nothing has touched the filesystem.
        header
            .verify(&content, Some(&header.public_key))
            .map_err(|e| match e {
                Error::BadSignature { .. } => Error::BadSignature {
                    path: ppk_path.to_path_buf(),
                },
                other => other,
            })?;
        debug!(key = %header.key_fingerprint(), "package signature verified");

        let scratch = tempfile::tempdir()?;
        package::extract_zip(&content, scratch.path())?;

        let owners = top_level_dirs(scratch.path())?;

        // Pin pass: every owner this package touches must pass TOFU or
        // byte-equality before any repository is written.
        for owner in &owners {
            self.enforce_pin(owner, &header).await?;
        }

        // Materialise pass.
        for owner in &owners {
            let owner_path = scratch.path().join(owner);
            for name in top_level_dirs(&owner_path)? {
                let pot_path = owner_path.join(&name);
                if let Err(e) = self.install_pot(owner, &name, &pot_path).await {
                    warn!(pot = %format!("{owner}/{name}"), error = %e, "failed to install pot");
                }
            }
        }

        Ok(())
    }

    /// TOFU / pin enforcement for one owner.
    async fn enforce_pin(&self, owner: &str, header: &PpkHeader) -> Result<()> {
        validate_pot_name(owner)?;

        if self.users.get_owner(owner).await?.is_none() {
            match self
                .users
                .create_owner(owner, &format!("{owner}@potstack.local"))
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e),
            }
        }

        match self.users.pinned_key(owner).await? {
            None => {
                self.users.set_pinned_key(owner, &header.public_key).await?;
                info!(
                    owner = %owner,
                    key = %header.key_fingerprint(),
                    "trusted owner key on first use"
                );
                Ok(())
            }
            Some(pinned) if pinned == header.public_key => Ok(()),
            Some(pinned) => {
                warn!(
                    owner = %owner,
                    pinned = %hex::encode(pinned),
                    offered = %header.key_fingerprint(),
                    "package key does not match pinned owner key, rejecting"
                );
                Err(Error::KeyMismatch {
                    owner: owner.to_string(),
                    pinned: hex::encode(pinned),
                    offered: header.key_fingerprint(),
                })
            }
        }
    }

    /// Ensures the repository exists, pre-pulls any referenced image, and
    /// pushes the extracted tree.
    async fn install_pot(&self, owner: &str, name: &str, pot_path: &Path) -> Result<()> {
        validate_pot_name(name)?;

        match self.repos.create_repo(owner, name).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {}
            Err(e) => return Err(e),
        }

        if let Ok(bytes) = std::fs::read(pot_path.join(POT_MANIFEST)) {
            if let Ok(manifest) = PotManifest::from_yaml(&bytes) {
                if let Some(image) = &manifest.docker {
                    let tag = docker::local_tag(owner, name);
                    if let Err(e) = docker::pull_and_tag(image, &tag).await {
                        warn!(image = %image, error = %e, "image pre-pull failed");
                    }
                }
            }
        }

        let bare = self.repos.repo_path(owner, name);
        repo::push_tree(&bare, pot_path)?;
        info!(pot = %format!("{owner}/{name}"), "pot materialised");

        if let Some(sink) = self.update_sink.get() {
            sink.signal_update(owner, name).await;
        }
        Ok(())
    }

    /// Default base bundle location, auto-copied from the executable's
    /// directory on first start when the data directory lacks one.
    pub fn ensure_base_bundle(data_dir: &Path) -> Option<PathBuf> {
        let target = data_dir.join(BASE_BUNDLE_NAME);
        if target.exists() {
            return Some(target);
        }

        let exe_dir = std::env::current_exe().ok()?.parent()?.to_path_buf();
        let source = exe_dir.join(BASE_BUNDLE_NAME);
        if !source.exists() {
            return None;
        }

        match std::fs::copy(&source, &target) {
            Ok(_) => {
                info!(bundle = %target.display(), "auto-deployed base bundle");
                Some(target)
            }
            Err(e) => {
                warn!(error = %e, "failed to copy base bundle");
                None
            }
        }
    }
}

impl PotProvider for Loader {
    /// Walks the repository root and returns every `<owner>/<name>.git`.
    fn installed_pots(&self) -> Vec<PotUri> {
        let mut pots = Vec::new();
        let Ok(owners) = std::fs::read_dir(&self.repo_root) else {
            return pots;
        };

        for owner_entry in owners.flatten() {
            if !owner_entry.path().is_dir() {
                continue;
            }
            let owner = owner_entry.file_name().to_string_lossy().to_string();
            let Ok(repos) = std::fs::read_dir(owner_entry.path()) else {
                continue;
            };
            for repo_entry in repos.flatten() {
                let file_name = repo_entry.file_name().to_string_lossy().to_string();
                if !repo_entry.path().is_dir() {
                    continue;
                }
                if let Some(name) = file_name.strip_suffix(".git") {
                    pots.push(PotUri::new(owner.clone(), name));
                }
            }
        }
        pots
    }
}

/// Names of the immediate subdirectories of `path`.
fn top_level_dirs(path: &Path) -> Result<Vec<String>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if entry.path().is_dir() {
            dirs.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    dirs.sort();
    Ok(dirs)
}
