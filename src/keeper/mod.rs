//! Sandbox lifecycle supervision.
//!
//! The keeper reconciles declared target state (`run.yml`) to running
//! child processes: it materialises working trees from bare repos, spawns
//! children with kill-on-parent-death guarantees, restarts crashes,
//! reclaims stale state, and nudges the router after every transition.
//!
//! ## Lock discipline
//!
//! The running-instance map sits behind one reader/writer lock. Writers
//! never hold it across network I/O: every `start`/`stop` mutates the map
//! inside an explicit scope, drops the guard, and only then issues the
//! route-refresh HTTP call.

mod process;

pub use process::{JobChild, ProcessKiller};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::constants::{
    INTERNAL_PORT, POT_EXECUTABLE, RECONCILE_INTERVAL, REFRESH_TIMEOUT, RESTART_BACKOFF,
    RUN_STATE, SANDBOX_DIR, SYSTEM_OWNER,
};
use crate::error::{Error, Result};
use crate::pot::{PotKind, PotUri, RunState, RunStatus};
use crate::repo;

/// Supplies the current list of installed pots.
pub trait PotProvider: Send + Sync {
    fn installed_pots(&self) -> Vec<PotUri>;
}

/// Narrow capability handed to the Loader so it can ask for a redeploy
/// without depending on the keeper type.
#[async_trait]
pub trait UpdateSink: Send + Sync {
    async fn signal_update(&self, owner: &str, name: &str);
}

/// A live sandbox child tracked by the keeper.
struct Instance {
    pid: u32,
    port: u16,
    killer: ProcessKiller,
}

struct Inner {
    repo_root: PathBuf,
    refresh_url: String,
    client: reqwest::Client,
    provider: RwLock<Option<Arc<dyn PotProvider>>>,
    running: RwLock<HashMap<String, Instance>>,
}

/// Reconciles pots to running children. Cheap to clone; all clones share
/// one running map.
#[derive(Clone)]
pub struct SandboxManager {
    inner: Arc<Inner>,
}

impl SandboxManager {
    pub fn new(repo_root: &Path) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REFRESH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            inner: Arc::new(Inner {
                repo_root: repo_root.to_path_buf(),
                refresh_url: format!(
                    "http://localhost:{INTERNAL_PORT}/pot/{SYSTEM_OWNER}/router/refresh"
                ),
                client,
                provider: RwLock::new(None),
                running: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Wires the pot provider. The keeper is inert until this is set.
    pub fn set_pot_provider(&self, provider: Arc<dyn PotProvider>) {
        *self.write_provider() = Some(provider);
    }

    /// Main loop: an initial reconcile, then one pass every tick until
    /// `shutdown` fires. Passes are serial; no two overlap.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!("keeper started, monitoring sandboxes");
        self.reconcile().await;

        let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.reconcile().await,
                _ = shutdown.changed() => {
                    info!("keeper stopped");
                    return;
                }
            }
        }
    }

    /// One reconcile pass over every known pot.
    pub async fn reconcile(&self) {
        let Some(provider) = self.read_provider() else {
            return;
        };
        let mut pots = provider.installed_pots();

        // If a dedicated keeper pot is installed, it takes over full
        // reconciliation through the admin API; the built-in keeper then
        // supervises only that pot.
        if let Some(keeper_pot) = pots
            .iter()
            .find(|p| p.owner == SYSTEM_OWNER && p.name == "keeper")
            .cloned()
        {
            let is_exe = repo::read_pot_manifest(&self.inner.repo_root, SYSTEM_OWNER, "keeper")
                .map(|m| m.kind == PotKind::Exe)
                .unwrap_or(false);
            if is_exe {
                debug!("external keeper pot present, supervising only it");
                pots = vec![keeper_pot];
            }
        }

        for pot in pots {
            self.reconcile_pot(&pot).await;
        }
    }

    async fn reconcile_pot(&self, pot: &PotUri) {
        let manifest = match repo::read_pot_manifest(&self.inner.repo_root, &pot.owner, &pot.name) {
            Ok(m) => m,
            Err(_) => return, // no pot.yml, skip
        };

        match manifest.kind {
            PotKind::Static => {
                self.refresh_route(&pot.owner, &pot.name).await;
            }
            PotKind::Exe => {
                let run_state = self.load_run_state(&pot.owner, &pot.name);
                match run_state {
                    Err(_) => {
                        info!(pot = %pot, "initialising sandbox");
                        if let Err(e) = self.create_runtime(&pot.owner, &pot.name) {
                            warn!(pot = %pot, error = %e, "failed to create runtime");
                            return;
                        }
                        if let Err(e) = self.start(&pot.owner, &pot.name).await {
                            warn!(pot = %pot, error = %e, "failed to start sandbox");
                        }
                    }
                    Ok(rs) if rs.target_status == RunStatus::Running => {
                        if self.is_running(&pot.key()) {
                            // Already up; make sure the route reflects the
                            // current port.
                            self.refresh_route(&pot.owner, &pot.name).await;
                        } else if let Err(e) = self.start(&pot.owner, &pot.name).await {
                            warn!(pot = %pot, error = %e, "failed to start sandbox");
                        }
                    }
                    Ok(_) => {
                        if self.is_running(&pot.key()) {
                            if let Err(e) = self.stop(&pot.owner, &pot.name).await {
                                warn!(pot = %pot, error = %e, "failed to stop sandbox");
                            }
                        }
                    }
                }
            }
        }
    }

    /// Clones the bare repo into a fresh `program/` working tree and
    /// creates the `data/` and `log/` directories beside it.
    pub fn create_runtime(&self, owner: &str, name: &str) -> Result<()> {
        let bare = repo::bare_repo_path(&self.inner.repo_root, owner, name);
        if !bare.exists() {
            return Err(Error::PotNotFound {
                owner: owner.to_string(),
                name: name.to_string(),
            });
        }

        let sandbox = bare.join(SANDBOX_DIR);
        std::fs::create_dir_all(sandbox.join("data"))?;
        std::fs::create_dir_all(sandbox.join("log"))?;

        let program = sandbox.join("program");
        if program.exists() {
            std::fs::remove_dir_all(&program)?;
        }
        repo::clone_to(&bare, &program)?;
        Ok(())
    }

    /// Starts the exe sandbox `(owner, name)`: allocates a port, spawns
    /// the child, persists `run.yml`, parks a waiter on the exit, then
    /// refreshes the route.
    pub async fn start(&self, owner: &str, name: &str) -> Result<()> {
        let key = format!("{owner}/{name}");
        if self.is_running(&key) {
            return Ok(());
        }

        let manifest = repo::read_pot_manifest(&self.inner.repo_root, owner, name)?;
        if manifest.kind != PotKind::Exe {
            return Err(Error::WrongPotType {
                key: key.clone(),
                kind: manifest.kind.to_string(),
                expected: "exe".to_string(),
            });
        }

        let bare = repo::bare_repo_path(&self.inner.repo_root, owner, name);
        let sandbox = bare.join(SANDBOX_DIR);
        let program_dir = sandbox.join("program");

        // Port: manifest override wins, otherwise ask the OS.
        let (addr, port) = match manifest.env_value("SU_SERVER_ADDR") {
            Some(custom) => {
                let port = custom
                    .rsplit(':')
                    .next()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(0);
                (custom.to_string(), port)
            }
            None => {
                let port = free_port()?;
                (format!("127.0.0.1:{port}"), port)
            }
        };

        let exe = program_dir.join(POT_EXECUTABLE);
        if !exe.exists() {
            return Err(Error::ExecutableNotFound { path: exe });
        }

        let mut env: HashMap<String, String> = std::env::vars().collect();
        env.insert(
            "DATA_PATH".to_string(),
            sandbox.join("data").display().to_string(),
        );
        env.insert("PROGRAM_PATH".to_string(), program_dir.display().to_string());
        env.insert(
            "LOG_PATH".to_string(),
            sandbox.join("log").display().to_string(),
        );
        env.insert(
            "POTSTACK_BASE_URL".to_string(),
            format!("http://localhost:{INTERNAL_PORT}"),
        );
        env.insert("SU_SERVER_ADDR".to_string(), addr);
        for var in &manifest.env {
            env.insert(var.name.clone(), var.value.clone());
        }

        let child = JobChild::spawn(&exe, &[], &program_dir, &env)?;
        let pid = child.pid();

        self.save_run_state(
            owner,
            name,
            &RunState::running(pid, port, Utc::now().to_rfc3339()),
        )?;

        {
            let mut running = self.write_running();
            running.insert(
                key.clone(),
                Instance {
                    pid,
                    port,
                    killer: child.killer(),
                },
            );
        }
        info!(pot = %key, pid, port, "started sandbox");

        self.spawn_waiter(key, owner.to_string(), name.to_string(), child);

        // Guard dropped above; safe to talk to the router now.
        self.refresh_route(owner, name).await;
        Ok(())
    }

    /// Stops the sandbox: kills the child, records `stopped` intent, and
    /// removes the route.
    pub async fn stop(&self, owner: &str, name: &str) -> Result<()> {
        let key = format!("{owner}/{name}");

        // Record intent before killing, so the waiter observing the exit
        // reads `stopped` and quiesces instead of restarting.
        let mut rs = self
            .load_run_state(owner, name)
            .unwrap_or_else(|_| RunState::stopped());
        rs.target_status = RunStatus::Stopped;
        self.save_run_state(owner, name, &rs)?;

        {
            let mut running = self.write_running();
            if let Some(instance) = running.remove(&key) {
                instance.killer.kill();
            }
        }

        self.refresh_route(owner, name).await;
        info!(pot = %key, "stopped sandbox");
        Ok(())
    }

    /// Called by the Loader after a push: rematerialise and restart.
    pub async fn handle_update(&self, owner: &str, name: &str) {
        info!(pot = %format!("{owner}/{name}"), "received update signal");
        if let Err(e) = self.create_runtime(owner, name) {
            warn!(error = %e, "failed to update runtime");
            return;
        }
        if let Err(e) = self.stop(owner, name).await {
            warn!(error = %e, "stop during update failed");
        }
        if let Err(e) = self.start(owner, name).await {
            warn!(error = %e, "restart after update failed");
        }
    }

    /// Port recorded for a running instance, if any. Test aid.
    pub fn running_port(&self, owner: &str, name: &str) -> Option<u16> {
        self.read_running()
            .get(&format!("{owner}/{name}"))
            .map(|i| i.port)
    }

    /// Pid recorded for a running instance, if any. Test aid.
    pub fn running_pid(&self, owner: &str, name: &str) -> Option<u32> {
        self.read_running()
            .get(&format!("{owner}/{name}"))
            .map(|i| i.pid)
    }

    fn spawn_waiter(&self, key: String, owner: String, name: String, mut child: JobChild) {
        let manager = self.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            info!(pot = %key, status = ?status, "sandbox exited");

            {
                let mut running = manager.write_running();
                running.remove(&key);
            }

            let restart = manager
                .load_run_state(&owner, &name)
                .map(|rs| rs.target_status == RunStatus::Running)
                .unwrap_or(false);
            if restart {
                info!(pot = %key, "auto-restarting");
                tokio::time::sleep(RESTART_BACKOFF).await;
                // Intent may have flipped to `stopped` during the backoff.
                let still_wanted = manager
                    .load_run_state(&owner, &name)
                    .map(|rs| rs.target_status == RunStatus::Running)
                    .unwrap_or(false);
                if !still_wanted {
                    return;
                }
                if let Err(e) = manager.start(&owner, &name).await {
                    warn!(pot = %key, error = %e, "restart failed, next reconcile retries");
                }
            }
        });
    }

    /// POSTs the refresh control endpoint. Never called with the running
    /// map locked.
    async fn refresh_route(&self, owner: &str, name: &str) {
        let body = serde_json::json!({ "org": owner, "name": name });
        match self
            .inner
            .client
            .post(&self.inner.refresh_url)
            .json(&body)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                debug!(pot = %format!("{owner}/{name}"), "route refreshed");
            }
            Ok(resp) => {
                warn!(
                    pot = %format!("{owner}/{name}"),
                    status = %resp.status(),
                    "route refresh rejected"
                );
            }
            Err(e) => {
                warn!(pot = %format!("{owner}/{name}"), error = %e, "route refresh failed");
            }
        }
    }

    fn run_state_path(&self, owner: &str, name: &str) -> PathBuf {
        repo::bare_repo_path(&self.inner.repo_root, owner, name)
            .join(SANDBOX_DIR)
            .join(RUN_STATE)
    }

    /// Reads `run.yml` for the pot.
    pub fn load_run_state(&self, owner: &str, name: &str) -> Result<RunState> {
        let bytes = std::fs::read(self.run_state_path(owner, name))?;
        Ok(serde_yaml::from_slice(&bytes)?)
    }

    fn save_run_state(&self, owner: &str, name: &str, rs: &RunState) -> Result<()> {
        let path = self.run_state_path(owner, name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(rs)?)?;
        Ok(())
    }

    fn is_running(&self, key: &str) -> bool {
        self.read_running().contains_key(key)
    }

    fn read_running(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Instance>> {
        self.inner.running.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_running(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Instance>> {
        self.inner.running.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read_provider(&self) -> Option<Arc<dyn PotProvider>> {
        self.inner
            .provider
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn write_provider(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<dyn PotProvider>>> {
        self.inner
            .provider
            .write()
            .unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl UpdateSink for SandboxManager {
    async fn signal_update(&self, owner: &str, name: &str) {
        self.handle_update(owner, name).await;
    }
}

/// Asks the OS for a free loopback TCP port: bind to zero, record, release.
///
/// The window between release and the child's own bind is accepted; the
/// child is expected to retry transient bind failures.
pub fn free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
        .map_err(|e| Error::PortUnavailable(e.to_string()))?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::PortUnavailable(e.to_string()))?
        .port();
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_port_is_nonzero_and_bindable() {
        let port = free_port().unwrap();
        assert!(port > 0);
        // The port was released; binding it again must work.
        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    }
}
