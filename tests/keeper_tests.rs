//! Integration tests for sandbox lifecycle supervision.
//!
//! These spawn real child processes (a shell script standing in for
//! `pot.exe`), so they are Unix-only.

#![cfg(unix)]

use std::path::Path;

use potstack::keeper::{PotProvider, SandboxManager};
use potstack::pot::{PotUri, RunStatus};
use potstack::repo;

// =============================================================================
// Test Helpers
// =============================================================================

/// A pot provider with a fixed list.
struct Fixed(Vec<PotUri>);

impl PotProvider for Fixed {
    fn installed_pots(&self) -> Vec<PotUri> {
        self.0.clone()
    }
}

/// Creates an exe pot whose `pot.exe` is a long-running shell script.
fn make_exe_pot(repo_root: &Path, owner: &str, name: &str) {
    use std::os::unix::fs::PermissionsExt;

    let bare = repo::bare_repo_path(repo_root, owner, name);
    repo::init_bare(&bare).unwrap();

    let work = repo_root.join(format!("work-{owner}-{name}"));
    std::fs::create_dir_all(&work).unwrap();
    std::fs::write(
        work.join("pot.yml"),
        "type: exe\nenv:\n  - name: GREETING\n    value: hello\n",
    )
    .unwrap();
    let exe = work.join("pot.exe");
    std::fs::write(&exe, "#!/bin/sh\nwhile true; do sleep 1; done\n").unwrap();
    std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
    repo::push_tree(&bare, &work).unwrap();
}

fn pid_alive(pid: u32) -> bool {
    // Signal 0 probes for existence.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn start_spawns_child_and_records_run_state() {
    let dir = tempfile::tempdir().unwrap();
    make_exe_pot(dir.path(), "acme", "svc");

    let keeper = SandboxManager::new(dir.path());
    keeper.create_runtime("acme", "svc").unwrap();
    keeper.start("acme", "svc").await.unwrap();

    let rs = keeper.load_run_state("acme", "svc").unwrap();
    assert_eq!(rs.target_status, RunStatus::Running);
    assert!(rs.runtime.port > 0);
    assert!(rs.runtime.pid > 0);
    assert!(!rs.runtime.start_time.is_empty());

    // The recorded pid matches the tracked instance and is alive.
    assert_eq!(keeper.running_pid("acme", "svc"), Some(rs.runtime.pid));
    assert_eq!(keeper.running_port("acme", "svc"), Some(rs.runtime.port));
    assert!(pid_alive(rs.runtime.pid));

    keeper.stop("acme", "svc").await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_kills_child_and_records_stopped_intent() {
    let dir = tempfile::tempdir().unwrap();
    make_exe_pot(dir.path(), "acme", "svc");

    let keeper = SandboxManager::new(dir.path());
    keeper.create_runtime("acme", "svc").unwrap();
    keeper.start("acme", "svc").await.unwrap();
    let pid = keeper.running_pid("acme", "svc").unwrap();

    keeper.stop("acme", "svc").await.unwrap();

    let rs = keeper.load_run_state("acme", "svc").unwrap();
    assert_eq!(rs.target_status, RunStatus::Stopped);
    assert!(keeper.running_pid("acme", "svc").is_none());

    // The child dies within the contract's two seconds.
    let mut dead = false;
    for _ in 0..20 {
        if !pid_alive(pid) {
            dead = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    assert!(dead, "child survived stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn crashed_child_restarts_on_new_port() {
    let dir = tempfile::tempdir().unwrap();
    make_exe_pot(dir.path(), "acme", "svc");

    let keeper = SandboxManager::new(dir.path());
    keeper.create_runtime("acme", "svc").unwrap();
    keeper.start("acme", "svc").await.unwrap();
    let first_pid = keeper.running_pid("acme", "svc").unwrap();

    // Kill out-of-band while target stays `running`.
    unsafe {
        libc::kill(-(first_pid as i32), libc::SIGKILL);
    }

    // The waiter observes the exit, backs off one second, and respawns.
    let mut second_pid = None;
    for _ in 0..40 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        match keeper.running_pid("acme", "svc") {
            Some(pid) if pid != first_pid => {
                second_pid = Some(pid);
                break;
            }
            _ => {}
        }
    }
    let second_pid = second_pid.expect("child was not restarted");
    assert!(pid_alive(second_pid));

    keeper.stop("acme", "svc").await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn stopped_target_is_not_restarted_by_reconcile() {
    let dir = tempfile::tempdir().unwrap();
    make_exe_pot(dir.path(), "acme", "svc");

    let keeper = SandboxManager::new(dir.path());
    keeper.set_pot_provider(std::sync::Arc::new(Fixed(vec![PotUri::new("acme", "svc")])));

    // First reconcile initialises and starts.
    keeper.reconcile().await;
    assert!(keeper.running_pid("acme", "svc").is_some());

    keeper.stop("acme", "svc").await.unwrap();

    // Subsequent reconciles observe `stopped` intent and leave it alone.
    keeper.reconcile().await;
    keeper.reconcile().await;
    assert!(keeper.running_pid("acme", "svc").is_none());
    assert_eq!(
        keeper.load_run_state("acme", "svc").unwrap().target_status,
        RunStatus::Stopped
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn manifest_port_override_is_honoured() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let port = potstack::keeper::free_port().unwrap();

    let bare = repo::bare_repo_path(dir.path(), "acme", "fixed");
    repo::init_bare(&bare).unwrap();
    let work = dir.path().join("work-fixed");
    std::fs::create_dir_all(&work).unwrap();
    std::fs::write(
        work.join("pot.yml"),
        format!("type: exe\nenv:\n  - name: SU_SERVER_ADDR\n    value: 127.0.0.1:{port}\n"),
    )
    .unwrap();
    let exe = work.join("pot.exe");
    std::fs::write(&exe, "#!/bin/sh\nwhile true; do sleep 1; done\n").unwrap();
    std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
    repo::push_tree(&bare, &work).unwrap();

    let keeper = SandboxManager::new(dir.path());
    keeper.create_runtime("acme", "fixed").unwrap();
    keeper.start("acme", "fixed").await.unwrap();

    let rs = keeper.load_run_state("acme", "fixed").unwrap();
    assert_eq!(rs.runtime.port, port);

    keeper.stop("acme", "fixed").await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn start_rejects_static_pots() {
    let dir = tempfile::tempdir().unwrap();
    let bare = repo::bare_repo_path(dir.path(), "acme", "site");
    repo::init_bare(&bare).unwrap();
    let work = dir.path().join("work-site");
    std::fs::create_dir_all(&work).unwrap();
    std::fs::write(work.join("pot.yml"), "type: static\n").unwrap();
    repo::push_tree(&bare, &work).unwrap();

    let keeper = SandboxManager::new(dir.path());
    let err = keeper.start("acme", "site").await.unwrap_err();
    assert!(matches!(err, potstack::Error::WrongPotType { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn create_runtime_builds_working_area() {
    let dir = tempfile::tempdir().unwrap();
    make_exe_pot(dir.path(), "acme", "svc");

    let keeper = SandboxManager::new(dir.path());
    keeper.create_runtime("acme", "svc").unwrap();

    let sandbox = repo::bare_repo_path(dir.path(), "acme", "svc").join("data/faaspot");
    assert!(sandbox.join("data").is_dir());
    assert!(sandbox.join("log").is_dir());
    assert!(sandbox.join("program").join("pot.exe").exists());

    // Rebuilding replaces the program tree.
    std::fs::write(sandbox.join("program").join("stray.txt"), "x").unwrap();
    keeper.create_runtime("acme", "svc").unwrap();
    assert!(!sandbox.join("program").join("stray.txt").exists());
}
