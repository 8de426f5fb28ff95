//! Cross-platform sandbox child spawning.
//!
//! Children must die with the host no matter how the host exits, so the
//! guarantee has to come from the OS rather than from cleanup code:
//!
//! | Platform | Mechanism                                            |
//! |----------|------------------------------------------------------|
//! | Linux    | `PR_SET_PDEATHSIG` = SIGKILL, own process group      |
//! | Unix     | Own process group (no pdeathsig outside Linux)       |
//! | Windows  | Job Object with `KILL_ON_JOB_CLOSE`                  |
//!
//! On Windows the process is assigned to the job immediately after spawn;
//! a suspended-start-then-resume dance is not expressible through the
//! standard process API, so a bounded race window is accepted for
//! single-server-process children.

use std::collections::HashMap;
use std::path::Path;
use std::process::ExitStatus;

use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::{Error, Result};

/// A spawned sandbox child with its kill-on-parent-death arrangement.
///
/// The waiter task takes ownership and parks on [`JobChild::wait`]; the
/// keeper keeps only the detached [`ProcessKiller`] for stop requests.
pub struct JobChild {
    pid: u32,
    child: Child,
    killer: ProcessKiller,
}

impl JobChild {
    /// Spawns `program` with `cwd` and `env`, wired for parent-death reaping.
    pub fn spawn(
        program: &Path,
        args: &[String],
        cwd: &Path,
        env: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.current_dir(cwd);
        cmd.envs(env);
        cmd.kill_on_drop(false);

        platform::prepare(&mut cmd);

        let child = cmd.spawn().map_err(|e| Error::StartFailed {
            key: program.display().to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id().ok_or_else(|| Error::StartFailed {
            key: program.display().to_string(),
            reason: "child exited before pid was observed".to_string(),
        })?;

        let killer = platform::attach(pid)?;
        debug!(pid, program = %program.display(), "spawned sandbox child");

        Ok(Self { pid, child, killer })
    }

    /// OS process id of the child.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Detached kill handle, cheap to clone and hold in the running map.
    pub fn killer(&self) -> ProcessKiller {
        self.killer.clone()
    }

    /// Waits for the child to exit. Observable exactly once; the waiter
    /// task owns the child for exactly this reason.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }
}

/// Kills a child (and its descendants where the platform supports it)
/// without owning the child handle.
#[derive(Debug, Clone)]
pub struct ProcessKiller {
    pid: u32,
    #[cfg(windows)]
    job: std::sync::Arc<platform::JobHandle>,
}

impl ProcessKiller {
    /// Terminates the child. Idempotent: killing an already-dead process
    /// is not an error.
    pub fn kill(&self) {
        platform::kill(self);
    }
}

// =============================================================================
// Unix Implementation
// =============================================================================

#[cfg(unix)]
mod platform {
    use super::ProcessKiller;
    use crate::error::Result;
    use tokio::process::Command;

    pub fn prepare(cmd: &mut Command) {
        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            cmd.pre_exec(|| {
                // Own process group, so a group kill reaches descendants.
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                // Linux delivers SIGKILL when the parent dies for any
                // reason; other Unixes fall back to the process group.
                #[cfg(target_os = "linux")]
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    pub fn attach(pid: u32) -> Result<ProcessKiller> {
        Ok(ProcessKiller { pid })
    }

    pub fn kill(killer: &ProcessKiller) {
        // Negative pid addresses the whole process group. ESRCH (already
        // gone) is fine.
        // SAFETY: kill(2) with a group id we created at spawn time.
        unsafe {
            libc::kill(-(killer.pid as i32), libc::SIGKILL);
        }
    }
}

// =============================================================================
// Windows Implementation
// =============================================================================

#[cfg(windows)]
mod platform {
    use super::ProcessKiller;
    use crate::error::{Error, Result};
    use std::sync::Arc;
    use tokio::process::Command;
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::System::JobObjects::{
        AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
        SetInformationJobObject, TerminateJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
        JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
    };
    use windows_sys::Win32::System::Threading::{
        OpenProcess, PROCESS_SET_QUOTA, PROCESS_TERMINATE,
    };

    /// Owned job object handle. Closing it is what kills the job's
    /// processes when the host dies; keep it alive for the child's
    /// lifetime.
    #[derive(Debug)]
    pub struct JobHandle(HANDLE);

    // SAFETY: job object handles are process-global kernel handles and
    // are safe to use from any thread.
    unsafe impl Send for JobHandle {}
    unsafe impl Sync for JobHandle {}

    impl Drop for JobHandle {
        fn drop(&mut self) {
            // KILL_ON_JOB_CLOSE makes this drop the kill switch of last
            // resort; the OS also closes it when the host terminates.
            unsafe {
                CloseHandle(self.0);
            }
        }
    }

    pub fn prepare(_cmd: &mut Command) {}

    pub fn attach(pid: u32) -> Result<ProcessKiller> {
        // SAFETY: Win32 calls with handles we own; every failure path
        // closes what was opened.
        unsafe {
            let job = CreateJobObjectW(std::ptr::null(), std::ptr::null());
            if job == 0 {
                return Err(Error::StartFailed {
                    key: pid.to_string(),
                    reason: "CreateJobObjectW failed".to_string(),
                });
            }

            let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = std::mem::zeroed();
            info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
            if SetInformationJobObject(
                job,
                JobObjectExtendedLimitInformation,
                &info as *const _ as *const core::ffi::c_void,
                std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            ) == 0
            {
                CloseHandle(job);
                return Err(Error::StartFailed {
                    key: pid.to_string(),
                    reason: "SetInformationJobObject failed".to_string(),
                });
            }

            let process = OpenProcess(PROCESS_SET_QUOTA | PROCESS_TERMINATE, 0, pid);
            if process == 0 {
                CloseHandle(job);
                return Err(Error::StartFailed {
                    key: pid.to_string(),
                    reason: "OpenProcess failed".to_string(),
                });
            }

            let assigned = AssignProcessToJobObject(job, process);
            CloseHandle(process);
            if assigned == 0 {
                CloseHandle(job);
                return Err(Error::StartFailed {
                    key: pid.to_string(),
                    reason: "AssignProcessToJobObject failed".to_string(),
                });
            }

            Ok(ProcessKiller {
                pid,
                job: Arc::new(JobHandle(job)),
            })
        }
    }

    pub fn kill(killer: &ProcessKiller) {
        // Terminating the job reaches every process assigned to it.
        // SAFETY: the job handle outlives the killer via the Arc.
        unsafe {
            TerminateJobObject(killer.job.0, 1);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh_args(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn spawn_wait_observes_exit_status() {
        let env = HashMap::new();
        let mut child = JobChild::spawn(
            &PathBuf::from("/bin/sh"),
            &sh_args("exit 7"),
            &std::env::temp_dir(),
            &env,
        )
        .unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(status.code(), Some(7));
    }

    #[tokio::test]
    async fn spawned_child_gets_declared_env() {
        let mut env = HashMap::new();
        env.insert("POT_TEST_MARK".to_string(), "42".to_string());
        let mut child = JobChild::spawn(
            &PathBuf::from("/bin/sh"),
            &sh_args("test \"$POT_TEST_MARK\" = 42"),
            &std::env::temp_dir(),
            &env,
        )
        .unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn killer_terminates_running_child() {
        let env = HashMap::new();
        let mut child = JobChild::spawn(
            &PathBuf::from("/bin/sh"),
            &sh_args("sleep 30"),
            &std::env::temp_dir(),
            &env,
        )
        .unwrap();
        let killer = child.killer();
        // Give the shell a moment to exec before killing the group.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        killer.kill();
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
