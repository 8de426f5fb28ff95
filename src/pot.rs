//! Pot manifest and run-state types.
//!
//! A pot is described by two YAML documents: `pot.yml` at the HEAD of its
//! repository (what it is) and `run.yml` in its sandbox working area (what
//! it should be doing). `run.yml` is the only authoritative record of
//! intent; its `runtime` block is best-effort observational.

use serde::{Deserialize, Serialize};

use crate::constants::{validate_name, MAX_MANIFEST_SIZE};
use crate::error::{Error, Result};

// =============================================================================
// Pot Identity
// =============================================================================

/// Unique pot identifier: `(owner, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PotUri {
    pub owner: String,
    pub name: String,
}

impl PotUri {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Map key used across the keeper and router: `owner/name`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl std::fmt::Display for PotUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

// =============================================================================
// Pot Manifest (pot.yml)
// =============================================================================

/// Kind of pot: a reverse-proxied child process or a static file tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PotKind {
    Exe,
    Static,
}

impl std::fmt::Display for PotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exe => write!(f, "exe"),
            Self::Static => write!(f, "static"),
        }
    }
}

/// Environment variable declared by a manifest, injected into exe children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
    /// Operator hint, carried through but unused by the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tips: Option<String>,
}

/// Parsed `pot.yml`.
///
/// Descriptive fields the host does not act on (`title`, `version`, ...)
/// are tolerated and dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PotManifest {
    /// Pot kind (required).
    #[serde(rename = "type")]
    pub kind: PotKind,
    /// Document root inside the tree, for static pots.
    #[serde(default)]
    pub root: String,
    /// Extra environment for exe children.
    #[serde(default)]
    pub env: Vec<EnvVar>,
    /// Remote OCI image to pre-pull at install time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<String>,
}

impl PotManifest {
    /// Parses a manifest from YAML bytes, bounding the input size.
    pub fn from_yaml(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_MANIFEST_SIZE {
            return Err(Error::InvalidInput(format!(
                "manifest size {} exceeds limit of {}",
                bytes.len(),
                MAX_MANIFEST_SIZE
            )));
        }
        Ok(serde_yaml::from_slice(bytes)?)
    }

    /// Value of a declared environment variable, if present.
    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }
}

// =============================================================================
// Run State (run.yml)
// =============================================================================

/// Desired state of an exe sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Stopped,
}

/// Observed runtime facts, written alongside the target status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub start_time: String,
}

/// Parsed `run.yml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub target_status: RunStatus,
    #[serde(default)]
    pub runtime: RuntimeInfo,
}

impl RunState {
    pub fn running(pid: u32, port: u16, start_time: String) -> Self {
        Self {
            target_status: RunStatus::Running,
            runtime: RuntimeInfo {
                pid,
                port,
                start_time,
            },
        }
    }

    pub fn stopped() -> Self {
        Self {
            target_status: RunStatus::Stopped,
            runtime: RuntimeInfo::default(),
        }
    }
}

// =============================================================================
// Install Manifest (install.yml)
// =============================================================================

/// Parsed `install.yml` from the outer bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallManifest {
    #[serde(default)]
    pub version: String,
    /// Filenames of `.ppk` members inside the bundle.
    #[serde(default)]
    pub packages: Vec<String>,
}

/// Validates an owner or pot name for use as a repository path component.
pub fn validate_pot_name(name: &str) -> Result<()> {
    validate_name(name).map_err(|reason| Error::InvalidInput(format!("'{name}': {reason}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exe_manifest_with_extras() {
        let yaml = b"title: demo\ntype: exe\nenv:\n  - name: MODE\n    value: prod\ndocker: ghcr.io/acme/hello:1.0\n";
        let m = PotManifest::from_yaml(yaml).unwrap();
        assert_eq!(m.kind, PotKind::Exe);
        assert_eq!(m.env_value("MODE"), Some("prod"));
        assert_eq!(m.docker.as_deref(), Some("ghcr.io/acme/hello:1.0"));
    }

    #[test]
    fn parses_static_manifest_with_root() {
        let m = PotManifest::from_yaml(b"type: static\nroot: public\n").unwrap();
        assert_eq!(m.kind, PotKind::Static);
        assert_eq!(m.root, "public");
    }

    #[test]
    fn rejects_unknown_kind() {
        assert!(PotManifest::from_yaml(b"type: cgi\n").is_err());
    }

    #[test]
    fn run_state_round_trips_through_yaml() {
        let rs = RunState::running(4242, 50123, "2026-08-02T10:00:00Z".to_string());
        let yaml = serde_yaml::to_string(&rs).unwrap();
        let back: RunState = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.target_status, RunStatus::Running);
        assert_eq!(back.runtime.port, 50123);
        assert_eq!(back.runtime.pid, 4242);
    }

    #[test]
    fn stopped_state_clears_runtime() {
        let rs = RunState::stopped();
        assert_eq!(rs.target_status, RunStatus::Stopped);
        assert_eq!(rs.runtime, RuntimeInfo::default());
    }
}
