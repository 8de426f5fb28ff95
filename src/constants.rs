//! Constants for the PotStack host.
//!
//! All ports, limits, timeouts, and well-known path fragments are defined
//! here to keep magic numbers out of the rest of the codebase.

use std::time::Duration;

// =============================================================================
// Listener Ports
// =============================================================================

/// Default business listener port (overridable via `POTSTACK_HTTP_PORT`).
pub const DEFAULT_HTTP_PORT: u16 = 61080;

/// Default admin listener port (overridable via `POTSTACK_ADMIN_PORT`).
pub const DEFAULT_ADMIN_PORT: u16 = 61081;

/// Internal listener port. Fixed: children and the keeper address it by
/// this constant, so it is not configurable.
pub const INTERNAL_PORT: u16 = 61082;

// =============================================================================
// System Identity
// =============================================================================

/// Owner namespace reserved for the host's own pots.
pub const SYSTEM_OWNER: &str = "potstack";

/// System pots created at bootstrap.
pub const SYSTEM_POTS: &[&str] = &["keeper", "loader", "repo"];

/// Owner namespace backing `/cdn` requests.
pub const CDN_OWNER: &str = "biz.cdn";

/// Base bundle filename looked for under the data directory.
pub const BASE_BUNDLE_NAME: &str = "potstack-base.zip";

// =============================================================================
// Package Format
// =============================================================================

/// Magic bytes at the start of a signed package.
pub const PPK_MAGIC: &[u8; 4] = b"PPK\0";

/// Supported package format version.
pub const PPK_VERSION: u8 = 0x01;

/// Signature algorithm identifier for Ed25519.
pub const PPK_ALGO_ED25519: u8 = 0x01;

/// Fixed package header size in bytes.
pub const PPK_HEADER_SIZE: usize = 128;

/// Maximum inner content size accepted from a package header (1 GiB).
/// Bounds the allocation made before signature verification.
pub const MAX_PACKAGE_CONTENT: u64 = 1024 * 1024 * 1024;

/// Maximum size of a pot or install manifest (1 MiB).
pub const MAX_MANIFEST_SIZE: usize = 1024 * 1024;

// =============================================================================
// Repository Layout
// =============================================================================

/// Working area inside a bare repo holding program/data/log/run.yml.
pub const SANDBOX_DIR: &str = "data/faaspot";

/// Branch both server and clients agree on.
pub const DEFAULT_BRANCH: &str = "main";

/// Reference name for the default branch.
pub const DEFAULT_BRANCH_REF: &str = "refs/heads/main";

/// Manifest filename at the root of a pot's tree.
pub const POT_MANIFEST: &str = "pot.yml";

/// Run-state filename inside the sandbox working area.
pub const RUN_STATE: &str = "run.yml";

/// Executable a sandbox must ship at the root of its tree.
pub const POT_EXECUTABLE: &str = "pot.exe";

// =============================================================================
// Timeouts & Intervals
// =============================================================================

/// Keeper reconcile interval.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Backoff before restarting a crashed child.
pub const RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// Interval between polls of `https.yaml` and `cert.pem` for hot reload.
pub const WATCH_INTERVAL: Duration = Duration::from_secs(30);

/// Interval between certificate renewal checks.
pub const RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Delay before the first renewal check after startup.
pub const RENEWAL_CHECK_DELAY: Duration = Duration::from_secs(60);

/// Maximum attempts while the Loader waits for the internal listener,
/// one second apart. ACME issuance can hold startup for minutes.
pub const WAIT_FOR_SERVICE_RETRIES: u32 = 600;

/// Timeout for the route-refresh control call.
pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for docker CLI invocations.
pub const DOCKER_TIMEOUT: Duration = Duration::from_secs(300);

/// Bounded drain applied to each listener at shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// =============================================================================
// Validation
// =============================================================================

/// Maximum length of owner and pot names.
pub const MAX_NAME_LEN: usize = 64;

/// Validates an owner or pot name as a filesystem-safe identifier.
///
/// Names become path components under the repo root, so the character set
/// is restricted accordingly. Dots are allowed (e.g. `biz.cdn`) but names
/// must not start with one.
pub fn validate_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("name cannot be empty");
    }
    if name.len() > MAX_NAME_LEN {
        return Err("name too long");
    }
    if name.starts_with('.') {
        return Err("name cannot start with '.'");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err("name must contain only alphanumerics, '-', '_' or '.'");
    }
    Ok(())
}
