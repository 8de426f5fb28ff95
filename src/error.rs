//! Error types for the PotStack host.

use std::path::PathBuf;

/// Result type alias for PotStack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the PotStack host.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Package Errors
    // =========================================================================
    /// Package header is malformed (bad magic, version, or algorithm).
    #[error("invalid package format: {0}")]
    InvalidFormat(String),

    /// Signature over the package content does not verify.
    #[error("signature verification failed for {path}")]
    BadSignature { path: PathBuf },

    /// The key embedded in a package does not match the owner's pinned key.
    #[error("public key mismatch for owner '{owner}': pinned {pinned}, got {offered}")]
    KeyMismatch {
        owner: String,
        pinned: String,
        offered: String,
    },

    /// Archive entry escapes the extraction root.
    #[error("unsafe path in archive: {path}")]
    UnsafePath { path: String },

    // =========================================================================
    // Store Errors
    // =========================================================================
    /// Owner not found.
    #[error("owner not found: {0}")]
    OwnerNotFound(String),

    /// Owner already exists.
    #[error("owner already exists: {0}")]
    OwnerAlreadyExists(String),

    /// Pot not found.
    #[error("pot not found: {owner}/{name}")]
    PotNotFound { owner: String, name: String },

    /// Pot already exists.
    #[error("pot already exists: {owner}/{name}")]
    PotAlreadyExists { owner: String, name: String },

    /// Collaborator already present on the pot.
    #[error("collaborator '{user}' already exists on {owner}/{name}")]
    CollaboratorExists {
        owner: String,
        name: String,
        user: String,
    },

    // =========================================================================
    // Sandbox Errors
    // =========================================================================
    /// Sandbox start failed.
    #[error("failed to start sandbox '{key}': {reason}")]
    StartFailed { key: String, reason: String },

    /// Sandbox manifest declares a type the operation does not support.
    #[error("sandbox '{key}' has type '{kind}', expected '{expected}'")]
    WrongPotType {
        key: String,
        kind: String,
        expected: String,
    },

    /// The sandbox executable is missing from the materialised working tree.
    #[error("sandbox executable not found at {path}")]
    ExecutableNotFound { path: PathBuf },

    /// No free loopback port could be allocated.
    #[error("failed to allocate a free port: {0}")]
    PortUnavailable(String),

    // =========================================================================
    // Routing Errors
    // =========================================================================
    /// The pot has no `pot.yml` at HEAD.
    #[error("pot.yml not found for {owner}/{name}")]
    ManifestNotFound { owner: String, name: String },

    /// `run.yml` records no listening port for an exe pot.
    #[error("no port assigned for {owner}/{name}")]
    NoPortAssigned { owner: String, name: String },

    // =========================================================================
    // Certificate Errors
    // =========================================================================
    /// ACME issuance failed after all retries.
    #[error("ACME issuance failed for '{domain}': {reason}")]
    AcmeFailed { domain: String, reason: String },

    /// Certificate on disk is missing or unusable.
    #[error("certificate unusable: {0}")]
    CertificateInvalid(String),

    /// DNS provider is unknown or misconfigured.
    #[error("DNS provider '{provider}' unavailable: {reason}")]
    DnsProviderUnavailable { provider: String, reason: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Required configuration is missing or contradictory.
    #[error("configuration error: {0}")]
    Config(String),

    /// Input failed validation (names, manifests, sizes).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    // =========================================================================
    // External Process Errors
    // =========================================================================
    /// A child-process invocation (docker, git http-backend) failed.
    #[error("{tool} invocation failed: {reason}")]
    ToolFailed { tool: String, reason: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Git object or repository error.
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// Store database error.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// YAML serialization error.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Archive error.
    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Outbound HTTP error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for conflict errors the Loader treats as success.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::OwnerAlreadyExists(_) | Error::PotAlreadyExists { .. }
        )
    }
}
