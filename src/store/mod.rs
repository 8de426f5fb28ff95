//! User and pot metadata store.
//!
//! The core consumes two narrow capabilities: [`UserStore`] for owners and
//! their pinned keys, [`RepoStore`] for pot repositories and collaborators.
//! Production uses the SQLite implementation in [`sqlite`]; tests use the
//! in-memory one in [`memory`].

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// An owner namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Owner {
    pub name: String,
    pub email: String,
    /// Pinned Ed25519 public key, hex-encoded. Absent means not yet trusted.
    pub public_key: Option<String>,
}

/// A pot repository record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoRecord {
    pub owner: String,
    pub name: String,
    /// Random identifier written into the bare repo's `uuid` sidecar.
    pub uuid: String,
}

/// A collaborator entry on a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collaborator {
    pub username: String,
    pub permission: String,
}

/// Owner-level operations, including the trust store for package pinning.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Creates an owner. Errors with `OwnerAlreadyExists` on collision.
    async fn create_owner(&self, name: &str, email: &str) -> Result<Owner>;

    /// Looks up an owner.
    async fn get_owner(&self, name: &str) -> Result<Option<Owner>>;

    /// Deletes an owner. Explicit admin action only.
    async fn delete_owner(&self, name: &str) -> Result<()>;

    /// The owner's pinned public key, if one has been recorded.
    async fn pinned_key(&self, name: &str) -> Result<Option<[u8; 32]>>;

    /// Records the owner's pinned key. First write is the TOFU event;
    /// later writes are explicit admin action.
    async fn set_pinned_key(&self, name: &str, key: &[u8; 32]) -> Result<()>;
}

/// Pot repository operations.
#[async_trait]
pub trait RepoStore: Send + Sync {
    /// Creates the record and materialises the bare repository on disk.
    /// Errors with `PotAlreadyExists` on collision.
    async fn create_repo(&self, owner: &str, name: &str) -> Result<RepoRecord>;

    /// Looks up a repository record.
    async fn get_repo(&self, owner: &str, name: &str) -> Result<Option<RepoRecord>>;

    /// Deletes the record and the bare repository.
    async fn delete_repo(&self, owner: &str, name: &str) -> Result<()>;

    /// Filesystem path of the bare repository for `(owner, name)`.
    fn repo_path(&self, owner: &str, name: &str) -> PathBuf;

    /// Adds a collaborator with the given permission.
    async fn add_collaborator(
        &self,
        owner: &str,
        name: &str,
        user: &str,
        permission: &str,
    ) -> Result<()>;

    /// Removes a collaborator.
    async fn remove_collaborator(&self, owner: &str, name: &str, user: &str) -> Result<()>;

    /// Lists collaborators.
    async fn list_collaborators(&self, owner: &str, name: &str) -> Result<Vec<Collaborator>>;

    /// True if `user` collaborates on the repository.
    async fn is_collaborator(&self, owner: &str, name: &str, user: &str) -> Result<bool>;
}

/// Decodes a stored hex key into the fixed-size byte form.
pub(crate) fn decode_key(hex_key: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hex_key).ok()?;
    bytes.try_into().ok()
}
