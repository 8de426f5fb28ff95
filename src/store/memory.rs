//! In-memory store for tests.
//!
//! Same contract as the SQLite store, backed by maps. Bare repositories
//! are still created on disk so the loader, keeper, and router can be
//! exercised against real repos.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;

use super::{Collaborator, Owner, RepoRecord, RepoStore, UserStore};
use crate::error::{Error, Result};
use crate::repo;

#[derive(Default)]
struct Tables {
    owners: HashMap<String, Owner>,
    repos: HashMap<(String, String), RepoRecord>,
    collaborators: HashMap<(String, String), Vec<Collaborator>>,
}

/// Map-backed store for tests.
pub struct MemoryStore {
    repo_root: PathBuf,
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            tables: RwLock::new(Tables::default()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn create_owner(&self, name: &str, email: &str) -> Result<Owner> {
        let mut tables = self.write();
        if tables.owners.contains_key(name) {
            return Err(Error::OwnerAlreadyExists(name.to_string()));
        }
        let owner = Owner {
            name: name.to_string(),
            email: email.to_string(),
            public_key: None,
        };
        tables.owners.insert(name.to_string(), owner.clone());
        Ok(owner)
    }

    async fn get_owner(&self, name: &str) -> Result<Option<Owner>> {
        Ok(self.read().owners.get(name).cloned())
    }

    async fn delete_owner(&self, name: &str) -> Result<()> {
        if self.write().owners.remove(name).is_none() {
            return Err(Error::OwnerNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn pinned_key(&self, name: &str) -> Result<Option<[u8; 32]>> {
        Ok(self
            .read()
            .owners
            .get(name)
            .and_then(|o| o.public_key.as_deref())
            .and_then(super::decode_key))
    }

    async fn set_pinned_key(&self, name: &str, key: &[u8; 32]) -> Result<()> {
        let mut tables = self.write();
        let owner = tables
            .owners
            .get_mut(name)
            .ok_or_else(|| Error::OwnerNotFound(name.to_string()))?;
        owner.public_key = Some(hex::encode(key));
        Ok(())
    }
}

#[async_trait]
impl RepoStore for MemoryStore {
    async fn create_repo(&self, owner: &str, name: &str) -> Result<RepoRecord> {
        let key = (owner.to_string(), name.to_string());
        if self.read().repos.contains_key(&key) {
            return Err(Error::PotAlreadyExists {
                owner: owner.to_string(),
                name: name.to_string(),
            });
        }
        let uuid = repo::init_bare(&self.repo_path(owner, name))?;
        let record = RepoRecord {
            owner: owner.to_string(),
            name: name.to_string(),
            uuid,
        };
        self.write().repos.insert(key, record.clone());
        Ok(record)
    }

    async fn get_repo(&self, owner: &str, name: &str) -> Result<Option<RepoRecord>> {
        Ok(self
            .read()
            .repos
            .get(&(owner.to_string(), name.to_string()))
            .cloned())
    }

    async fn delete_repo(&self, owner: &str, name: &str) -> Result<()> {
        let key = (owner.to_string(), name.to_string());
        if self.write().repos.remove(&key).is_none() {
            return Err(Error::PotNotFound {
                owner: owner.to_string(),
                name: name.to_string(),
            });
        }
        let bare = self.repo_path(owner, name);
        if bare.exists() {
            std::fs::remove_dir_all(&bare)?;
        }
        Ok(())
    }

    fn repo_path(&self, owner: &str, name: &str) -> PathBuf {
        repo::bare_repo_path(&self.repo_root, owner, name)
    }

    async fn add_collaborator(
        &self,
        owner: &str,
        name: &str,
        user: &str,
        permission: &str,
    ) -> Result<()> {
        let key = (owner.to_string(), name.to_string());
        let mut tables = self.write();
        let list = tables.collaborators.entry(key).or_default();
        if list.iter().any(|c| c.username == user) {
            return Err(Error::CollaboratorExists {
                owner: owner.to_string(),
                name: name.to_string(),
                user: user.to_string(),
            });
        }
        list.push(Collaborator {
            username: user.to_string(),
            permission: permission.to_string(),
        });
        Ok(())
    }

    async fn remove_collaborator(&self, owner: &str, name: &str, user: &str) -> Result<()> {
        let key = (owner.to_string(), name.to_string());
        if let Some(list) = self.write().collaborators.get_mut(&key) {
            list.retain(|c| c.username != user);
        }
        Ok(())
    }

    async fn list_collaborators(&self, owner: &str, name: &str) -> Result<Vec<Collaborator>> {
        Ok(self
            .read()
            .collaborators
            .get(&(owner.to_string(), name.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn is_collaborator(&self, owner: &str, name: &str, user: &str) -> Result<bool> {
        Ok(self
            .read()
            .collaborators
            .get(&(owner.to_string(), name.to_string()))
            .map(|list| list.iter().any(|c| c.username == user))
            .unwrap_or(false))
    }
}
