//! SQLite-backed store.
//!
//! Lives inside the system repo's working area
//! (`repo/potstack/repo.git/data/potstack.db`). Statements are short and
//! synchronous; the connection sits behind a mutex and is never held
//! across an await.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use super::{decode_key, Collaborator, Owner, RepoRecord, RepoStore, UserStore};
use crate::constants::validate_name;
use crate::error::{Error, Result};
use crate::repo;

/// SQLite store rooted at the repository directory.
pub struct SqliteStore {
    repo_root: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database under the system repo.
    pub fn open(repo_root: &Path) -> Result<Self> {
        let db_dir = repo_root.join("potstack").join("repo.git").join("data");
        std::fs::create_dir_all(&db_dir)?;
        let db_path = db_dir.join("potstack.db");
        let conn = Connection::open(&db_path)?;
        Self::migrate(&conn)?;
        info!(db = %db_path.display(), "store initialised");
        Ok(Self {
            repo_root: repo_root.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    /// Opens an in-process database, for tests that want SQL semantics
    /// without touching the repo layout.
    pub fn open_in_memory(repo_root: &Path) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(Self {
            repo_root: repo_root.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                 name       TEXT PRIMARY KEY,
                 email      TEXT NOT NULL,
                 public_key TEXT,
                 created_at TEXT NOT NULL DEFAULT (datetime('now'))
             );
             CREATE TABLE IF NOT EXISTS repositories (
                 owner      TEXT NOT NULL,
                 name       TEXT NOT NULL,
                 uuid       TEXT NOT NULL,
                 created_at TEXT NOT NULL DEFAULT (datetime('now')),
                 PRIMARY KEY (owner, name)
             );
             CREATE TABLE IF NOT EXISTS collaborators (
                 owner      TEXT NOT NULL,
                 repo       TEXT NOT NULL,
                 username   TEXT NOT NULL,
                 permission TEXT NOT NULL DEFAULT 'write',
                 PRIMARY KEY (owner, repo, username)
             );",
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a panic mid-statement; propagating the
        // inner guard is still sound for SQLite.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl UserStore for SqliteStore {
    async fn create_owner(&self, name: &str, email: &str) -> Result<Owner> {
        validate_name(name).map_err(|r| Error::InvalidInput(format!("owner '{name}': {r}")))?;
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO users (name, email) VALUES (?1, ?2)",
            params![name, email],
        )?;
        if inserted == 0 {
            return Err(Error::OwnerAlreadyExists(name.to_string()));
        }
        Ok(Owner {
            name: name.to_string(),
            email: email.to_string(),
            public_key: None,
        })
    }

    async fn get_owner(&self, name: &str) -> Result<Option<Owner>> {
        let conn = self.lock();
        let owner = conn
            .query_row(
                "SELECT name, email, public_key FROM users WHERE name = ?1",
                params![name],
                |row| {
                    Ok(Owner {
                        name: row.get(0)?,
                        email: row.get(1)?,
                        public_key: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(owner)
    }

    async fn delete_owner(&self, name: &str) -> Result<()> {
        let conn = self.lock();
        let deleted = conn.execute("DELETE FROM users WHERE name = ?1", params![name])?;
        if deleted == 0 {
            return Err(Error::OwnerNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn pinned_key(&self, name: &str) -> Result<Option<[u8; 32]>> {
        let conn = self.lock();
        let hex_key: Option<Option<String>> = conn
            .query_row(
                "SELECT public_key FROM users WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hex_key.flatten().as_deref().and_then(decode_key))
    }

    async fn set_pinned_key(&self, name: &str, key: &[u8; 32]) -> Result<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE users SET public_key = ?2 WHERE name = ?1",
            params![name, hex::encode(key)],
        )?;
        if updated == 0 {
            return Err(Error::OwnerNotFound(name.to_string()));
        }
        info!(owner = %name, key = %hex::encode(key), "pinned owner public key");
        Ok(())
    }
}

#[async_trait]
impl RepoStore for SqliteStore {
    async fn create_repo(&self, owner: &str, name: &str) -> Result<RepoRecord> {
        validate_name(name).map_err(|r| Error::InvalidInput(format!("pot '{name}': {r}")))?;

        let bare_path = self.repo_path(owner, name);
        {
            let conn = self.lock();
            let exists: Option<String> = conn
                .query_row(
                    "SELECT uuid FROM repositories WHERE owner = ?1 AND name = ?2",
                    params![owner, name],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(Error::PotAlreadyExists {
                    owner: owner.to_string(),
                    name: name.to_string(),
                });
            }
        }

        let uuid = repo::init_bare(&bare_path)?;

        let conn = self.lock();
        conn.execute(
            "INSERT INTO repositories (owner, name, uuid) VALUES (?1, ?2, ?3)",
            params![owner, name, uuid],
        )?;
        info!(repo = %format!("{owner}/{name}"), "created repository");
        Ok(RepoRecord {
            owner: owner.to_string(),
            name: name.to_string(),
            uuid,
        })
    }

    async fn get_repo(&self, owner: &str, name: &str) -> Result<Option<RepoRecord>> {
        let conn = self.lock();
        let record = conn
            .query_row(
                "SELECT owner, name, uuid FROM repositories WHERE owner = ?1 AND name = ?2",
                params![owner, name],
                |row| {
                    Ok(RepoRecord {
                        owner: row.get(0)?,
                        name: row.get(1)?,
                        uuid: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    async fn delete_repo(&self, owner: &str, name: &str) -> Result<()> {
        {
            let conn = self.lock();
            let deleted = conn.execute(
                "DELETE FROM repositories WHERE owner = ?1 AND name = ?2",
                params![owner, name],
            )?;
            if deleted == 0 {
                return Err(Error::PotNotFound {
                    owner: owner.to_string(),
                    name: name.to_string(),
                });
            }
            conn.execute(
                "DELETE FROM collaborators WHERE owner = ?1 AND repo = ?2",
                params![owner, name],
            )?;
        }
        let bare_path = self.repo_path(owner, name);
        if bare_path.exists() {
            std::fs::remove_dir_all(&bare_path)?;
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
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO collaborators (owner, repo, username, permission)
             VALUES (?1, ?2, ?3, ?4)",
            params![owner, name, user, permission],
        )?;
        if inserted == 0 {
            return Err(Error::CollaboratorExists {
                owner: owner.to_string(),
                name: name.to_string(),
                user: user.to_string(),
            });
        }
        Ok(())
    }

    async fn remove_collaborator(&self, owner: &str, name: &str, user: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM collaborators WHERE owner = ?1 AND repo = ?2 AND username = ?3",
            params![owner, name, user],
        )?;
        Ok(())
    }

    async fn list_collaborators(&self, owner: &str, name: &str) -> Result<Vec<Collaborator>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT username, permission FROM collaborators
             WHERE owner = ?1 AND repo = ?2 ORDER BY username",
        )?;
        let rows = stmt.query_map(params![owner, name], |row| {
            Ok(Collaborator {
                username: row.get(0)?,
                permission: row.get(1)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn is_collaborator(&self, owner: &str, name: &str, user: &str) -> Result<bool> {
        let conn = self.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM collaborators WHERE owner = ?1 AND repo = ?2 AND username = ?3",
                params![owner, name, user],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}
