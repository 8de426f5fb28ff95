//! Bare-repository materialiser.
//!
//! Pots are stored as bare Git repositories. This module creates them,
//! turns extracted package trees into commits pushed onto `main`, and
//! reads files back out of HEAD for the router and keeper.

use std::path::{Path, PathBuf};

use git2::{IndexAddOption, Repository, Signature};
use tracing::{debug, info};

use crate::constants::{DEFAULT_BRANCH_REF, POT_MANIFEST};
use crate::error::{Error, Result};
use crate::pot::PotManifest;

/// Author identity for host-generated commits.
const INIT_AUTHOR: (&str, &str) = ("Potstack Initializer", "init@potstack.local");
const LOADER_AUTHOR: (&str, &str) = ("potstack-loader", "loader@potstack.local");

/// Initialises a bare repository with a single empty initial commit.
///
/// The initial commit is mandatory: it keeps clients from erroring on
/// clone of an empty repo. `refs/heads/main` points at it and HEAD is
/// symbolic to `main` so server and client agree on the default branch.
/// Returns the generated 32-char hex uuid written alongside the repo.
pub fn init_bare(repo_path: &Path) -> Result<String> {
    let repo = Repository::init_bare(repo_path)?;

    let tree_id = repo.treebuilder(None)?.write()?;
    let tree = repo.find_tree(tree_id)?;
    let sig = Signature::now(INIT_AUTHOR.0, INIT_AUTHOR.1)?;
    repo.commit(Some(DEFAULT_BRANCH_REF), &sig, &sig, "Initial commit", &tree, &[])?;
    repo.set_head(DEFAULT_BRANCH_REF)?;

    let uuid = uuid::Uuid::new_v4().simple().to_string();
    std::fs::write(repo_path.join("uuid"), &uuid)?;
    std::fs::write(repo_path.join("description"), "Unnamed repository")?;

    debug!(repo = %repo_path.display(), uuid = %uuid, "initialised bare repository");
    Ok(uuid)
}

/// Turns the filesystem tree at `dir` into a commit on `main` and pushes
/// it into the bare repository at `bare_path` with force.
///
/// The working repository is initialised on first use; "already up to
/// date" is success, not an error.
pub fn push_tree(bare_path: &Path, dir: &Path) -> Result<()> {
    if !bare_path.exists() {
        return Err(Error::Internal(format!(
            "bare repo does not exist: {}",
            bare_path.display()
        )));
    }

    let repo = match Repository::open(dir) {
        Ok(r) => r,
        Err(_) => {
            debug!(dir = %dir.display(), "not a git repo, initialising");
            let r = Repository::init(dir)?;
            // git2 may default to master; force agreement with the server.
            r.set_head(DEFAULT_BRANCH_REF)?;
            r
        }
    };

    let mut index = repo.index()?;
    index.add_all(["*"], IndexAddOption::DEFAULT, None)?;
    index.write()?;
    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;

    let sig = Signature::now(LOADER_AUTHOR.0, LOADER_AUTHOR.1)?;
    let parent = repo
        .head()
        .ok()
        .and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    let commit_id = repo.commit(
        Some(DEFAULT_BRANCH_REF),
        &sig,
        &sig,
        "Initial commit by Loader",
        &tree,
        &parents,
    )?;
    debug!(commit = %commit_id, dir = %dir.display(), "committed tree");

    let bare_url = bare_path
        .to_str()
        .ok_or_else(|| Error::Internal("non-utf8 bare repo path".to_string()))?;
    let mut remote = repo.remote_anonymous(bare_url)?;
    let refspec = format!("+{DEFAULT_BRANCH_REF}:{DEFAULT_BRANCH_REF}");
    remote.push(&[refspec.as_str()], None)?;

    info!(bare = %bare_path.display(), "pushed tree to bare repository");
    Ok(())
}

/// Clones the bare repository into `dest` with a fresh working tree.
pub fn clone_to(bare_path: &Path, dest: &Path) -> Result<()> {
    let bare_url = bare_path
        .to_str()
        .ok_or_else(|| Error::Internal("non-utf8 bare repo path".to_string()))?;
    Repository::clone(bare_url, dest)?;
    Ok(())
}

/// Reads a file out of the tree at HEAD of a bare repository.
pub fn read_file_from_head(bare_path: &Path, file_path: &str) -> Result<Vec<u8>> {
    let repo = Repository::open_bare(bare_path)?;
    let head = repo.head()?;
    let commit = head.peel_to_commit()?;
    let tree = commit.tree()?;
    let entry = tree.get_path(Path::new(file_path))?;
    let blob = repo.find_blob(entry.id())?;
    Ok(blob.content().to_vec())
}

/// Reads and parses `pot.yml` from the HEAD of `(owner, name)`'s repo.
pub fn read_pot_manifest(repo_root: &Path, owner: &str, name: &str) -> Result<PotManifest> {
    let bare = bare_repo_path(repo_root, owner, name);
    let bytes = read_file_from_head(&bare, POT_MANIFEST).map_err(|_| Error::ManifestNotFound {
        owner: owner.to_string(),
        name: name.to_string(),
    })?;
    PotManifest::from_yaml(&bytes)
}

/// Path of the bare repo for `(owner, name)` under `repo_root`.
pub fn bare_repo_path(repo_root: &Path, owner: &str, name: &str) -> PathBuf {
    repo_root.join(owner).join(format!("{name}.git"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_bare_creates_main_with_one_commit() {
        let dir = tempfile::tempdir().unwrap();
        let bare = dir.path().join("acme").join("hello.git");
        let uuid = init_bare(&bare).unwrap();
        assert_eq!(uuid.len(), 32);
        assert!(bare.join("uuid").exists());
        assert!(bare.join("description").exists());

        let repo = Repository::open_bare(&bare).unwrap();
        let head = repo.head().unwrap();
        assert_eq!(head.name(), Some(DEFAULT_BRANCH_REF));
        let commit = head.peel_to_commit().unwrap();
        assert_eq!(commit.message(), Some("Initial commit"));
        assert_eq!(commit.parent_count(), 0);
    }

    #[test]
    fn push_tree_lands_files_at_head() {
        let dir = tempfile::tempdir().unwrap();
        let bare = dir.path().join("acme").join("hello.git");
        init_bare(&bare).unwrap();

        let work = dir.path().join("work");
        std::fs::create_dir_all(work.join("public")).unwrap();
        std::fs::write(work.join(POT_MANIFEST), "type: static\nroot: public\n").unwrap();
        std::fs::write(work.join("public/index.html"), "<h1>hi</h1>").unwrap();

        push_tree(&bare, &work).unwrap();

        let manifest = read_file_from_head(&bare, POT_MANIFEST).unwrap();
        assert_eq!(manifest, b"type: static\nroot: public\n");
        let page = read_file_from_head(&bare, "public/index.html").unwrap();
        assert_eq!(page, b"<h1>hi</h1>");
    }

    #[test]
    fn push_tree_twice_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let bare = dir.path().join("o").join("n.git");
        init_bare(&bare).unwrap();

        let work = dir.path().join("work");
        std::fs::create_dir_all(&work).unwrap();
        std::fs::write(work.join("a.txt"), "1").unwrap();

        push_tree(&bare, &work).unwrap();
        push_tree(&bare, &work).unwrap();
        assert_eq!(read_file_from_head(&bare, "a.txt").unwrap(), b"1");
    }

    #[test]
    fn clone_yields_working_tree_on_main() {
        let dir = tempfile::tempdir().unwrap();
        let bare = dir.path().join("o").join("n.git");
        init_bare(&bare).unwrap();

        let work = dir.path().join("work");
        std::fs::create_dir_all(&work).unwrap();
        std::fs::write(work.join("pot.exe"), "#!fake").unwrap();
        push_tree(&bare, &work).unwrap();

        let dest = dir.path().join("program");
        clone_to(&bare, &dest).unwrap();
        assert!(dest.join("pot.exe").exists());

        let cloned = Repository::open(&dest).unwrap();
        let head = cloned.head().unwrap();
        assert_eq!(head.shorthand(), Some("main"));
    }

    #[test]
    fn read_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let bare = dir.path().join("o").join("n.git");
        init_bare(&bare).unwrap();
        assert!(read_file_from_head(&bare, "nope.txt").is_err());
    }
}
