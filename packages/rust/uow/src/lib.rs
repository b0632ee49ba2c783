//! Filesystem unit of work: stage writes, then atomically merge them into a
//! tenant's document tree — or drop the staging area and keep the tree
//! untouched.
//!
//! Each [`UnitOfWork`] gets its own `.staging_<uuid8>` directory under the
//! tenant's base directory so concurrent syncs never step on each other's
//! staged files. Reads fall through staging first, then the committed tree,
//! so a UoW can see its own uncommitted writes. If a `UnitOfWork` is dropped
//! without [`UnitOfWork::commit`], its staging directory is removed —
//! nothing it wrote becomes visible.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use docsync_shared::{Error, Result};

const STAGING_DIR_PREFIX: &str = ".staging_";

pub struct UnitOfWork {
    base_dir: PathBuf,
    staging_dir: PathBuf,
    committed: bool,
}

impl UnitOfWork {
    /// Open a unit of work rooted at `base_dir`, creating both the base
    /// directory and a fresh staging subdirectory.
    #[tracing::instrument(skip_all, fields(base_dir = %base_dir.display()))]
    pub fn open(base_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(base_dir).map_err(|e| Error::io(base_dir, e))?;
        let staging_id = &uuid::Uuid::new_v4().simple().to_string()[..8];
        let staging_dir = base_dir.join(format!("{STAGING_DIR_PREFIX}{staging_id}"));
        std::fs::create_dir_all(&staging_dir).map_err(|e| Error::io(&staging_dir, e))?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            staging_dir,
            committed: false,
        })
    }

    /// Write a document's markdown body to the staging area at `rel_path`.
    pub fn write_document(&self, rel_path: &Path, content: &str) -> Result<()> {
        self.write_staged(rel_path, content.as_bytes())
    }

    /// Write a `.meta.json` sidecar, serialized, to the staging area.
    pub fn write_metadata(&self, markdown_rel_path: &Path, metadata: &serde_json::Value) -> Result<()> {
        let meta_rel_path = docsync_pathbuilder::metadata_path(markdown_rel_path);
        let serialized = serde_json::to_vec_pretty(metadata)
            .map_err(|e| Error::Validation { message: format!("failed to serialize metadata: {e}") })?;
        self.write_staged(&meta_rel_path, &serialized)
    }

    fn write_staged(&self, rel_path: &Path, content: &[u8]) -> Result<()> {
        let dest = self.staging_dir.join(rel_path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        std::fs::write(&dest, content).map_err(|e| Error::io(&dest, e))
    }

    /// Read `rel_path`, preferring the not-yet-committed staged copy over
    /// whatever is already committed in the base directory.
    pub fn read(&self, rel_path: &Path) -> Result<Option<String>> {
        let staged = self.staging_dir.join(rel_path);
        if staged.exists() {
            return std::fs::read_to_string(&staged).map(Some).map_err(|e| Error::io(&staged, e));
        }
        let committed = self.base_dir.join(rel_path);
        if committed.exists() {
            return std::fs::read_to_string(&committed).map(Some).map_err(|e| Error::io(&committed, e));
        }
        Ok(None)
    }

    /// Merge every staged file into the base directory, overwriting any
    /// existing file at the same relative path, then remove the now-empty
    /// staging directory.
    #[tracing::instrument(skip(self), fields(staging_dir = %self.staging_dir.display()))]
    pub fn commit(mut self) -> Result<()> {
        self.merge_staging_into_base()?;
        if self.staging_dir.exists() {
            std::fs::remove_dir_all(&self.staging_dir).map_err(|e| Error::io(&self.staging_dir, e))?;
        }
        self.committed = true;
        Ok(())
    }

    /// Discard every staged write. Equivalent to dropping the `UnitOfWork`
    /// without committing, spelled out for callers that want it explicit.
    pub fn rollback(mut self) -> Result<()> {
        self.discard_staging()?;
        self.committed = true; // prevent Drop from trying again
        Ok(())
    }

    fn discard_staging(&mut self) -> Result<()> {
        if self.staging_dir.exists() {
            std::fs::remove_dir_all(&self.staging_dir).map_err(|e| Error::io(&self.staging_dir, e))?;
        }
        Ok(())
    }

    fn merge_staging_into_base(&self) -> Result<()> {
        if !self.staging_dir.exists() {
            return Ok(());
        }
        let mut dirs_to_prune = Vec::new();
        for entry in walk_files(&self.staging_dir, &mut dirs_to_prune)? {
            let relative = entry.strip_prefix(&self.staging_dir).expect("entry under staging_dir");
            let destination = self.base_dir.join(relative);
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
            if destination.is_dir() {
                std::fs::remove_dir_all(&destination).map_err(|e| Error::io(&destination, e))?;
            }
            std::fs::rename(&entry, &destination).map_err(|e| Error::io(&destination, e))?;
        }
        // Remove now-empty directories, deepest first.
        dirs_to_prune.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
        for dir in dirs_to_prune {
            let _ = std::fs::remove_dir(&dir);
        }
        Ok(())
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.discard_staging();
        }
    }
}

fn walk_files(root: &Path, dirs: &mut Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).map_err(|e| Error::io(&dir, e))? {
            let entry = entry.map_err(|e| Error::io(&dir, e))?;
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path.clone());
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    Ok(files)
}

/// Remove staging directories older than `max_age` left behind by a process
/// that crashed mid-sync. Call once at startup before opening new work.
pub fn sweep_orphaned_staging(base_dir: &Path, max_age: Duration) -> Result<usize> {
    if !base_dir.exists() {
        return Ok(0);
    }
    let mut cleaned = 0;
    let now = SystemTime::now();
    for entry in std::fs::read_dir(base_dir).map_err(|e| Error::io(base_dir, e))? {
        let entry = entry.map_err(|e| Error::io(base_dir, e))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name != ".staging" && !name.starts_with(STAGING_DIR_PREFIX) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else { continue };
        let Ok(modified) = metadata.modified() else { continue };
        let Ok(age) = now.duration_since(modified) else { continue };
        if age > max_age {
            if std::fs::remove_dir_all(&path).is_ok() {
                tracing::info!(?path, "removed orphaned staging directory");
                cleaned += 1;
            } else {
                tracing::warn!(?path, "failed to remove orphaned staging directory");
            }
        }
    }
    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_commit_persists_to_base() {
        let dir = tempfile::tempdir().unwrap();
        let uow = UnitOfWork::open(dir.path()).unwrap();
        uow.write_document(Path::new("docs.example.com/guide.md"), "# Guide").unwrap();
        uow.commit().unwrap();

        let content = std::fs::read_to_string(dir.path().join("docs.example.com/guide.md")).unwrap();
        assert_eq!(content, "# Guide");
    }

    #[test]
    fn rollback_leaves_base_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let uow = UnitOfWork::open(dir.path()).unwrap();
        uow.write_document(Path::new("a.md"), "staged").unwrap();
        uow.rollback().unwrap();

        assert!(!dir.path().join("a.md").exists());
    }

    #[test]
    fn drop_without_commit_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        {
            let uow = UnitOfWork::open(dir.path()).unwrap();
            uow.write_document(Path::new("a.md"), "staged").unwrap();
        }
        assert!(!dir.path().join("a.md").exists());
        let leftover: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftover.is_empty());
    }

    #[test]
    fn read_sees_staged_before_committed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "old").unwrap();
        let uow = UnitOfWork::open(dir.path()).unwrap();
        assert_eq!(uow.read(Path::new("a.md")).unwrap().as_deref(), Some("old"));

        uow.write_document(Path::new("a.md"), "new").unwrap();
        assert_eq!(uow.read(Path::new("a.md")).unwrap().as_deref(), Some("new"));
        uow.commit().unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.md")).unwrap(), "new");
    }

    #[test]
    fn commit_overwrites_existing_file_at_destination() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "old").unwrap();
        let uow = UnitOfWork::open(dir.path()).unwrap();
        uow.write_document(Path::new("a.md"), "new").unwrap();
        uow.commit().unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.md")).unwrap(), "new");
    }

    #[test]
    fn write_metadata_lands_under_metadata_dir() {
        let dir = tempfile::tempdir().unwrap();
        let uow = UnitOfWork::open(dir.path()).unwrap();
        let md_rel = Path::new("docs.example.com/guide.md");
        uow.write_metadata(md_rel, &serde_json::json!({"ok": true})).unwrap();
        uow.commit().unwrap();

        let meta_path = dir.path().join(docsync_pathbuilder::metadata_path(md_rel));
        assert!(meta_path.exists());
    }

    #[test]
    fn sweep_removes_only_stale_staging_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let fresh = UnitOfWork::open(dir.path()).unwrap();
        // fresh.staging_dir is new — sweeping with a long max_age should not touch it.
        let cleaned = sweep_orphaned_staging(dir.path(), Duration::from_secs(3600)).unwrap();
        assert_eq!(cleaned, 0);
        drop(fresh);
    }
}
