//! Backup manager (§4.10).
//!
//! Per-application, per-profile snapshots of a named file or directory.
//! Exactly one backup slot is "active" -- its content is what currently
//! lives at the live `path` -- the rest sit on disk as `<path>.bak<N>`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::path_utils;

/// One tracked path with its backup slots.
///
/// §6 only names `path` in the persisted schema; `name`, `backup_count`,
/// and `active` are carried alongside it here because the active slot
/// can't be recovered by scanning `.bak*` siblings alone once swaps have
/// happened (open question, resolved in DESIGN.md).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupTarget {
    pub path: PathBuf,
    pub name: String,
    backup_count: usize,
    active: usize,
}

impl BackupTarget {
    fn slot_path(&self, slot: usize) -> PathBuf {
        let mut p = self.path.clone().into_os_string();
        p.push(format!(".bak{slot}"));
        PathBuf::from(p)
    }

    pub fn active_slot(&self) -> usize {
        self.active
    }

    pub fn backup_count(&self) -> usize {
        self.backup_count
    }
}

/// Per-profile collection of [`BackupTarget`]s.
#[derive(Debug, Default)]
pub struct BackupManager {
    targets: std::collections::HashMap<String, Vec<BackupTarget>>,
}

impl BackupManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn targets(&self, profile: &str) -> &[BackupTarget] {
        self.targets.get(profile).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Copy `live path` into backup slot 0, and create a default second
    /// slot as a copy of the same content.
    pub fn add_target(&mut self, profile: &str, path: &Path, name: &str) -> Result<()> {
        if !path.exists() {
            return Err(CoreError::path_io("stat", path, "backup target does not exist"));
        }

        let mut target = BackupTarget {
            path: path.to_path_buf(),
            name: name.to_string(),
            backup_count: 0,
            active: 0,
        };

        copy_path(path, &target.slot_path(0))?;
        copy_path(path, &target.slot_path(1))?;
        target.backup_count = 2;

        self.targets.entry(profile.to_string()).or_default().push(target);
        Ok(())
    }

    /// Clone the currently active slot into a fresh slot.
    pub fn add_backup(&mut self, profile: &str, target_index: usize) -> Result<usize> {
        let target = self.target_mut(profile, target_index)?;
        let new_slot = target.backup_count;
        let active_slot_path = target.slot_path(target.active);
        let new_slot_path = target.slot_path(new_slot);
        copy_path(&active_slot_path, &new_slot_path)?;
        target.backup_count += 1;
        Ok(new_slot)
    }

    /// Swap the live file with backup slot `b`: the current live content
    /// is archived into the (former) active slot, and slot `b`'s content
    /// becomes live.
    pub fn set_active_backup(&mut self, profile: &str, target_index: usize, b: usize) -> Result<()> {
        let target = self.target_mut(profile, target_index)?;
        if b >= target.backup_count {
            return Err(CoreError::no_such("backup slot", b));
        }
        if b == target.active {
            return Ok(());
        }

        let active_slot_path = target.slot_path(target.active);
        let new_slot_path = target.slot_path(b);

        path_utils::rename_or_copy(&target.path, &active_slot_path)?;
        path_utils::rename_or_copy(&new_slot_path, &target.path)?;

        target.active = b;
        Ok(())
    }

    /// Copy the content of one backup slot over another.
    pub fn overwrite_backup(&mut self, profile: &str, target_index: usize, src: usize, dst: usize) -> Result<()> {
        let target = self.target_mut(profile, target_index)?;
        if src >= target.backup_count || dst >= target.backup_count {
            return Err(CoreError::no_such("backup slot", src.max(dst)));
        }
        let src_path = if src == target.active {
            target.path.clone()
        } else {
            target.slot_path(src)
        };
        let dst_path = target.slot_path(dst);
        copy_path(&src_path, &dst_path)
    }

    fn target_mut(&mut self, profile: &str, index: usize) -> Result<&mut BackupTarget> {
        self.targets
            .get_mut(profile)
            .and_then(|v| v.get_mut(index))
            .ok_or_else(|| CoreError::no_such("backup target", index))
    }
}

fn copy_path(from: &Path, to: &Path) -> Result<()> {
    if from.is_dir() {
        if to.exists() {
            fs::remove_dir_all(to).map_err(|e| CoreError::path_io("remove_dir_all", to, e))?;
        }
        copy_dir(from, to)
    } else {
        fs::copy(from, to).map_err(|e| CoreError::path_io("copy", from, e))?;
        Ok(())
    }
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    copy_dir_inner(from, to).map_err(|e| CoreError::path_io("copy_dir", from, e))
}

/// Walks and copies every entry, chaining `anyhow` context per step so a
/// failure midway through a large backup directory names the exact entry
/// that failed rather than just the top-level `from`/`to` pair. Kept
/// internal: the crate's public error surface is still [`CoreError`],
/// produced by [`copy_dir`] from this function's formatted chain.
fn copy_dir_inner(from: &Path, to: &Path) -> anyhow::Result<()> {
    use anyhow::Context;

    fs::create_dir_all(to).with_context(|| format!("creating backup directory {}", to.display()))?;
    for entry in walkdir::WalkDir::new(from).min_depth(1).into_iter().filter_map(|e| e.ok()) {
        let rel = entry.path().strip_prefix(from).unwrap();
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest).with_context(|| format!("creating {}", dest.display()))?;
        } else {
            fs::copy(entry.path(), &dest)
                .with_context(|| format!("copying {} to {}", entry.path().display(), dest.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn add_target_creates_two_backup_slots() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("save.ini");
        fs::write(&path, b"original").unwrap();

        let mut mgr = BackupManager::new();
        mgr.add_target("Default", &path, "save").unwrap();

        let target = &mgr.targets("Default")[0];
        assert_eq!(target.backup_count(), 2);
        assert_eq!(fs::read(target.slot_path(0)).unwrap(), b"original");
        assert_eq!(fs::read(target.slot_path(1)).unwrap(), b"original");
    }

    #[test]
    fn set_active_backup_swaps_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("save.ini");
        fs::write(&path, b"original").unwrap();

        let mut mgr = BackupManager::new();
        mgr.add_target("Default", &path, "save").unwrap();
        // mutate slot 1 to differ
        let slot1 = mgr.targets("Default")[0].slot_path(1);
        fs::write(&slot1, b"alternate").unwrap();

        mgr.set_active_backup("Default", 0, 1).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"alternate");
        assert_eq!(mgr.targets("Default")[0].active_slot(), 1);

        // slot 0 now holds the original content that used to be live.
        let slot0 = mgr.targets("Default")[0].slot_path(0);
        assert_eq!(fs::read(slot0).unwrap(), b"original");
    }
}
