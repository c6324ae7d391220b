//! Generic deployer (§4.5).
//!
//! Links the enabled mods in one `(deployer, profile)` loadorder into a
//! target directory, later entries overriding earlier ones on path
//! collision. Owns conflict-group computation and backs up or restores
//! any file it displaces.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{CoreError, Result};
use crate::model::{ConflictGroup, LoadorderEntry};

use super::manifest::DeployedManifest;
use super::{Capabilities, Deployer, DeployMode, ExternalChange, KeepOrRevertDecision};

const BACKUP_SUFFIX: &str = ".lmmbak";

/// Links mods from a staging tree (`source/<mod-id>/...`) into `target`.
pub struct GenericDeployer {
    name: String,
    source: PathBuf,
    target: PathBuf,
    mode: DeployMode,
    /// Allows [`Deployer::sort_by_conflicts`] to run; off by default
    /// because sort-by-conflicts can still shadow non-conflicting
    /// siblings across groups (§4.5 "labeled unsafe").
    pub enable_unsafe_sorting: bool,
    loadorders: HashMap<String, Vec<LoadorderEntry>>,
    conflict_groups: HashMap<String, Vec<ConflictGroup>>,
    active_profile: String,
}

impl GenericDeployer {
    pub fn new(name: impl Into<String>, source: PathBuf, target: PathBuf, mode: DeployMode) -> Self {
        Self {
            name: name.into(),
            source,
            target,
            mode,
            enable_unsafe_sorting: false,
            loadorders: HashMap::new(),
            conflict_groups: HashMap::new(),
            active_profile: "Default".to_string(),
        }
    }

    pub fn mode(&self) -> DeployMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: DeployMode) {
        self.mode = mode;
    }

    fn order_mut(&mut self, profile: &str) -> &mut Vec<LoadorderEntry> {
        self.loadorders.entry(profile.to_string()).or_default()
    }

    fn mod_dir(&self, mod_id: u64) -> PathBuf {
        self.source.join(mod_id.to_string())
    }

    /// Walk the enabled mods from last to first in the current loadorder,
    /// inserting `(relpath, mod_id)` only when absent -- last-seen wins.
    fn build_source_files(&self, profile: &str) -> Result<(HashMap<PathBuf, u64>, HashMap<u64, u64>)> {
        let mut files: HashMap<PathBuf, u64> = HashMap::new();
        let mut bytes_by_mod: HashMap<u64, u64> = HashMap::new();

        let order = self.loadorder(profile);
        for entry in order.iter().rev().filter(|e| e.enabled) {
            let mod_dir = self.mod_dir(entry.id);
            if !mod_dir.is_dir() {
                continue;
            }
            let mut mod_bytes = 0u64;
            for walked in WalkDir::new(&mod_dir).into_iter().filter_map(|e| e.ok()) {
                if !walked.file_type().is_file() {
                    continue;
                }
                let rel = walked
                    .path()
                    .strip_prefix(&mod_dir)
                    .expect("walkdir entries are rooted at mod_dir")
                    .to_path_buf();
                mod_bytes += walked.metadata().map(|m| m.len()).unwrap_or(0);
                files.entry(rel).or_insert(entry.id);
            }
            bytes_by_mod.insert(entry.id, mod_bytes);
        }
        Ok((files, bytes_by_mod))
    }

    fn backup_path(&self, rel: &Path) -> PathBuf {
        let mut p = self.target.join(rel).into_os_string();
        p.push(BACKUP_SUFFIX);
        PathBuf::from(p)
    }

    fn restore_backup_pass(
        &self,
        source_files: &HashMap<PathBuf, u64>,
        dest_files: &HashMap<PathBuf, u64>,
    ) -> Result<()> {
        for rel in dest_files.keys().filter(|p| !source_files.contains_key(*p)) {
            let target_path = self.target.join(rel);
            let backup_path = self.backup_path(rel);
            if backup_path.exists() {
                if target_path.exists() {
                    fs::remove_file(&target_path).map_err(|e| CoreError::path_io("remove_file", &target_path, e))?;
                }
                fs::rename(&backup_path, &target_path).map_err(|e| CoreError::path_io("rename", &backup_path, e))?;
            } else if target_path.exists() {
                fs::remove_file(&target_path).map_err(|e| CoreError::path_io("remove_file", &target_path, e))?;
            }
            if let Some(parent) = target_path.parent() {
                crate::path_utils::remove_empty_dirs(parent);
            }
        }

        for rel in source_files.keys().filter(|p| !dest_files.contains_key(*p)) {
            let target_path = self.target.join(rel);
            let metadata = fs::symlink_metadata(&target_path);
            if let Ok(metadata) = metadata {
                if metadata.is_file() {
                    let backup_path = self.backup_path(rel);
                    fs::rename(&target_path, &backup_path).map_err(|e| CoreError::path_io("rename", &target_path, e))?;
                }
            }
        }
        Ok(())
    }

    fn link_pass(&self, source_files: &HashMap<PathBuf, u64>) -> Result<()> {
        for (rel, mod_id) in source_files {
            let src = self.mod_dir(*mod_id).join(rel);
            let dst = self.target.join(rel);
            if is_equivalent_link(&src, &dst, self.mode) {
                continue;
            }
            place_link(&src, &dst, self.mode)?;
        }
        Ok(())
    }

    fn run_deploy(&mut self, profile: &str) -> Result<HashMap<u64, u64>> {
        let (source_files, bytes_by_mod) = self.build_source_files(profile)?;
        let dest_files = DeployedManifest::read(&self.target)?.files;

        self.restore_backup_pass(&source_files, &dest_files)?;
        self.link_pass(&source_files)?;

        DeployedManifest { files: source_files }.write(&self.target)?;
        Ok(bytes_by_mod)
    }

    /// Probe hard-link creation from source to target with a sentinel
    /// file; on failure, switch this deployer's mode to sym-link
    /// (§4.5 "Fix invalid deploy mode").
    pub fn fix_invalid_deploy_mode(&mut self) -> Result<()> {
        if self.mode != DeployMode::HardLink {
            return Ok(());
        }
        fs::create_dir_all(&self.source).map_err(|e| CoreError::path_io("create_dir_all", &self.source, e))?;
        fs::create_dir_all(&self.target).map_err(|e| CoreError::path_io("create_dir_all", &self.target, e))?;

        let sentinel_src = self.source.join(".lmm-link-probe");
        let sentinel_dst = self.target.join(".lmm-link-probe");
        fs::write(&sentinel_src, b"probe").map_err(|e| CoreError::path_io("write", &sentinel_src, e))?;
        let probe_result = fs::hard_link(&sentinel_src, &sentinel_dst);
        fs::remove_file(&sentinel_src).ok();
        fs::remove_file(&sentinel_dst).ok();

        if probe_result.is_err() {
            tracing::warn!(deployer = %self.name, "hard-link probe failed, switching to sym-link mode");
            self.mode = DeployMode::SymLink;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn is_equivalent_link(src: &Path, dst: &Path, mode: DeployMode) -> bool {
    use std::os::unix::fs::MetadataExt;

    match mode {
        DeployMode::HardLink => {
            let (Ok(s), Ok(d)) = (fs::metadata(src), fs::metadata(dst)) else {
                return false;
            };
            s.dev() == d.dev() && s.ino() == d.ino()
        }
        DeployMode::SymLink => match fs::read_link(dst) {
            Ok(target) => target == src,
            Err(_) => false,
        },
        DeployMode::Copy => false,
    }
}

#[cfg(not(unix))]
fn is_equivalent_link(_src: &Path, _dst: &Path, _mode: DeployMode) -> bool {
    false
}

fn place_link(src: &Path, dst: &Path, mode: DeployMode) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| CoreError::path_io("create_dir_all", parent, e))?;
    }
    if fs::symlink_metadata(dst).is_ok() {
        fs::remove_file(dst).map_err(|e| CoreError::path_io("remove_file", dst, e))?;
    }
    match mode {
        DeployMode::HardLink => fs::hard_link(src, dst).map_err(|e| CoreError::path_io("hard_link", src, e)),
        DeployMode::SymLink => symlink(src, dst).map_err(|e| CoreError::path_io("symlink", src, e)),
        DeployMode::Copy => fs::copy(src, dst).map(|_| ()).map_err(|e| CoreError::path_io("copy", src, e)),
    }
}

#[cfg(unix)]
fn symlink(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

#[cfg(not(unix))]
fn symlink(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::copy(src, dst).map(|_| ())
}

impl Deployer for GenericDeployer {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::GENERIC
    }

    fn source_path(&self) -> &Path {
        &self.source
    }

    fn target_path(&self) -> &Path {
        &self.target
    }

    fn deploy(&mut self, profile: &str) -> Result<HashMap<u64, u64>> {
        self.run_deploy(profile)
    }

    fn undeploy(&mut self, profile: &str) -> Result<()> {
        let saved = self.loadorders.remove(profile);
        self.loadorders.insert(profile.to_string(), Vec::new());
        let result = self.run_deploy(profile).map(|_| ());
        if let Some(saved) = saved {
            self.loadorders.insert(profile.to_string(), saved);
        }
        result
    }

    fn external_changes(&self, _profile: &str) -> Result<Vec<ExternalChange>> {
        if self.mode == DeployMode::Copy {
            return Ok(Vec::new());
        }
        let manifest = DeployedManifest::read(&self.target)?;
        let mut changes = Vec::new();
        for (rel, mod_id) in &manifest.files {
            let src = self.mod_dir(*mod_id).join(rel);
            let dst = self.target.join(rel);
            if !is_equivalent_link(&src, &dst, self.mode) {
                changes.push(ExternalChange {
                    path: rel.clone(),
                    mod_id: Some(*mod_id),
                });
            }
        }
        Ok(changes)
    }

    fn keep_or_revert(&mut self, _profile: &str, decisions: &[KeepOrRevertDecision]) -> Result<()> {
        let manifest = DeployedManifest::read(&self.target)?;
        for decision in decisions {
            let Some(mod_id) = manifest.files.get(&decision.path) else {
                continue;
            };
            let staging_src = self.mod_dir(*mod_id).join(&decision.path);
            let target_path = self.target.join(&decision.path);

            if decision.keep {
                if staging_src.exists() {
                    fs::remove_file(&staging_src).map_err(|e| CoreError::path_io("remove_file", &staging_src, e))?;
                }
                let real_target = fs::canonicalize(&target_path).unwrap_or_else(|_| target_path.clone());
                if let Some(parent) = staging_src.parent() {
                    fs::create_dir_all(parent).map_err(|e| CoreError::path_io("create_dir_all", parent, e))?;
                }
                if fs::rename(&real_target, &staging_src).is_err() {
                    fs::copy(&real_target, &staging_src).map_err(|e| CoreError::path_io("copy", &real_target, e))?;
                    fs::remove_file(&real_target).map_err(|e| CoreError::path_io("remove_file", &real_target, e))?;
                }
                place_link(&staging_src, &target_path, self.mode)?;
            } else {
                if fs::symlink_metadata(&target_path).is_ok() {
                    fs::remove_file(&target_path).map_err(|e| CoreError::path_io("remove_file", &target_path, e))?;
                }
                place_link(&staging_src, &target_path, self.mode)?;
            }
        }
        Ok(())
    }

    fn set_profile(&mut self, profile: &str) -> Result<()> {
        self.active_profile = profile.to_string();
        self.loadorders.entry(profile.to_string()).or_default();
        self.conflict_groups.entry(profile.to_string()).or_default();
        Ok(())
    }

    fn loadorder(&self, profile: &str) -> Vec<LoadorderEntry> {
        self.loadorders.get(profile).cloned().unwrap_or_default()
    }

    fn set_loadorder(&mut self, profile: &str, order: Vec<LoadorderEntry>) {
        self.loadorders.insert(profile.to_string(), order);
    }

    fn add_mod(&mut self, profile: &str, mod_id: u64) {
        let order = self.order_mut(profile);
        if !order.iter().any(|e| e.id == mod_id) {
            order.push(LoadorderEntry::new(mod_id, true));
        }
    }

    fn remove_mod(&mut self, profile: &str, mod_id: u64) {
        self.order_mut(profile).retain(|e| e.id != mod_id);
    }

    fn conflict_groups(&self, profile: &str) -> Vec<ConflictGroup> {
        self.conflict_groups.get(profile).cloned().unwrap_or_else(|| self.compute_conflict_groups(profile))
    }

    fn sort_by_conflicts(&mut self, profile: &str) -> Result<()> {
        if !self.enable_unsafe_sorting {
            tracing::debug!(deployer = %self.name, "sort_by_conflicts skipped, unsafe sorting not enabled");
            return Ok(());
        }
        let groups = self.compute_conflict_groups(profile);
        let order = self.loadorder(profile);
        let enabled: HashMap<u64, bool> = order.iter().map(|e| (e.id, e.enabled)).collect();

        let mut new_order = Vec::with_capacity(order.len());
        for group in &groups {
            for id in group {
                if let Some(&enabled) = enabled.get(id) {
                    new_order.push(LoadorderEntry::new(*id, enabled));
                }
            }
        }
        self.conflict_groups.insert(profile.to_string(), groups);
        self.loadorders.insert(profile.to_string(), new_order);
        Ok(())
    }

    fn update_deployed_for_mod(&mut self, _profile: &str, mod_id: u64) -> Result<()> {
        let manifest = DeployedManifest::read(&self.target)?;
        for (rel, owner) in manifest.files.iter().filter(|(_, owner)| **owner == mod_id) {
            let src = self.mod_dir(*owner).join(rel);
            let dst = self.target.join(rel);
            if fs::symlink_metadata(&dst).is_ok() {
                fs::remove_file(&dst).map_err(|e| CoreError::path_io("remove_file", &dst, e))?;
            }
            place_link(&src, &dst, self.mode)?;
        }
        Ok(())
    }
}

impl GenericDeployer {
    /// Compute conflict groups without caching them (§4.5 "Conflict
    /// computation"): union intersecting per-mod file sets by repeated
    /// fixed-point merges, then append a trailing group of mods that
    /// conflicted with none.
    fn compute_conflict_groups(&self, profile: &str) -> Vec<ConflictGroup> {
        let order: Vec<u64> = self.loadorder(profile).iter().filter(|e| e.enabled).map(|e| e.id).collect();

        let mut owner_of: HashMap<PathBuf, u64> = HashMap::new();
        let mut conflicted: HashSet<u64> = HashSet::new();
        let mut groups: Vec<HashSet<u64>> = Vec::new();

        for &id in &order {
            let mod_dir = self.mod_dir(id);
            if !mod_dir.is_dir() {
                continue;
            }
            for walked in WalkDir::new(&mod_dir).into_iter().filter_map(|e| e.ok()) {
                if !walked.file_type().is_file() {
                    continue;
                }
                let rel = walked
                    .path()
                    .strip_prefix(&mod_dir)
                    .expect("walkdir entries are rooted at mod_dir")
                    .to_path_buf();
                match owner_of.get(&rel) {
                    None => {
                        owner_of.insert(rel, id);
                    }
                    Some(&other) => {
                        conflicted.insert(id);
                        conflicted.insert(other);
                        merge_into_groups(&mut groups, id, other);
                    }
                }
            }
        }

        // Fixed-point merge: groups that now share a member are combined.
        loop {
            let mut merged_any = false;
            'outer: for i in 0..groups.len() {
                for j in (i + 1)..groups.len() {
                    if !groups[i].is_disjoint(&groups[j]) {
                        let other = groups.remove(j);
                        groups[i].extend(other);
                        merged_any = true;
                        break 'outer;
                    }
                }
            }
            if !merged_any {
                break;
            }
        }

        let mut result: Vec<ConflictGroup> = groups
            .into_iter()
            .map(|set| order.iter().filter(|id| set.contains(id)).copied().collect())
            .collect();

        let lone: ConflictGroup = order.into_iter().filter(|id| !conflicted.contains(id)).collect();
        result.push(lone);
        result
    }
}

fn merge_into_groups(groups: &mut Vec<HashSet<u64>>, a: u64, b: u64) {
    let mut target_index = None;
    for (i, group) in groups.iter().enumerate() {
        if group.contains(&a) || group.contains(&b) {
            target_index = Some(i);
            break;
        }
    }
    match target_index {
        Some(i) => {
            groups[i].insert(a);
            groups[i].insert(b);
        }
        None => {
            let mut set = HashSet::new();
            set.insert(a);
            set.insert(b);
            groups.push(set);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_mod_file(source: &Path, mod_id: u64, rel: &str, content: &[u8]) {
        let path = source.join(mod_id.to_string()).join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn deploy_links_enabled_mods_last_wins() {
        crate::test_support::init_tracing();
        let dir = tempdir().unwrap();
        let source = dir.path().join("staging");
        let target = dir.path().join("target");
        fs::create_dir_all(&target).unwrap();

        write_mod_file(&source, 0, "plugin.esp", b"base");
        write_mod_file(&source, 1, "plugin.esp", b"override");

        let mut deployer = GenericDeployer::new("generic", source, target.clone(), DeployMode::Copy);
        deployer.set_profile("Default").unwrap();
        deployer.set_loadorder(
            "Default",
            vec![LoadorderEntry::new(0, true), LoadorderEntry::new(1, true)],
        );

        let bytes = deployer.deploy("Default").unwrap();
        assert_eq!(fs::read(target.join("plugin.esp")).unwrap(), b"override");
        assert_eq!(bytes.len(), 2);
    }

    #[test]
    fn undeploy_restores_displaced_file() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("staging");
        let target = dir.path().join("target");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("plugin.esp"), b"pre-existing").unwrap();

        write_mod_file(&source, 0, "plugin.esp", b"modded");

        let mut deployer = GenericDeployer::new("generic", source, target.clone(), DeployMode::Copy);
        deployer.set_profile("Default").unwrap();
        deployer.set_loadorder("Default", vec![LoadorderEntry::new(0, true)]);
        deployer.deploy("Default").unwrap();
        assert_eq!(fs::read(target.join("plugin.esp")).unwrap(), b"modded");

        deployer.undeploy("Default").unwrap();
        assert_eq!(fs::read(target.join("plugin.esp")).unwrap(), b"pre-existing");
    }

    #[test]
    fn conflict_groups_partition_overlapping_mods() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("staging");
        let target = dir.path().join("target");
        fs::create_dir_all(&target).unwrap();

        write_mod_file(&source, 0, "a.txt", b"x");
        write_mod_file(&source, 1, "a.txt", b"y");
        write_mod_file(&source, 2, "b.txt", b"z");

        let mut deployer = GenericDeployer::new("generic", source, target, DeployMode::Copy);
        deployer.set_profile("Default").unwrap();
        deployer.set_loadorder(
            "Default",
            vec![
                LoadorderEntry::new(0, true),
                LoadorderEntry::new(1, true),
                LoadorderEntry::new(2, true),
            ],
        );

        let groups = deployer.conflict_groups("Default");
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().any(|g| g == &vec![0, 1]));
        assert!(groups.iter().any(|g| g == &vec![2]));
    }

    #[test]
    fn disabled_mods_are_excluded_from_deploy() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("staging");
        let target = dir.path().join("target");
        fs::create_dir_all(&target).unwrap();
        write_mod_file(&source, 0, "a.txt", b"x");

        let mut deployer = GenericDeployer::new("generic", source, target.clone(), DeployMode::Copy);
        deployer.set_profile("Default").unwrap();
        deployer.set_loadorder("Default", vec![LoadorderEntry::new(0, false)]);
        deployer.deploy("Default").unwrap();

        assert!(!target.join("a.txt").exists());
    }
}
