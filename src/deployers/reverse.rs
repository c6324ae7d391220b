//! Reverse deployer (§4.8).
//!
//! The inverse flow from every other deployer: it adopts files already
//! present in the target directory that no other deployer claims, moves
//! them into its own source store, and links them back at deploy time.
//! Useful for save games, config files dropped by the game itself, or
//! anything a player wants tracked without being a mod.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{CoreError, Result};
use crate::path_utils;

use super::manifest::MANIFEST_FILE_NAME;
use super::{Capabilities, Deployer, DeployMode, ExternalChange, KeepOrRevertDecision};

const IGNORED_FILES_NAME: &str = ".revdepl-ignored_files.json";
const MANAGED_FILES_NAME: &str = ".revdepl-managed_files.json";
const DEPLOYED_FILES_NAME: &str = ".revdepl-deployed_files.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct ManagedFilesDoc {
    profiles: HashMap<String, Vec<ManagedEntry>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManagedEntry {
    path: PathBuf,
    enabled: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IgnoredFilesDoc {
    paths: Vec<PathBuf>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DeployedFilesDoc {
    profile: Option<String>,
    paths: Vec<PathBuf>,
}

fn write_json<T: Serialize>(path: &Path, doc: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let serialized = serde_json::to_string_pretty(doc).map_err(|e| CoreError::parse(path, "root", e))?;
    fs::write(&tmp, serialized).map_err(|e| CoreError::path_io("write", &tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| CoreError::path_io("rename", &tmp, e))?;
    Ok(())
}

fn read_json<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path).map_err(|e| CoreError::path_io("read", path, e))?;
    serde_json::from_str(&content).map_err(|e| CoreError::parse(path, "root", e))
}

/// Adopts files from `target` that no other deployer's `.lmmfiles`
/// manifest claims.
pub struct ReverseDeployer {
    name: String,
    source: PathBuf,
    target: PathBuf,
    mode: DeployMode,
    separate_dirs: bool,
    managed: HashMap<String, HashMap<PathBuf, bool>>,
    ignored: HashSet<PathBuf>,
    deployed_profile: Option<String>,
    deployed_snapshot: Vec<PathBuf>,
    active_profile: String,
}

impl ReverseDeployer {
    pub fn new(name: impl Into<String>, source: PathBuf, target: PathBuf, mode: DeployMode) -> Self {
        Self {
            name: name.into(),
            source,
            target,
            mode,
            separate_dirs: false,
            managed: HashMap::new(),
            ignored: HashSet::new(),
            deployed_profile: None,
            deployed_snapshot: Vec::new(),
            active_profile: "Default".to_string(),
        }
    }

    fn ignored_path(&self) -> PathBuf {
        self.target.join(IGNORED_FILES_NAME)
    }

    fn managed_path(&self) -> PathBuf {
        self.source.join(MANAGED_FILES_NAME)
    }

    fn deployed_path(&self) -> PathBuf {
        self.source.join(DEPLOYED_FILES_NAME)
    }

    pub fn load_state(&mut self) -> Result<()> {
        let ignored: IgnoredFilesDoc = read_json(&self.ignored_path())?;
        self.ignored = ignored.paths.into_iter().collect();

        let managed: ManagedFilesDoc = read_json(&self.managed_path())?;
        self.managed = managed
            .profiles
            .into_iter()
            .map(|(profile, entries)| {
                (profile, entries.into_iter().map(|e| (e.path, e.enabled)).collect())
            })
            .collect();

        let deployed: DeployedFilesDoc = read_json(&self.deployed_path())?;
        self.deployed_profile = deployed.profile;
        self.deployed_snapshot = deployed.paths;
        Ok(())
    }

    pub fn save_state(&self) -> Result<()> {
        write_json(
            &self.ignored_path(),
            &IgnoredFilesDoc {
                paths: self.ignored.iter().cloned().collect(),
            },
        )?;
        write_json(
            &self.managed_path(),
            &ManagedFilesDoc {
                profiles: self
                    .managed
                    .iter()
                    .map(|(profile, map)| {
                        (
                            profile.clone(),
                            map.iter().map(|(path, enabled)| ManagedEntry { path: path.clone(), enabled: *enabled }).collect(),
                        )
                    })
                    .collect(),
            },
        )?;
        write_json(
            &self.deployed_path(),
            &DeployedFilesDoc {
                profile: self.deployed_profile.clone(),
                paths: self.deployed_snapshot.clone(),
            },
        )
    }

    fn mod_source_dir(&self, profile: &str) -> PathBuf {
        if self.separate_dirs {
            self.source.join(profile)
        } else {
            self.source.clone()
        }
    }

    /// Directories anywhere under `target` that hold another deployer's
    /// `.lmmfiles` manifest -- everything beneath one belongs to that
    /// deployer, not this one.
    fn manifest_dirs(&self) -> HashSet<PathBuf> {
        WalkDir::new(&self.target)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && e.file_name() == MANIFEST_FILE_NAME)
            .filter_map(|e| e.path().parent().map(|p| p.to_path_buf()))
            .collect()
    }

    fn is_covered(dirs: &HashSet<PathBuf>, path: &Path) -> bool {
        let mut current = path.parent();
        while let Some(p) = current {
            if dirs.contains(p) {
                return true;
            }
            current = p.parent();
        }
        false
    }

    fn is_bookkeeping_name(name: &std::ffi::OsStr) -> bool {
        let name = name.to_string_lossy();
        name == MANIFEST_FILE_NAME
            || name == IGNORED_FILES_NAME
            || name == MANAGED_FILES_NAME
            || name == DEPLOYED_FILES_NAME
            || name.ends_with(".lmmbak")
    }

    /// Walk `target` and refresh the managed-files set for `profile`
    /// (§4.8 "Update managed files").
    pub fn update_managed_files(&mut self, profile: &str) -> Result<()> {
        let covered = self.manifest_dirs();
        let mut seen = Vec::new();

        for entry in WalkDir::new(&self.target).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() || Self::is_bookkeeping_name(entry.file_name()) {
                continue;
            }
            let rel = entry.path().strip_prefix(&self.target).expect("rooted at target").to_path_buf();

            if Self::is_covered(&covered, entry.path()) || self.ignored.contains(&rel) {
                if self.separate_dirs {
                    self.managed.entry(profile.to_string()).or_default().remove(&rel);
                } else {
                    for map in self.managed.values_mut() {
                        map.remove(&rel);
                    }
                }
                continue;
            }

            seen.push(rel);
        }

        if self.separate_dirs {
            let map = self.managed.entry(profile.to_string()).or_default();
            for rel in seen {
                map.entry(rel).or_insert(true);
            }
        } else {
            for profile_map in self.managed.values_mut() {
                for rel in &seen {
                    profile_map.entry(rel.clone()).or_insert(true);
                }
            }
            if self.managed.is_empty() {
                let map = self.managed.entry(profile.to_string()).or_default();
                for rel in seen {
                    map.insert(rel, true);
                }
            }
        }
        Ok(())
    }

    /// Move every managed file still present in `target` into this
    /// deployer's source store (§4.8 "Move from target to source").
    pub fn move_from_target_to_source(&mut self, profile: &str) -> Result<()> {
        let source_dir = self.mod_source_dir(profile);
        let paths: Vec<PathBuf> = self
            .managed
            .get(profile)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();

        for rel in paths {
            let target_path = self.target.join(&rel);
            let source_path = source_dir.join(&rel);
            if !target_path.exists() {
                continue;
            }
            if paths_equivalent(&target_path, &source_path, self.mode) {
                continue;
            }
            path_utils::rename_or_copy(&target_path, &source_path)?;
        }
        Ok(())
    }

    fn do_undeploy_snapshot(&mut self) -> Result<()> {
        for rel in self.deployed_snapshot.drain(..).collect::<Vec<_>>() {
            let target_path = self.target.join(&rel);
            if fs::symlink_metadata(&target_path).is_ok() {
                fs::remove_file(&target_path).map_err(|e| CoreError::path_io("remove_file", &target_path, e))?;
            }
            if let Some(parent) = target_path.parent() {
                path_utils::remove_empty_dirs(parent);
            }
        }
        self.deployed_profile = None;
        Ok(())
    }

    /// Turn on per-profile source directories: move current source
    /// contents into `<source>/<current-profile>/`, create empty
    /// directories for every other known profile.
    pub fn enable_separate_dirs(&mut self, profiles: &[String]) -> Result<()> {
        if self.separate_dirs {
            return Ok(());
        }
        let current_dir = self.source.join(&self.active_profile);
        fs::create_dir_all(&current_dir).map_err(|e| CoreError::path_io("create_dir_all", &current_dir, e))?;

        for entry in fs::read_dir(&self.source).map_err(|e| CoreError::path_io("read_dir", &self.source, e))? {
            let entry = entry.map_err(|e| CoreError::path_io("read_dir", &self.source, e))?;
            let name = entry.file_name();
            if profiles.iter().any(|p| p == &name.to_string_lossy()) || name == *DEPLOYED_FILES_NAME || name == *MANAGED_FILES_NAME {
                continue;
            }
            path_utils::rename_or_copy(&entry.path(), &current_dir.join(&name))?;
        }

        for profile in profiles {
            fs::create_dir_all(self.source.join(profile)).map_err(|e| CoreError::path_io("create_dir_all", &self.source, e))?;
        }

        self.separate_dirs = true;
        Ok(())
    }

    /// Turn off per-profile source directories: delete other profiles'
    /// trees and hoist the current profile's files up to `<source>/`.
    pub fn disable_separate_dirs(&mut self, profiles: &[String]) -> Result<()> {
        if !self.separate_dirs {
            return Ok(());
        }
        let current_dir = self.source.join(&self.active_profile);
        if current_dir.is_dir() {
            path_utils::move_files_to_directory(&current_dir, &self.source)?;
            fs::remove_dir_all(&current_dir).ok();
        }
        for profile in profiles {
            if profile == &self.active_profile {
                continue;
            }
            let dir = self.source.join(profile);
            if dir.is_dir() {
                fs::remove_dir_all(&dir).ok();
            }
        }
        self.separate_dirs = false;
        Ok(())
    }

    /// Reset the ignore set to the target's current contents (minus
    /// anything covered by another deployer).
    pub fn update_ignored_files(&mut self) -> Result<()> {
        let covered = self.manifest_dirs();
        let mut paths = HashSet::new();
        for entry in WalkDir::new(&self.target).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() || Self::is_bookkeeping_name(entry.file_name()) {
                continue;
            }
            if Self::is_covered(&covered, entry.path()) {
                continue;
            }
            let rel = entry.path().strip_prefix(&self.target).expect("rooted at target").to_path_buf();
            paths.insert(rel);
        }
        self.ignored = paths;
        Ok(())
    }

    /// Empty the ignore set and adopt every formerly-ignored file as
    /// managed for `profile`.
    pub fn delete_ignored_files(&mut self, profile: &str) {
        let formerly_ignored = std::mem::take(&mut self.ignored);
        let map = self.managed.entry(profile.to_string()).or_default();
        for path in formerly_ignored {
            map.entry(path).or_insert(true);
        }
    }

    /// Move one managed entry into the ignore set, deleting its
    /// source-side file.
    pub fn add_mod_to_ignore_list(&mut self, profile: &str, rel: &Path) -> Result<()> {
        if let Some(map) = self.managed.get_mut(profile) {
            map.remove(rel);
        }
        self.ignored.insert(rel.to_path_buf());
        let source_path = self.mod_source_dir(profile).join(rel);
        if source_path.exists() {
            fs::remove_file(&source_path).map_err(|e| CoreError::path_io("remove_file", &source_path, e))?;
        }
        Ok(())
    }
}

fn paths_equivalent(target: &Path, source: &Path, mode: DeployMode) -> bool {
    match mode {
        DeployMode::Copy => false,
        #[cfg(unix)]
        DeployMode::HardLink => {
            use std::os::unix::fs::MetadataExt;
            let (Ok(t), Ok(s)) = (fs::metadata(target), fs::metadata(source)) else {
                return false;
            };
            t.dev() == s.dev() && t.ino() == s.ino()
        }
        #[cfg(unix)]
        DeployMode::SymLink => fs::read_link(target).map(|l| l == source).unwrap_or(false),
        #[cfg(not(unix))]
        _ => false,
    }
}

impl Deployer for ReverseDeployer {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::REVERSE
    }

    fn source_path(&self) -> &Path {
        &self.source
    }

    fn target_path(&self) -> &Path {
        &self.target
    }

    fn deploy(&mut self, profile: &str) -> Result<HashMap<u64, u64>> {
        if self.deployed_profile.as_deref().is_some_and(|p| p != profile) {
            self.do_undeploy_snapshot()?;
        }

        self.update_managed_files(profile)?;
        self.move_from_target_to_source(profile)?;

        let source_dir = self.mod_source_dir(profile);
        let enabled: Vec<PathBuf> = self
            .managed
            .get(profile)
            .map(|m| m.iter().filter(|(_, &enabled)| enabled).map(|(p, _)| p.clone()).collect())
            .unwrap_or_default();

        let mut total_bytes = 0u64;
        for rel in &enabled {
            let src = source_dir.join(rel);
            let dst = self.target.join(rel);
            if !src.exists() {
                continue;
            }
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent).map_err(|e| CoreError::path_io("create_dir_all", parent, e))?;
            }
            if fs::symlink_metadata(&dst).is_ok() {
                fs::remove_file(&dst).map_err(|e| CoreError::path_io("remove_file", &dst, e))?;
            }
            match self.mode {
                DeployMode::HardLink => fs::hard_link(&src, &dst).map_err(|e| CoreError::path_io("hard_link", &src, e))?,
                DeployMode::SymLink => symlink(&src, &dst).map_err(|e| CoreError::path_io("symlink", &src, e))?,
                DeployMode::Copy => {
                    fs::copy(&src, &dst).map_err(|e| CoreError::path_io("copy", &src, e))?;
                }
            }
            total_bytes += fs::metadata(&src).map(|m| m.len()).unwrap_or(0);
        }

        self.deployed_profile = Some(profile.to_string());
        self.deployed_snapshot = enabled;
        self.save_state()?;

        let mut result = HashMap::new();
        result.insert(0, total_bytes);
        Ok(result)
    }

    fn undeploy(&mut self, _profile: &str) -> Result<()> {
        self.do_undeploy_snapshot()?;
        self.save_state()
    }

    fn external_changes(&self, _profile: &str) -> Result<Vec<ExternalChange>> {
        Ok(Vec::new())
    }

    fn keep_or_revert(&mut self, _profile: &str, _decisions: &[KeepOrRevertDecision]) -> Result<()> {
        Ok(())
    }

    fn set_profile(&mut self, profile: &str) -> Result<()> {
        self.active_profile = profile.to_string();
        self.managed.entry(profile.to_string()).or_default();
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn adopts_unclaimed_target_files() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("revsrc");
        let target = dir.path().join("target");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("save.ini"), b"save data").unwrap();

        let mut deployer = ReverseDeployer::new("reverse", source.clone(), target.clone(), DeployMode::Copy);
        deployer.set_profile("Default").unwrap();
        deployer.deploy("Default").unwrap();

        assert!(source.join("save.ini").exists());
        assert!(target.join("save.ini").exists());
    }

    #[test]
    fn skips_files_covered_by_another_deployers_manifest() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("revsrc");
        let target = dir.path().join("target");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(target.join("mods")).unwrap();
        fs::write(target.join("mods").join("plugin.esp"), b"x").unwrap();
        fs::write(target.join("mods").join(MANIFEST_FILE_NAME), b"{\"files\":[]}").unwrap();

        let mut deployer = ReverseDeployer::new("reverse", source.clone(), target, DeployMode::Copy);
        deployer.set_profile("Default").unwrap();
        deployer.update_managed_files("Default").unwrap();

        assert!(!deployer.managed.get("Default").unwrap().contains_key(Path::new("mods/plugin.esp")));
    }

    #[test]
    fn undeploy_removes_snapshot_files() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("revsrc");
        let target = dir.path().join("target");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("save.ini"), b"data").unwrap();

        let mut deployer = ReverseDeployer::new("reverse", source, target.clone(), DeployMode::Copy);
        deployer.set_profile("Default").unwrap();
        deployer.deploy("Default").unwrap();
        assert!(target.join("save.ini").exists());

        deployer.undeploy("Default").unwrap();
        assert!(!target.join("save.ini").exists());
    }
}
