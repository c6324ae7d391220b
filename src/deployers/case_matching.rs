//! Case-matching deployer (§4.6).
//!
//! Wraps a [`GenericDeployer`], rewriting on-disk case in the staging
//! mods it manages before every deploy so their paths match whatever
//! case the target directory (or an earlier mod in the loadorder)
//! already established.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::Result;
use crate::model::{ConflictGroup, LoadorderEntry};
use crate::path_utils;

use super::generic::GenericDeployer;
use super::{Capabilities, Deployer, ExternalChange, KeepOrRevertDecision};

pub struct CaseMatchingDeployer {
    inner: GenericDeployer,
}

impl CaseMatchingDeployer {
    pub fn new(inner: GenericDeployer) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &GenericDeployer {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut GenericDeployer {
        &mut self.inner
    }

    /// Walk each enabled mod's source tree deepest-first, renaming any
    /// path that already exists in the target under a different case to
    /// match the target's case; then unify case across the loadorder so
    /// the earliest-seen case of each relative path wins.
    fn preprocess_case(&self, profile: &str) -> Result<()> {
        let order = self.inner.loadorder(profile);
        let enabled: Vec<u64> = order.iter().filter(|e| e.enabled).map(|e| e.id).collect();

        for &mod_id in &enabled {
            self.match_target_case(mod_id)?;
        }
        self.unify_loadorder_case(&enabled)?;
        Ok(())
    }

    fn match_target_case(&self, mod_id: u64) -> Result<()> {
        let mod_dir = self.inner.source_path().join(mod_id.to_string());
        if !mod_dir.is_dir() {
            return Ok(());
        }

        let mut entries: Vec<PathBuf> = WalkDir::new(&mod_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.path().to_path_buf())
            .collect();
        // Deepest first so a file is renamed before its parent directory.
        entries.sort_by_key(|p| std::cmp::Reverse(p.components().count()));

        for entry in entries {
            if entry == mod_dir {
                continue;
            }
            let rel = entry.strip_prefix(&mod_dir).expect("rooted at mod_dir");
            if let Some(target_cased) = path_utils::resolve_case_insensitive(self.inner.target_path(), rel) {
                let target_rel = target_cased
                    .strip_prefix(self.inner.target_path())
                    .unwrap_or(&target_cased);
                if target_rel != rel {
                    let renamed = mod_dir.join(target_rel);
                    if renamed != entry {
                        if let Some(parent) = renamed.parent() {
                            fs::create_dir_all(parent).ok();
                        }
                        fs::rename(&entry, &renamed).ok();
                    }
                }
            }
        }
        Ok(())
    }

    fn unify_loadorder_case(&self, enabled: &[u64]) -> Result<()> {
        let mut canonical: HashMap<String, PathBuf> = HashMap::new();

        for &mod_id in enabled {
            let mod_dir = self.inner.source_path().join(mod_id.to_string());
            if !mod_dir.is_dir() {
                continue;
            }
            let files: Vec<PathBuf> = WalkDir::new(&mod_dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.path().strip_prefix(&mod_dir).unwrap().to_path_buf())
                .collect();

            for rel in files {
                let key = rel.to_string_lossy().to_lowercase();
                match canonical.get(&key) {
                    None => {
                        canonical.insert(key, rel);
                    }
                    Some(existing) if existing != &rel => {
                        let from = mod_dir.join(&rel);
                        let to = mod_dir.join(existing);
                        if let Some(parent) = to.parent() {
                            fs::create_dir_all(parent).ok();
                        }
                        fs::rename(&from, &to).ok();
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

impl Deployer for CaseMatchingDeployer {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::GENERIC
    }

    fn source_path(&self) -> &Path {
        self.inner.source_path()
    }

    fn target_path(&self) -> &Path {
        self.inner.target_path()
    }

    fn deploy(&mut self, profile: &str) -> Result<HashMap<u64, u64>> {
        self.preprocess_case(profile)?;
        self.inner.deploy(profile)
    }

    fn undeploy(&mut self, profile: &str) -> Result<()> {
        self.inner.undeploy(profile)
    }

    fn external_changes(&self, profile: &str) -> Result<Vec<ExternalChange>> {
        self.inner.external_changes(profile)
    }

    fn keep_or_revert(&mut self, profile: &str, decisions: &[KeepOrRevertDecision]) -> Result<()> {
        self.inner.keep_or_revert(profile, decisions)
    }

    fn set_profile(&mut self, profile: &str) -> Result<()> {
        self.inner.set_profile(profile)
    }

    fn loadorder(&self, profile: &str) -> Vec<LoadorderEntry> {
        self.inner.loadorder(profile)
    }

    fn set_loadorder(&mut self, profile: &str, order: Vec<LoadorderEntry>) {
        self.inner.set_loadorder(profile, order)
    }

    fn add_mod(&mut self, profile: &str, mod_id: u64) {
        self.inner.add_mod(profile, mod_id)
    }

    fn remove_mod(&mut self, profile: &str, mod_id: u64) {
        self.inner.remove_mod(profile, mod_id)
    }

    fn conflict_groups(&self, profile: &str) -> Vec<ConflictGroup> {
        self.inner.conflict_groups(profile)
    }

    fn sort_by_conflicts(&mut self, profile: &str) -> Result<()> {
        self.inner.sort_by_conflicts(profile)
    }

    fn update_deployed_for_mod(&mut self, profile: &str, mod_id: u64) -> Result<()> {
        self.inner.update_deployed_for_mod(profile, mod_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployers::DeployMode;
    use tempfile::tempdir;

    #[test]
    fn matches_existing_target_case_before_deploy() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("staging");
        let target = dir.path().join("target");
        fs::create_dir_all(target.join("Textures")).unwrap();
        fs::write(target.join("Textures").join("placeholder.dds"), b"orig").unwrap();

        fs::create_dir_all(source.join("0").join("textures")).unwrap();
        fs::write(source.join("0").join("textures").join("rock.dds"), b"new").unwrap();

        let generic = GenericDeployer::new("generic", source.clone(), target.clone(), DeployMode::Copy);
        let mut deployer = CaseMatchingDeployer::new(generic);
        deployer.set_profile("Default").unwrap();
        deployer.set_loadorder("Default", vec![LoadorderEntry::new(0, true)]);
        deployer.deploy("Default").unwrap();

        assert!(target.join("Textures").join("rock.dds").exists());
    }

    #[test]
    fn unifies_case_across_loadorder() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("staging");
        let target = dir.path().join("target");
        fs::create_dir_all(&target).unwrap();

        fs::create_dir_all(source.join("0")).unwrap();
        fs::write(source.join("0").join("Plugin.esp"), b"a").unwrap();
        fs::create_dir_all(source.join("1")).unwrap();
        fs::write(source.join("1").join("plugin.esp"), b"b").unwrap();

        let generic = GenericDeployer::new("generic", source.clone(), target.clone(), DeployMode::Copy);
        let mut deployer = CaseMatchingDeployer::new(generic);
        deployer.set_profile("Default").unwrap();
        deployer.set_loadorder(
            "Default",
            vec![LoadorderEntry::new(0, true), LoadorderEntry::new(1, true)],
        );
        deployer.deploy("Default").unwrap();

        assert!(target.join("Plugin.esp").exists());
        assert!(!target.join("plugin.esp").exists());
    }
}
