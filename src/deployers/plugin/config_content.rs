//! Config-content plugin deployer (§4.7 "Load-order variant for
//! config-based games", OpenMW `content=` lines).
//!
//! Scans and orders plugins exactly like [`super::loadorder::LoadOrderPluginDeployer`]
//! but rewrites the `content=` lines of a single config file (`openmw.cfg`)
//! in place instead of writing `plugins.txt`/`loadorder.txt`. Also carries
//! the groundcover-tag mod action from the original OpenMW deployer
//! (`ACTION_ADD_GROUNDCOVER_TAG` / `ACTION_REMOVE_GROUNDCOVER_TAG`).

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use regex_lite::Regex;

use crate::error::{CoreError, Result};
use crate::model::ConflictGroup;

use super::{scan, switch_profile_file, PluginEntry};
use crate::deployers::{Capabilities, Deployer, ExternalChange, KeepOrRevertDecision, ModActionRequest};

const CONFIG_FILE: &str = "openmw.cfg";
const LINE_PREFIX: &str = "content=";

/// Action id for tagging a plugin as groundcover content (§4.7 "Mod
/// actions"), matching the original deployer's `ACTION_ADD_GROUNDCOVER_TAG`.
pub const ACTION_ADD_GROUNDCOVER_TAG: u32 = 0;
/// Action id for untagging a plugin as groundcover content.
pub const ACTION_REMOVE_GROUNDCOVER_TAG: u32 = 1;

pub struct ConfigContentPluginDeployer {
    name: String,
    source: PathBuf,
    target: PathBuf,
    pattern: Regex,
    plugins: HashMap<String, Vec<PluginEntry>>,
    groundcover: HashSet<String>,
    profile_slots: HashMap<String, usize>,
    next_slot: usize,
    active_profile: String,
}

impl ConfigContentPluginDeployer {
    pub fn new(name: impl Into<String>, source: PathBuf, target: PathBuf) -> Self {
        Self {
            name: name.into(),
            source,
            target,
            pattern: Regex::new(r"(?i)\.(esp|esm|omwaddon)$").expect("static pattern"),
            plugins: HashMap::new(),
            groundcover: HashSet::new(),
            profile_slots: HashMap::new(),
            next_slot: 0,
            active_profile: "Default".to_string(),
        }
    }

    pub fn plugins(&self, profile: &str) -> &[PluginEntry] {
        self.plugins.get(profile).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn is_groundcover(&self, plugin: &str) -> bool {
        self.groundcover.contains(plugin)
    }

    pub fn scan_source(&mut self, profile: &str) -> Result<()> {
        let existing = self.plugins.get(profile).cloned().unwrap_or_default();
        let scanned = scan(&self.source, &self.pattern, &existing)?;
        self.plugins.insert(profile.to_string(), scanned);
        Ok(())
    }

    pub fn set_enabled(&mut self, profile: &str, plugin: &str, enabled: bool) {
        if let Some(entry) = self.plugins.entry(profile.to_string()).or_default().iter_mut().find(|e| e.name == plugin) {
            entry.enabled = enabled;
        }
    }

    /// Groups plugins into groundcover and everything else, matching
    /// `getConflictGroups` in the original deployer.
    fn grouped(&self, profile: &str) -> (ConflictGroup, ConflictGroup) {
        let mut groundcover = Vec::new();
        let mut normal = Vec::new();
        // plugin ids here are positions in the current load order, matching
        // the original implementation's index-based mod_id.
        for (i, entry) in self.plugins(profile).iter().enumerate() {
            if self.groundcover.contains(&entry.name) {
                groundcover.push(i as u64);
            } else {
                normal.push(i as u64);
            }
        }
        (groundcover, normal)
    }

    /// Surgically rewrite only the `content=` lines of `openmw.cfg`,
    /// leaving every other line untouched and in place.
    pub fn write(&self, profile: &str) -> Result<()> {
        let config_path = self.target.join(CONFIG_FILE);
        let original = fs::read_to_string(&config_path).unwrap_or_default();
        let mut lines: Vec<String> = original.lines().map(|l| l.to_string()).collect();

        let insert_at = lines.iter().position(|l| l.starts_with(LINE_PREFIX)).unwrap_or(lines.len());
        lines.retain(|l| !l.starts_with(LINE_PREFIX));

        let new_lines: Vec<String> = self
            .plugins(profile)
            .iter()
            .filter(|e| e.enabled)
            .map(|e| format!("{LINE_PREFIX}{}", e.name))
            .collect();

        let insert_at = insert_at.min(lines.len());
        lines.splice(insert_at..insert_at, new_lines);

        let mut content = lines.join("\n");
        content.push('\n');
        fs::write(&config_path, content).map_err(|e| CoreError::path_io("write", &config_path, e))
    }
}

impl Deployer for ConfigContentPluginDeployer {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::PLUGIN
    }

    fn source_path(&self) -> &Path {
        &self.source
    }

    fn target_path(&self) -> &Path {
        &self.target
    }

    fn deploy(&mut self, profile: &str) -> Result<HashMap<u64, u64>> {
        self.scan_source(profile)?;
        self.write(profile)?;
        Ok(HashMap::new())
    }

    fn undeploy(&mut self, profile: &str) -> Result<()> {
        self.plugins.remove(profile);
        let config_path = self.target.join(CONFIG_FILE);
        if config_path.exists() {
            self.write(profile)?;
        }
        Ok(())
    }

    fn external_changes(&self, _profile: &str) -> Result<Vec<ExternalChange>> {
        Ok(Vec::new())
    }

    fn keep_or_revert(&mut self, _profile: &str, _decisions: &[KeepOrRevertDecision]) -> Result<()> {
        Ok(())
    }

    fn set_profile(&mut self, profile: &str) -> Result<()> {
        if self.active_profile == profile {
            return Ok(());
        }
        let old_slot = *self.profile_slots.entry(self.active_profile.clone()).or_insert_with(|| {
            let slot = self.next_slot;
            self.next_slot += 1;
            slot
        });
        let new_slot = *self.profile_slots.entry(profile.to_string()).or_insert_with(|| {
            let slot = self.next_slot;
            self.next_slot += 1;
            slot
        });
        switch_profile_file(&self.target, CONFIG_FILE, old_slot, new_slot)?;
        self.active_profile = profile.to_string();
        self.plugins.entry(profile.to_string()).or_default();
        Ok(())
    }

    fn conflict_groups(&self, profile: &str) -> Vec<ConflictGroup> {
        let (groundcover, normal) = self.grouped(profile);
        vec![groundcover, normal]
    }

    fn sort_by_conflicts(&mut self, profile: &str) -> Result<()> {
        let entries = self.plugins.get(profile).cloned().unwrap_or_default();
        let (groundcover, rest): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|e| self.groundcover.contains(&e.name));
        let mut reordered = rest;
        reordered.extend(groundcover);
        self.plugins.insert(profile.to_string(), reordered);
        Ok(())
    }

    fn apply_mod_action(&mut self, profile: &str, request: ModActionRequest<'_>) -> Result<()> {
        let Some(entry) = self.plugins(profile).iter().find(|e| e.name == request.target) else {
            return Ok(());
        };
        let name = entry.name.clone();
        match request.action_id {
            ACTION_ADD_GROUNDCOVER_TAG => {
                self.groundcover.insert(name);
            }
            ACTION_REMOVE_GROUNDCOVER_TAG => {
                self.groundcover.remove(&name);
            }
            other => {
                tracing::debug!(deployer = %self.name, action = other, "ignoring unknown mod action");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_rewrites_only_content_lines() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        let target = dir.path().join("target");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&target).unwrap();
        fs::write(source.join("Base.esm"), b"x").unwrap();
        fs::write(
            target.join(CONFIG_FILE),
            "data=\"/game/data\"\ncontent=Old.esm\nfallback-archive=Textures.bsa\n",
        )
        .unwrap();

        let mut deployer = ConfigContentPluginDeployer::new("content", source, target.clone());
        deployer.set_profile("Default").unwrap();
        deployer.scan_source("Default").unwrap();
        deployer.write("Default").unwrap();

        let content = fs::read_to_string(target.join(CONFIG_FILE)).unwrap();
        assert!(content.contains("content=Base.esm"));
        assert!(!content.contains("Old.esm"));
        assert!(content.contains("fallback-archive=Textures.bsa"));
    }

    #[test]
    fn groundcover_action_moves_plugin_into_its_own_group() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        let target = dir.path().join("target");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&target).unwrap();
        fs::write(source.join("Grass.esp"), b"x").unwrap();
        fs::write(source.join("Base.esm"), b"y").unwrap();

        let mut deployer = ConfigContentPluginDeployer::new("content", source, target);
        deployer.set_profile("Default").unwrap();
        deployer.scan_source("Default").unwrap();
        deployer
            .apply_mod_action("Default", ModActionRequest { action_id: ACTION_ADD_GROUNDCOVER_TAG, target: "Grass.esp" })
            .unwrap();

        assert!(deployer.is_groundcover("Grass.esp"));
        let groups = deployer.conflict_groups("Default");
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 1);
    }
}
