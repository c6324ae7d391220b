//! Archive-list plugin deployer (§4.7 "Archive variant", OpenMW
//! `fallback-archive=` lines).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex_lite::Regex;

use crate::error::{CoreError, Result};
use crate::model::ConflictGroup;

use super::{scan, switch_profile_file, PluginEntry};
use crate::deployers::{Capabilities, Deployer, ExternalChange, KeepOrRevertDecision};

const CONFIG_FILE: &str = "openmw.cfg";
const LINE_PREFIX: &str = "fallback-archive=";

pub struct ArchiveListPluginDeployer {
    name: String,
    source: PathBuf,
    target: PathBuf,
    pattern: Regex,
    entries: HashMap<String, Vec<PluginEntry>>,
    profile_slots: HashMap<String, usize>,
    next_slot: usize,
    active_profile: String,
}

impl ArchiveListPluginDeployer {
    pub fn new(name: impl Into<String>, source: PathBuf, target: PathBuf) -> Self {
        Self {
            name: name.into(),
            source,
            target,
            pattern: Regex::new(r"(?i)\.(bsa|ba2)$").expect("static pattern"),
            entries: HashMap::new(),
            profile_slots: HashMap::new(),
            next_slot: 0,
            active_profile: "Default".to_string(),
        }
    }

    pub fn entries(&self, profile: &str) -> &[PluginEntry] {
        self.entries.get(profile).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn scan_source(&mut self, profile: &str) -> Result<()> {
        let existing = self.entries.get(profile).cloned().unwrap_or_default();
        let scanned = scan(&self.source, &self.pattern, &existing)?;
        self.entries.insert(profile.to_string(), scanned);
        Ok(())
    }

    /// Surgically rewrite only the `fallback-archive=` lines of
    /// `openmw.cfg`, leaving every other line untouched and in place.
    pub fn write(&self, profile: &str) -> Result<()> {
        let config_path = self.target.join(CONFIG_FILE);
        let original = fs::read_to_string(&config_path).unwrap_or_default();
        let mut lines: Vec<String> = original.lines().map(|l| l.to_string()).collect();

        let insert_at = lines.iter().position(|l| l.starts_with(LINE_PREFIX)).unwrap_or(lines.len());
        lines.retain(|l| !l.starts_with(LINE_PREFIX));

        let new_lines: Vec<String> = self
            .entries(profile)
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

impl Deployer for ArchiveListPluginDeployer {
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
        self.entries.remove(profile);
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
        self.entries.entry(profile.to_string()).or_default();
        Ok(())
    }

    fn conflict_groups(&self, _profile: &str) -> Vec<ConflictGroup> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_rewrites_only_fallback_archive_lines() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        let target = dir.path().join("target");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&target).unwrap();
        fs::write(source.join("Textures.bsa"), b"x").unwrap();
        fs::write(
            target.join(CONFIG_FILE),
            "data=\"/game/data\"\nfallback-archive=Old.bsa\nfallback-archive=Old2.bsa\ncontent=base.esm\n",
        )
        .unwrap();

        let mut deployer = ArchiveListPluginDeployer::new("archivelist", source, target.clone());
        deployer.set_profile("Default").unwrap();
        deployer.scan_source("Default").unwrap();
        deployer.write("Default").unwrap();

        let content = fs::read_to_string(target.join(CONFIG_FILE)).unwrap();
        assert!(content.contains("fallback-archive=Textures.bsa"));
        assert!(!content.contains("Old.bsa"));
        assert!(content.contains("data=\"/game/data\""));
        assert!(content.contains("content=base.esm"));
    }
}
