//! Mod-order plugin deployer (§4.7 "Supplement dropped features",
//! `bg3deployer.cpp`/`.h`): a BG3-style variant that rewrites a single
//! `<node id="Mods">` section of `modsettings.lsx` wholesale rather than
//! line-by-line like the archive/content variants.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex_lite::Regex;

use crate::error::{CoreError, Result};
use crate::model::ConflictGroup;

use super::{scan, switch_profile_file, PluginEntry};
use crate::deployers::{Capabilities, Deployer, ExternalChange, KeepOrRevertDecision};

const CONFIG_FILE: &str = "modsettings.lsx";
const SECTION_START: &str = "<node id=\"Mods\">";
const SECTION_END: &str = "</node>";

pub struct ModOrderPluginDeployer {
    name: String,
    source: PathBuf,
    target: PathBuf,
    pattern: Regex,
    plugins: HashMap<String, Vec<PluginEntry>>,
    profile_slots: HashMap<String, usize>,
    next_slot: usize,
    active_profile: String,
}

impl ModOrderPluginDeployer {
    pub fn new(name: impl Into<String>, source: PathBuf, target: PathBuf) -> Self {
        Self {
            name: name.into(),
            source,
            target,
            pattern: Regex::new(r"(?i)\.pak$").expect("static pattern"),
            plugins: HashMap::new(),
            profile_slots: HashMap::new(),
            next_slot: 0,
            active_profile: "Default".to_string(),
        }
    }

    pub fn plugins(&self, profile: &str) -> &[PluginEntry] {
        self.plugins.get(profile).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn scan_source(&mut self, profile: &str) -> Result<()> {
        let existing = self.plugins.get(profile).cloned().unwrap_or_default();
        let scanned = scan(&self.source, &self.pattern, &existing)?;
        self.plugins.insert(profile.to_string(), scanned);
        Ok(())
    }

    fn render_section(&self, profile: &str) -> String {
        let mut section = String::new();
        section.push_str(SECTION_START);
        section.push('\n');
        for entry in self.plugins(profile).iter().filter(|e| e.enabled) {
            section.push_str(&format!(
                "    <node id=\"ModuleShortDesc\"><attribute id=\"Name\" value=\"{}\"/></node>\n",
                entry.name
            ));
        }
        section.push_str(SECTION_END);
        section
    }

    /// Rewrite the `Mods` section of `modsettings.lsx` wholesale,
    /// leaving the surrounding document untouched. If the section isn't
    /// present yet, the whole file is created with a single section.
    pub fn write(&self, profile: &str) -> Result<()> {
        let config_path = self.target.join(CONFIG_FILE);
        let original = fs::read_to_string(&config_path).unwrap_or_default();
        let new_section = self.render_section(profile);

        let updated = match (original.find(SECTION_START), original.find(SECTION_END)) {
            (Some(start), Some(end)) if end >= start => {
                let end = end + SECTION_END.len();
                format!("{}{}{}", &original[..start], new_section, &original[end..])
            }
            _ => new_section,
        };

        fs::write(&config_path, updated).map_err(|e| CoreError::path_io("write", &config_path, e))
    }
}

impl Deployer for ModOrderPluginDeployer {
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

    fn conflict_groups(&self, _profile: &str) -> Vec<ConflictGroup> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_rewrites_only_the_mods_section() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        let target = dir.path().join("target");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&target).unwrap();
        fs::write(source.join("CustomRace.pak"), b"x").unwrap();
        fs::write(
            target.join(CONFIG_FILE),
            "<save><region id=\"ModuleSettings\"><node id=\"Mods\">\n    <node id=\"ModuleShortDesc\"><attribute id=\"Name\" value=\"Old.pak\"/></node>\n</node></region></save>",
        )
        .unwrap();

        let mut deployer = ModOrderPluginDeployer::new("modorder", source, target.clone());
        deployer.set_profile("Default").unwrap();
        deployer.scan_source("Default").unwrap();
        deployer.write("Default").unwrap();

        let content = fs::read_to_string(target.join(CONFIG_FILE)).unwrap();
        assert!(content.contains("CustomRace.pak"));
        assert!(!content.contains("Old.pak"));
        assert!(content.starts_with("<save>"));
        assert!(content.trim_end().ends_with("</save>"));
    }

    #[test]
    fn write_creates_file_when_missing() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        let target = dir.path().join("target");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&target).unwrap();
        fs::write(source.join("A.pak"), b"x").unwrap();

        let mut deployer = ModOrderPluginDeployer::new("modorder", source, target.clone());
        deployer.set_profile("Default").unwrap();
        deployer.scan_source("Default").unwrap();
        deployer.write("Default").unwrap();

        let content = fs::read_to_string(target.join(CONFIG_FILE)).unwrap();
        assert!(content.contains("A.pak"));
    }
}
