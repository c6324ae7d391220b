//! Load-order plugin deployer (§4.7, Bethesda-style `plugins.txt` /
//! `loadorder.txt`).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use filetime::FileTime;
use regex_lite::Regex;

use crate::collaborators::{Clock, PluginRecord, SortingEngine, UrlFetcher};
use crate::error::{CoreError, Result};
use crate::model::ConflictGroup;

use super::{profile_slot_path, scan, switch_profile_file, PluginClass, PluginEntry, PluginTags};
use crate::deployers::{Capabilities, Deployer, DeployMode, ExternalChange, KeepOrRevertDecision};

const PLUGINS_FILE: &str = "plugins.txt";
const LOADORDER_FILE: &str = "loadorder.txt";
/// Fixed epoch for the load-order mtime trick: 2010-01-01T00:00:00Z.
const MTIME_EPOCH_UNIX: i64 = 1_262_304_000;

pub struct LoadOrderPluginDeployer {
    name: String,
    /// Directory mods land in once deployed -- scanned for plugin files.
    source: PathBuf,
    /// Directory the game reads `plugins.txt`/`loadorder.txt` from.
    target: PathBuf,
    pattern: Regex,
    plugins: HashMap<String, Vec<PluginEntry>>,
    tags: PluginTags,
    profile_slots: HashMap<String, usize>,
    next_slot: usize,
    active_profile: String,
    masterlist_url: String,
    prelude_url: String,
}

impl LoadOrderPluginDeployer {
    pub fn new(name: impl Into<String>, source: PathBuf, target: PathBuf, masterlist_url: impl Into<String>, prelude_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source,
            target,
            pattern: Regex::new(r"(?i)\.(esp|esm|esl)$").expect("static pattern"),
            plugins: HashMap::new(),
            tags: PluginTags::new(),
            profile_slots: HashMap::new(),
            next_slot: 0,
            active_profile: "Default".to_string(),
            masterlist_url: masterlist_url.into(),
            prelude_url: prelude_url.into(),
        }
    }

    pub fn plugins(&self, profile: &str) -> &[PluginEntry] {
        self.plugins.get(profile).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn masterlist_url(&self) -> &str {
        &self.masterlist_url
    }

    pub fn prelude_url(&self) -> &str {
        &self.prelude_url
    }

    pub fn set_enabled(&mut self, profile: &str, plugin: &str, enabled: bool) {
        if let Some(entry) = self.plugins.entry(profile.to_string()).or_default().iter_mut().find(|e| e.name == plugin) {
            entry.enabled = enabled;
        }
    }

    /// Replace the order of plugins for `profile` wholesale (drag-reorder
    /// from a UI); unknown names are dropped, missing known names keep
    /// their prior `enabled` state re-appended at the end.
    pub fn reorder(&mut self, profile: &str, new_order: &[String]) {
        let current = self.plugins.entry(profile.to_string()).or_default();
        let by_name: HashMap<String, bool> = current.iter().map(|e| (e.name.clone(), e.enabled)).collect();
        let mut reordered: Vec<PluginEntry> = new_order
            .iter()
            .filter_map(|name| by_name.get(name).map(|&enabled| PluginEntry::new(name.clone(), enabled)))
            .collect();
        for entry in current.iter() {
            if !reordered.iter().any(|e| e.name == entry.name) {
                reordered.push(entry.clone());
            }
        }
        *current = reordered;
    }

    pub fn scan_source(&mut self, profile: &str) -> Result<()> {
        let existing = self.plugins.get(profile).cloned().unwrap_or_default();
        let scanned = scan(&self.source, &self.pattern, &existing)?;
        self.plugins.insert(profile.to_string(), scanned);
        Ok(())
    }

    fn masterlist_path(&self) -> PathBuf {
        self.target.join(".lmm-masterlist.yaml")
    }

    fn prelude_path(&self) -> PathBuf {
        self.target.join(".lmm-prelude.yaml")
    }

    fn is_stale(path: &Path, clock: &dyn Clock) -> bool {
        let Ok(metadata) = fs::metadata(path) else {
            return true;
        };
        let Ok(modified) = metadata.modified() else {
            return true;
        };
        let modified: DateTime<Utc> = modified.into();
        clock.now() - modified > Duration::hours(1)
    }

    /// Download `masterlist.yaml`/`prelude.yaml` if missing or older
    /// than an hour (§4.7 "External sorting integration"). Each download
    /// is parsed as YAML before being written to disk, so a truncated or
    /// corrupt fetch surfaces as a [`CoreError::Parse`] instead of
    /// silently poisoning the cache the sorting engine reads next.
    pub fn refresh_masterlist(&self, fetcher: &dyn UrlFetcher, clock: &dyn Clock) -> Result<()> {
        let masterlist_path = self.masterlist_path();
        if Self::is_stale(&masterlist_path, clock) {
            let content = fetcher.fetch(&self.masterlist_url)?;
            Self::validate_yaml(&masterlist_path, &content)?;
            fs::write(&masterlist_path, content).map_err(|e| CoreError::path_io("write", &masterlist_path, e))?;
        }
        let prelude_path = self.prelude_path();
        if Self::is_stale(&prelude_path, clock) {
            let content = fetcher.fetch(&self.prelude_url)?;
            Self::validate_yaml(&prelude_path, &content)?;
            fs::write(&prelude_path, content).map_err(|e| CoreError::path_io("write", &prelude_path, e))?;
        }
        Ok(())
    }

    fn validate_yaml(path: &Path, content: &[u8]) -> Result<()> {
        serde_yaml::from_slice::<serde_yaml::Value>(content)
            .map(|_| ())
            .map_err(|e| CoreError::parse(path, "<root>", e))
    }

    /// Ask the external sorting engine for a new order, then classify
    /// each plugin (light / master / standard) and record the result as
    /// an auto-tag.
    pub fn sort_with_engine(&mut self, profile: &str, engine: &dyn SortingEngine) -> Result<()> {
        let entries = self.plugins.get(profile).cloned().unwrap_or_default();
        let records: Vec<PluginRecord> = entries
            .iter()
            .map(|e| PluginRecord { name: e.name.clone(), masters: Vec::new() })
            .collect();
        let order = engine.sort(&records)?;
        self.reorder(profile, &order);

        for entry in &records {
            let class = classify(&entry.name, &entry.masters);
            self.tags.insert(entry.name.clone(), vec![tag_name(class).to_string()]);
        }
        Ok(())
    }

    /// Produce `plugins.txt` and `loadorder.txt`, and advance each
    /// plugin's on-disk mtime by one minute per load-order slot from a
    /// fixed epoch, so file-modification-time games respect the order.
    pub fn write(&self, profile: &str) -> Result<()> {
        let entries = self.plugins(profile);

        let plugins_lines: String = entries
            .iter()
            .map(|e| if e.enabled { format!("*{}\n", e.name) } else { format!("{}\n", e.name) })
            .collect();
        let plugins_path = self.target.join(PLUGINS_FILE);
        fs::write(&plugins_path, plugins_lines).map_err(|e| CoreError::path_io("write", &plugins_path, e))?;

        let loadorder_lines: String = entries.iter().map(|e| format!("{}\n", e.name)).collect();
        let loadorder_path = self.target.join(LOADORDER_FILE);
        fs::write(&loadorder_path, loadorder_lines).map_err(|e| CoreError::path_io("write", &loadorder_path, e))?;

        for (slot, entry) in entries.iter().enumerate() {
            let plugin_path = self.source.join(&entry.name);
            let real_path = fs::canonicalize(&plugin_path).unwrap_or(plugin_path);
            if !real_path.exists() {
                continue;
            }
            let mtime = FileTime::from_unix_time(MTIME_EPOCH_UNIX + slot as i64 * 60, 0);
            filetime::set_file_mtime(&real_path, mtime).map_err(|e| CoreError::path_io("set_file_mtime", &real_path, e))?;
        }
        Ok(())
    }
}

fn classify(name: &str, masters: &[String]) -> PluginClass {
    if name.to_lowercase().ends_with(".esl") {
        PluginClass::Light
    } else if masters.is_empty() {
        PluginClass::Master
    } else {
        PluginClass::Standard
    }
}

fn tag_name(class: PluginClass) -> &'static str {
    match class {
        PluginClass::Light => "light",
        PluginClass::Master => "master",
        PluginClass::Standard => "standard",
    }
}

impl Deployer for LoadOrderPluginDeployer {
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
        let plugins_path = self.target.join(PLUGINS_FILE);
        let loadorder_path = self.target.join(LOADORDER_FILE);
        fs::write(&plugins_path, "").map_err(|e| CoreError::path_io("write", &plugins_path, e))?;
        fs::write(&loadorder_path, "").map_err(|e| CoreError::path_io("write", &loadorder_path, e))?;
        self.plugins.remove(profile);
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

        switch_profile_file(&self.target, PLUGINS_FILE, old_slot, new_slot)?;
        switch_profile_file(&self.target, LOADORDER_FILE, old_slot, new_slot)?;

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
    use crate::collaborators::{FixedClock, MockSortingEngine};
    use tempfile::tempdir;

    #[test]
    fn scan_appends_new_files_and_drops_missing() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        let target = dir.path().join("target");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&target).unwrap();
        fs::write(source.join("a.esp"), b"x").unwrap();

        let mut deployer = LoadOrderPluginDeployer::new("loadorder", source.clone(), target, "http://x/masterlist.yaml", "http://x/prelude.yaml");
        deployer.set_profile("Default").unwrap();
        deployer.scan_source("Default").unwrap();
        assert_eq!(deployer.plugins("Default").len(), 1);

        fs::write(source.join("b.esp"), b"y").unwrap();
        deployer.scan_source("Default").unwrap();
        assert_eq!(deployer.plugins("Default").len(), 2);
        assert_eq!(deployer.plugins("Default")[1].name, "b.esp");

        fs::remove_file(source.join("a.esp")).unwrap();
        deployer.scan_source("Default").unwrap();
        assert_eq!(deployer.plugins("Default").len(), 1);
        assert_eq!(deployer.plugins("Default")[0].name, "b.esp");
    }

    #[test]
    fn write_prefixes_enabled_plugins_with_star() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        let target = dir.path().join("target");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&target).unwrap();
        fs::write(source.join("a.esp"), b"x").unwrap();
        fs::write(source.join("b.esp"), b"y").unwrap();

        let mut deployer = LoadOrderPluginDeployer::new("loadorder", source, target.clone(), "u1", "u2");
        deployer.set_profile("Default").unwrap();
        deployer.scan_source("Default").unwrap();
        deployer.set_enabled("Default", "b.esp", false);
        deployer.write("Default").unwrap();

        let content = fs::read_to_string(target.join(PLUGINS_FILE)).unwrap();
        assert!(content.contains("*a.esp"));
        assert!(content.contains("b.esp"));
        assert!(!content.contains("*b.esp"));
    }

    #[test]
    fn sort_with_engine_reorders_and_tags() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        let target = dir.path().join("target");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&target).unwrap();
        fs::write(source.join("a.esp"), b"x").unwrap();
        fs::write(source.join("b.esl"), b"y").unwrap();

        let mut deployer = LoadOrderPluginDeployer::new("loadorder", source, target, "u1", "u2");
        deployer.set_profile("Default").unwrap();
        deployer.scan_source("Default").unwrap();

        let mut engine = MockSortingEngine::new();
        engine.expect_sort().returning(|_| Ok(vec!["b.esl".to_string(), "a.esp".to_string()]));

        deployer.sort_with_engine("Default", &engine).unwrap();
        assert_eq!(deployer.plugins("Default")[0].name, "b.esl");
        assert_eq!(deployer.tags.get("b.esl").unwrap()[0], "light");
    }

    #[test]
    fn refresh_masterlist_writes_valid_yaml() {
        use crate::collaborators::MockUrlFetcher;

        let dir = tempdir().unwrap();
        let target = dir.path().join("target");
        fs::create_dir_all(&target).unwrap();
        let deployer = LoadOrderPluginDeployer::new("loadorder", dir.path().join("source"), target.clone(), "u1", "u2");

        let mut fetcher = MockUrlFetcher::new();
        fetcher.expect_fetch().returning(|_| Ok(b"globals:\n  - type: note\n".to_vec()));

        let clock = FixedClock(chrono::Utc::now());
        deployer.refresh_masterlist(&fetcher, &clock).unwrap();
        assert!(target.join(".lmm-masterlist.yaml").exists());
    }

    #[test]
    fn refresh_masterlist_rejects_corrupt_download() {
        use crate::collaborators::MockUrlFetcher;

        let dir = tempdir().unwrap();
        let target = dir.path().join("target");
        fs::create_dir_all(&target).unwrap();
        let deployer = LoadOrderPluginDeployer::new("loadorder", dir.path().join("source"), target.clone(), "u1", "u2");

        let mut fetcher = MockUrlFetcher::new();
        fetcher.expect_fetch().returning(|_| Ok(b"\"unterminated".to_vec()));

        let clock = FixedClock(chrono::Utc::now());
        let result = deployer.refresh_masterlist(&fetcher, &clock);
        assert!(result.is_err());
        assert!(!target.join(".lmm-masterlist.yaml").exists());
    }
}
