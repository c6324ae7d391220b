//! Autonomous plugin deployers (§4.7).
//!
//! Shared scanning and per-profile hidden-file machinery for the four
//! concrete variants: [`loadorder::LoadOrderPluginDeployer`] (Bethesda
//! `plugins.txt`/`loadorder.txt`), [`archive_list::ArchiveListPluginDeployer`]
//! (OpenMW `fallback-archive=` lines), [`config_content::ConfigContentPluginDeployer`]
//! (OpenMW `content=` lines, built on the load-order variant's sorting),
//! and [`mod_order::ModOrderPluginDeployer`] (Baldur's Gate 3 mod-order
//! JSON). All four manage their own identifiers -- plugin filenames, not
//! mod-ids -- and ignore loadorder mutations driven by the controller.

pub mod archive_list;
pub mod config_content;
pub mod loadorder;
pub mod mod_order;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// One managed plugin: its filename and whether it's active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginEntry {
    pub name: String,
    pub enabled: bool,
}

impl PluginEntry {
    pub fn new(name: impl Into<String>, enabled: bool) -> Self {
        Self { name: name.into(), enabled }
    }
}

/// Enumerate files directly under `source` matching `pattern`
/// (non-recursive -- plugins live flat in a mod's payload root by
/// convention). New files append at the end, enabled by default;
/// entries whose file no longer exists are dropped; surviving entries
/// keep their relative order (§4.7 "Scan").
pub fn scan(source: &Path, pattern: &Regex, existing: &[PluginEntry]) -> Result<Vec<PluginEntry>> {
    let mut on_disk: Vec<String> = Vec::new();
    if source.is_dir() {
        for entry in fs::read_dir(source).map_err(|e| CoreError::path_io("read_dir", source, e))? {
            let entry = entry.map_err(|e| CoreError::path_io("read_dir", source, e))?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if pattern.is_match(&name) {
                on_disk.push(name);
            }
        }
    }

    let mut surviving: Vec<PluginEntry> = existing
        .iter()
        .filter(|e| on_disk.contains(&e.name))
        .cloned()
        .collect();

    let known: std::collections::HashSet<&str> = surviving.iter().map(|e| e.name.as_str()).collect();
    let mut new_names: Vec<&String> = on_disk.iter().filter(|n| !known.contains(n.as_str())).collect();
    new_names.sort();
    for name in new_names {
        surviving.push(PluginEntry::new(name.clone(), true));
    }

    Ok(surviving)
}

/// Per-profile hidden copy naming: `.<plugin-file>.lmmprof<N>`.
pub fn profile_slot_path(target: &Path, plugin_file_name: &str, slot: usize) -> PathBuf {
    target.join(format!(".{plugin_file_name}.lmmprof{slot}"))
}

/// Switch the live plugin file to a different profile's copy: rename the
/// current file out to its own profile slot, then rename the new
/// profile's slot in over the live filename. If the new profile has no
/// saved slot yet, the live file (if any) is simply renamed out and no
/// new file is created -- the next `write` call produces one.
pub fn switch_profile_file(
    target: &Path,
    plugin_file_name: &str,
    old_slot: usize,
    new_slot: usize,
) -> Result<()> {
    let live = target.join(plugin_file_name);
    let old_slot_path = profile_slot_path(target, plugin_file_name, old_slot);
    let new_slot_path = profile_slot_path(target, plugin_file_name, new_slot);

    if live.exists() {
        fs::rename(&live, &old_slot_path).map_err(|e| CoreError::path_io("rename", &live, e))?;
    }
    if new_slot_path.exists() {
        fs::rename(&new_slot_path, &live).map_err(|e| CoreError::path_io("rename", &new_slot_path, e))?;
    }
    Ok(())
}

/// Plugin classification used by the load-order variant's external
/// sorting integration (§4.7 "classify plugins (light / master /
/// standard)").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginClass {
    Light,
    Master,
    Standard,
}

/// Per-plugin auto-tags (e.g. classification results), keyed by
/// filename.
pub type PluginTags = HashMap<String, Vec<String>>;
