//! The persisted settings document (§6 "Staging settings file").
//!
//! `<staging>/cfg.json`, written atomically (tmp + rename) with a
//! `.cfg.json.bak` sibling kept after every successful read -- the same
//! discipline [`crate::deployers::manifest`] uses for `.lmmfiles`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backup::BackupManager;
use crate::deployers::DeployMode;
use crate::error::{CoreError, Result};
use crate::model::{AutoTag, ConflictGroup, Group, LoadorderEntry, ManualTag, Mod, Profile};

use super::deployer_record::DeployerKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployerProfileDoc {
    pub name: String,
    pub loadorder: Vec<LoadorderEntry>,
    pub conflict_groups: Vec<ConflictGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployerDoc {
    #[serde(rename = "type")]
    pub kind: DeployerKind,
    pub name: String,
    pub priority: i32,
    pub source_path: PathBuf,
    pub dest_path: PathBuf,
    pub deploy_mode: DeployMode,
    pub enable_unsafe_sorting: bool,
    pub profiles: Vec<DeployerProfileDoc>,
    /// Only meaningful for `plugin_load_order`; §6's minimal schema
    /// doesn't name these but [`crate::deployers::plugin::loadorder::LoadOrderPluginDeployer`]
    /// needs them to reconstruct its [`crate::collaborators::SortingEngine`]
    /// wiring on load (DESIGN.md).
    #[serde(default)]
    pub masterlist_url: Option<String>,
    #[serde(default)]
    pub prelude_url: Option<String>,
}

/// §6 only names `path` for a backup target, but [`BackupManager`]'s API
/// always needs a display name to recreate a [`crate::backup::BackupTarget`];
/// persisted here too rather than invented fresh on every load (DESIGN.md).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupTargetDoc {
    pub path: PathBuf,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsDoc {
    pub name: String,
    pub command: String,
    pub icon_path: Option<String>,
    pub steam_app_id: Option<u64>,
    pub profiles: Vec<Profile>,
    pub installed_mods: Vec<Mod>,
    pub groups: Vec<Group>,
    pub deployers: Vec<DeployerDoc>,
    pub tools: Vec<String>,
    pub backup_targets: Vec<BackupTargetDoc>,
    pub manual_tags: Vec<ManualTag>,
    pub auto_tags: Vec<AutoTag>,
}

impl SettingsDoc {
    pub fn empty(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            icon_path: None,
            steam_app_id: None,
            profiles: vec![Profile::default()],
            installed_mods: Vec::new(),
            groups: Vec::new(),
            deployers: Vec::new(),
            tools: Vec::new(),
            backup_targets: Vec::new(),
            manual_tags: Vec::new(),
            auto_tags: Vec::new(),
        }
    }

    /// §4.9 "Parse": required keys are implicit in the struct shape
    /// (serde rejects a document missing `name`/`command`/`profiles`/
    /// `deployers` with a `Parse` error below); what's checked here is
    /// referential integrity serde can't express -- every mod-id a
    /// deployer's loadorder or a group references must name an installed
    /// mod, and every group's active member must be one of its members.
    pub fn validate(&self) -> Result<()> {
        let known_mods: std::collections::HashSet<u64> = self.installed_mods.iter().map(|m| m.id).collect();

        for group in &self.groups {
            if !group.members.contains(&group.active_member) {
                return Err(CoreError::parse(
                    "cfg.json",
                    "groups[].active_member",
                    "active_member is not one of members",
                ));
            }
            for member in &group.members {
                if !known_mods.contains(member) {
                    return Err(CoreError::parse("cfg.json", "groups[].members", format!("unknown mod-id {member}")));
                }
            }
        }

        for deployer in &self.deployers {
            if deployer.instance_ids_are_autonomous() {
                continue;
            }
            for profile in &deployer.profiles {
                for entry in &profile.loadorder {
                    if !known_mods.contains(&entry.id) {
                        return Err(CoreError::parse(
                            "cfg.json",
                            "deployers[].profiles[].loadorder",
                            format!("unknown mod-id {}", entry.id),
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    /// Load `path`; on success, also refresh `backup_path` with the
    /// just-read content (§4.9/§6: "Keeps a `.cfg.json.bak` after every
    /// successful read"), so a recovery snapshot exists even if the
    /// process never reaches a mutating `write`.
    pub fn read(path: &Path, backup_path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(path).map_err(|e| CoreError::path_io("read", path, e))?;
        let doc: Self = serde_json::from_str(&data)
            .map_err(|e| CoreError::parse(path, "<root>", e))?;
        doc.validate()?;
        fs::copy(path, backup_path).map_err(|e| CoreError::path_io("copy", path, e))?;
        Ok(Some(doc))
    }

    /// Write `cfg.json.tmp` then rename over `cfg.json` (the commit
    /// point), keeping the previous content as `.cfg.json.bak`.
    pub fn write(&self, path: &Path, backup_path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CoreError::path_io("create_dir_all", parent, e))?;
        }
        if path.exists() {
            fs::copy(path, backup_path).map_err(|e| CoreError::path_io("copy", path, e))?;
        }

        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| CoreError::parse(path, "<root>", e))?;
        fs::write(&tmp, data).map_err(|e| CoreError::path_io("write", &tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| CoreError::path_io("rename", &tmp, e))?;
        Ok(())
    }
}

impl DeployerDoc {
    fn instance_ids_are_autonomous(&self) -> bool {
        matches!(
            self.kind,
            DeployerKind::PluginLoadOrder
                | DeployerKind::PluginArchiveList
                | DeployerKind::PluginConfigContent
                | DeployerKind::PluginModOrder
                | DeployerKind::Reverse
        )
    }
}

/// Restore every [`BackupTargetDoc`] into a fresh [`BackupManager`],
/// recreating slot 0/1 only if the live path still exists (a target
/// whose path vanished between sessions is simply skipped -- the next
/// `add_target` call recreates it).
pub fn rebuild_backup_manager(profile: &str, targets: &[BackupTargetDoc]) -> Result<BackupManager> {
    let mut mgr = BackupManager::new();
    for target in targets {
        if target.path.exists() {
            mgr.add_target(profile, &target.path, &target.name)?;
        }
    }
    Ok(mgr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        let backup = dir.path().join(".cfg.json.bak");

        let doc = SettingsDoc::empty("My Game", "/usr/bin/game");
        doc.write(&path, &backup).unwrap();

        let loaded = SettingsDoc::read(&path, &backup).unwrap().unwrap();
        assert_eq!(loaded.name, "My Game");
        assert_eq!(loaded.profiles.len(), 1);
    }

    #[test]
    fn write_keeps_previous_content_as_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        let backup = dir.path().join(".cfg.json.bak");

        SettingsDoc::empty("First", "cmd").write(&path, &backup).unwrap();
        SettingsDoc::empty("Second", "cmd").write(&path, &backup).unwrap();

        let backed_up = SettingsDoc::read(&backup, &dir.path().join(".unused.bak")).unwrap().unwrap();
        assert_eq!(backed_up.name, "First");
    }

    #[test]
    fn read_refreshes_backup_even_without_a_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        let backup = dir.path().join(".cfg.json.bak");

        SettingsDoc::empty("Only", "cmd").write(&path, &backup).unwrap();
        fs::remove_file(&backup).unwrap();

        SettingsDoc::read(&path, &backup).unwrap();
        assert!(backup.exists());
    }

    #[test]
    fn validate_rejects_group_active_member_outside_members() {
        let mut doc = SettingsDoc::empty("G", "cmd");
        doc.installed_mods.push(Mod {
            id: 1,
            name: "A".into(),
            version: "1".into(),
            install_time: chrono::Utc::now(),
            remote_update_time: None,
            suppress_update_time: None,
            local_source: None,
            remote_source: None,
            remote_mod_id: None,
            remote_file_id: None,
            remote_type: None,
            size_on_disk: 0,
            installer: crate::model::InstallerKind::Simple,
        });
        doc.groups.push(Group { active_member: 99, members: vec![1] });
        assert!(doc.validate().is_err());
    }
}
