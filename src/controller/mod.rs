//! The staging-state controller (§4.9).
//!
//! The central per-application object: owns every installed mod, the
//! profile list, mutually-exclusive groups, the deployer records, tags,
//! and the backup manager; persists the whole graph atomically to
//! `<staging>/cfg.json`; dispatches deploy/undeploy/tag/group mutations
//! to the right collaborator.

pub mod deployer_record;
pub mod settings;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::backup::BackupManager;
use crate::collaborators::{Clock, RarExtractor};
use crate::config::StagingPaths;
use crate::deployers::case_matching::CaseMatchingDeployer;
use crate::deployers::generic::GenericDeployer;
use crate::deployers::plugin::archive_list::ArchiveListPluginDeployer;
use crate::deployers::plugin::config_content::ConfigContentPluginDeployer;
use crate::deployers::plugin::loadorder::LoadOrderPluginDeployer;
use crate::deployers::plugin::mod_order::ModOrderPluginDeployer;
use crate::deployers::reverse::ReverseDeployer;
use crate::deployers::{Deployer, DeployMode, ExternalChange, KeepOrRevertDecision};
use crate::error::{CoreError, Result};
use crate::installer::{self, InstallOptions, ManifestEntry};
use crate::model::{AutoTag, AutoTagExpression, Group, InstallerKind, ManualTag, Mod, ModFacts, Profile, Tag};
use crate::progress::ProgressNode;

use deployer_record::{DeployerInstance, DeployerKind, DeployerRecord};
use settings::{BackupTargetDoc, DeployerDoc, DeployerProfileDoc, SettingsDoc};

/// Everything `installMod`/`replaceMod` need about a payload to install.
pub struct InstallRequest {
    pub source: PathBuf,
    pub name: String,
    pub version: String,
    pub options: InstallOptions,
    pub manifest: Vec<ManifestEntry>,
    pub remote_source: Option<String>,
    pub remote_mod_id: Option<u64>,
    pub remote_file_id: Option<u64>,
    pub remote_type: Option<String>,
}

/// One action in an atomic `editManualTags` batch.
pub enum ManualTagAction {
    Add { tag: String, mod_id: u64 },
    Remove { tag: String, mod_id: u64 },
    Rename { old: String, new: String },
}

/// One action in an atomic `editAutoTags` batch.
pub enum AutoTagAction {
    Add { name: String, expression: AutoTagExpression },
    Remove { name: String },
    Rename { old: String, new: String },
    ChangeEvaluator { name: String, expression: AutoTagExpression },
}

/// Central per-application object (§4.9).
pub struct StagingController {
    paths: StagingPaths,
    name: String,
    command: String,
    icon_path: Option<String>,
    steam_app_id: Option<u64>,
    mods: HashMap<u64, Mod>,
    profiles: Vec<Profile>,
    active_profile: usize,
    groups: Vec<Group>,
    deployers: Vec<DeployerRecord>,
    tools: Vec<String>,
    backups: BackupManager,
    manual_tags: Vec<ManualTag>,
    auto_tags: Vec<AutoTag>,
}

impl StagingController {
    /// Construct against `paths`, loading `<staging>/cfg.json` if it
    /// exists (§4.9 "Parse"); otherwise start with a single default
    /// profile and no mods, deployers, or tags.
    pub fn load(paths: StagingPaths, name: impl Into<String>, command: impl Into<String>) -> Result<Self> {
        let settings_path = paths.settings_file();
        let backup_path = paths.settings_backup_file();
        match SettingsDoc::read(&settings_path, &backup_path)? {
            Some(doc) => Self::from_doc(paths, doc),
            None => {
                tracing::info!(path = %settings_path.display(), "no settings file found, starting fresh");
                Ok(Self {
                    paths,
                    name: name.into(),
                    command: command.into(),
                    icon_path: None,
                    steam_app_id: None,
                    mods: HashMap::new(),
                    profiles: vec![Profile::default()],
                    active_profile: 0,
                    groups: Vec::new(),
                    deployers: Vec::new(),
                    tools: Vec::new(),
                    backups: BackupManager::new(),
                    manual_tags: Vec::new(),
                    auto_tags: Vec::new(),
                })
            }
        }
    }

    fn from_doc(paths: StagingPaths, doc: SettingsDoc) -> Result<Self> {
        let mods: HashMap<u64, Mod> = doc.installed_mods.into_iter().map(|m| (m.id, m)).collect();

        let mut deployers = Vec::with_capacity(doc.deployers.len());
        for deployer_doc in &doc.deployers {
            let instance = instantiate(deployer_doc)?;
            deployers.push(DeployerRecord::new(deployer_doc.name.clone(), deployer_doc.priority, instance));
        }

        let active_profile_name = doc.profiles.first().map(|p| p.name.clone()).unwrap_or_else(|| "Default".to_string());
        let backups = settings::rebuild_backup_manager(&active_profile_name, &doc.backup_targets)?;

        Ok(Self {
            paths,
            name: doc.name,
            command: doc.command,
            icon_path: doc.icon_path,
            steam_app_id: doc.steam_app_id,
            mods,
            profiles: doc.profiles,
            active_profile: 0,
            groups: doc.groups,
            deployers,
            tools: doc.tools,
            backups,
            manual_tags: doc.manual_tags,
            auto_tags: doc.auto_tags,
        })
    }

    fn active_profile_name(&self) -> String {
        self.profiles.get(self.active_profile).map(|p| p.name.clone()).unwrap_or_else(|| "Default".to_string())
    }

    /// Persist the whole graph to `<staging>/cfg.json`, keeping the
    /// previous content as `.cfg.json.bak` (§4.9).
    pub fn save(&self) -> Result<()> {
        let profile = self.active_profile_name();
        let deployers = self
            .deployers
            .iter()
            .map(|record| {
                let mut profiles = Vec::with_capacity(self.profiles.len());
                for p in &self.profiles {
                    profiles.push(DeployerProfileDoc {
                        name: p.name.clone(),
                        loadorder: record.instance.loadorder(&p.name),
                        conflict_groups: record.instance.conflict_groups(&p.name),
                    });
                }
                let (masterlist_url, prelude_url) = match &record.instance {
                    DeployerInstance::PluginLoadOrder(d) => (Some(d.masterlist_url().to_string()), Some(d.prelude_url().to_string())),
                    _ => (None, None),
                };
                DeployerDoc {
                    kind: record.instance.kind(),
                    name: record.name.clone(),
                    priority: record.priority,
                    source_path: record.instance.source_path().to_path_buf(),
                    dest_path: record.instance.target_path().to_path_buf(),
                    deploy_mode: record.instance.deploy_mode(),
                    enable_unsafe_sorting: false,
                    profiles,
                    masterlist_url,
                    prelude_url,
                }
            })
            .collect();

        let backup_targets = self
            .backups
            .targets(&profile)
            .iter()
            .map(|t| BackupTargetDoc { path: t.path.clone(), name: t.name.clone() })
            .collect();

        let doc = SettingsDoc {
            name: self.name.clone(),
            command: self.command.clone(),
            icon_path: self.icon_path.clone(),
            steam_app_id: self.steam_app_id,
            profiles: self.profiles.clone(),
            installed_mods: self.mods.values().cloned().collect(),
            groups: self.groups.clone(),
            deployers,
            tools: self.tools.clone(),
            backup_targets,
            manual_tags: self.manual_tags.clone(),
            auto_tags: self.auto_tags.clone(),
        };

        doc.write(&self.paths.settings_file(), &self.paths.settings_backup_file())
    }

    fn smallest_free_mod_id(&self) -> u64 {
        let mut id = 0u64;
        while self.mods.contains_key(&id) || self.paths.mod_dir(id).exists() {
            id += 1;
        }
        id
    }

    /// **installMod** (§4.9): allocate the smallest free id, install the
    /// payload, create the Mod record, and update any auto-tags whose
    /// expression now matches it.
    pub fn install_mod(&mut self, request: InstallRequest, clock: &dyn Clock, progress: &ProgressNode, rar: &dyn RarExtractor) -> Result<u64> {
        let id = self.smallest_free_mod_id();
        let dest = self.paths.mod_dir(id);
        let installer_kind = if request.manifest.is_empty() { InstallerKind::Simple } else { InstallerKind::FileManifest };

        let size = installer::install(&request.source, &dest, request.options, &request.manifest, progress, rar).map_err(|e| {
            fs::remove_dir_all(&dest).ok();
            e
        })?;

        let record = Mod {
            id,
            name: request.name,
            version: request.version,
            install_time: clock.now(),
            remote_update_time: None,
            suppress_update_time: None,
            local_source: Some(request.source),
            remote_source: request.remote_source,
            remote_mod_id: request.remote_mod_id,
            remote_file_id: request.remote_file_id,
            remote_type: request.remote_type,
            size_on_disk: size,
            installer: installer_kind,
        };
        self.mods.insert(id, record);
        self.reapply_auto_tags_to(&[id])?;
        tracing::info!(mod_id = id, "installed mod");
        Ok(id)
    }

    /// **replaceMod** (§4.9): keep the id, install into a temp-replace
    /// sibling, swap it in, then refresh every deployer that has this
    /// mod in its loadorder and split off any subtree another deployer
    /// now claims.
    pub fn replace_mod(&mut self, mod_id: u64, request: InstallRequest, progress: &ProgressNode, rar: &dyn RarExtractor) -> Result<()> {
        let dest = self.paths.mod_dir(mod_id);
        let temp = dest.with_file_name(format!("tmp_replace_{mod_id}"));
        fs::remove_dir_all(&temp).ok();

        let size = installer::install(&request.source, &temp, request.options, &request.manifest, progress, rar).map_err(|e| {
            fs::remove_dir_all(&temp).ok();
            e
        })?;

        fs::remove_dir_all(&dest).ok();
        fs::rename(&temp, &dest).map_err(|e| CoreError::path_io("rename", &temp, e))?;

        {
            let m = self.mods.get_mut(&mod_id).ok_or_else(|| CoreError::no_such("mod", mod_id))?;
            m.version = request.version;
            m.local_source = Some(request.source);
            m.size_on_disk = size;
        }

        let profile = self.active_profile_name();
        let affected: Vec<usize> = (0..self.deployers.len())
            .filter(|&i| {
                !self.deployers[i].instance.capabilities().is_autonomous
                    && self.deployers[i].instance.loadorder(&profile).iter().any(|e| e.id == mod_id)
            })
            .collect();

        for i in affected {
            self.deployers[i].instance.update_deployed_for_mod(&profile, mod_id)?;
            self.split_mod(mod_id, i)?;
        }

        tracing::info!(mod_id, "replaced mod");
        Ok(())
    }

    /// **splitMod** (§4.9): if another deployer's target sits below
    /// `deployer_index`'s target and this mod has files at that
    /// sub-path, peel that subtree into a new mod assigned only to the
    /// sub-deployer.
    pub fn split_mod(&mut self, mod_id: u64, deployer_index: usize) -> Result<Option<u64>> {
        let parent_target = self.deployers[deployer_index].instance.target_path().to_path_buf();
        let mod_dir = self.paths.mod_dir(mod_id);

        let mut sub_index = None;
        let mut relative = PathBuf::new();
        for (i, record) in self.deployers.iter().enumerate() {
            if i == deployer_index {
                continue;
            }
            let sub_target = record.instance.target_path();
            if let Ok(rel) = sub_target.strip_prefix(&parent_target) {
                if rel.as_os_str().is_empty() {
                    continue;
                }
                if mod_dir.join(rel).exists() {
                    sub_index = Some(i);
                    relative = rel.to_path_buf();
                    break;
                }
            }
        }

        let Some(sub_index) = sub_index else { return Ok(None) };

        let subtree_source = mod_dir.join(&relative);
        let new_id = self.smallest_free_mod_id();
        let new_dir = self.paths.mod_dir(new_id);
        if let Some(parent) = new_dir.parent() {
            fs::create_dir_all(parent).map_err(|e| CoreError::path_io("create_dir_all", parent, e))?;
        }
        crate::path_utils::rename_or_copy(&subtree_source, &new_dir)?;

        let parent_mod = self.mods.get(&mod_id).ok_or_else(|| CoreError::no_such("mod", mod_id))?.clone();
        let sub_name = self.deployers[sub_index].name.clone();
        let new_mod = Mod {
            id: new_id,
            name: format!("{} [{}]", parent_mod.name, sub_name),
            version: parent_mod.version.clone(),
            install_time: parent_mod.install_time,
            remote_update_time: None,
            suppress_update_time: None,
            local_source: parent_mod.local_source.clone(),
            remote_source: None,
            remote_mod_id: None,
            remote_file_id: None,
            remote_type: None,
            size_on_disk: 0,
            installer: parent_mod.installer,
        };
        self.mods.insert(new_id, new_mod);

        let profile = self.active_profile_name();
        self.deployers[sub_index].instance.add_mod(&profile, new_id);

        tracing::info!(mod_id, new_id, deployer = %sub_name, "split mod subtree");
        Ok(Some(new_id))
    }

    /// **uninstallMods** (§4.9): detach from groups, every deployer in
    /// every profile, and every manual tag, then delete the staging
    /// subtree.
    pub fn uninstall_mods(&mut self, ids: &[u64]) -> Result<()> {
        for &id in ids {
            for group in &mut self.groups {
                group.members.retain(|&m| m != id);
                if group.active_member == id {
                    if let Some(&first) = group.members.first() {
                        group.active_member = first;
                    }
                }
            }

            for record in &mut self.deployers {
                for profile in &self.profiles {
                    record.instance.remove_mod(&profile.name, id);
                }
            }

            for tag in &mut self.manual_tags {
                tag.mod_ids.remove(&id);
            }
            for tag in &mut self.auto_tags {
                tag.mod_ids.remove(&id);
            }

            let dir = self.paths.mod_dir(id);
            fs::remove_dir_all(&dir).ok();
            self.mods.remove(&id);
        }

        self.groups.retain(|g| {
            let keep = g.members.len() >= 2;
            if !keep {
                tracing::debug!(active = g.active_member, "dropping group below two members");
            }
            keep
        });

        tracing::info!(count = ids.len(), "uninstalled mods");
        Ok(())
    }

    /// Replace `old` with `new` wherever `old` currently occupies a slot
    /// in a non-autonomous deployer's loadorder, for every profile —
    /// the mechanism shared by group create/add/remove/change-active
    /// (§4.9 "occupies the slot that the previous active member held").
    fn replace_group_member_in_deployers(&mut self, old: u64, new: u64) {
        for record in &mut self.deployers {
            if record.instance.capabilities().is_autonomous {
                continue;
            }
            for profile in self.profiles.clone() {
                let mut order = record.instance.loadorder(&profile.name);
                let mut changed = false;
                for entry in &mut order {
                    if entry.id == old {
                        entry.id = new;
                        changed = true;
                    }
                }
                if changed {
                    record.instance.set_loadorder(&profile.name, order);
                }
            }
        }
    }

    /// **createGroup(a,b)** (§4.9): if neither is grouped, form a new
    /// group; if one already belongs to a group, fold the other into
    /// that group instead.
    pub fn create_group(&mut self, a: u64, b: u64) -> usize {
        if let Some(idx) = self.groups.iter().position(|g| g.contains(a)) {
            if !self.groups[idx].members.contains(&b) {
                self.groups[idx].members.push(b);
            }
            self.replace_group_member_in_deployers(b, self.groups[idx].active_member);
            return idx;
        }
        if let Some(idx) = self.groups.iter().position(|g| g.contains(b)) {
            if !self.groups[idx].members.contains(&a) {
                self.groups[idx].members.push(a);
            }
            self.replace_group_member_in_deployers(a, self.groups[idx].active_member);
            return idx;
        }
        self.groups.push(Group::new(a, b));
        self.replace_group_member_in_deployers(b, a);
        self.groups.len() - 1
    }

    pub fn add_mod_to_group(&mut self, group_index: usize, mod_id: u64) -> Result<()> {
        let group = self.groups.get_mut(group_index).ok_or_else(|| CoreError::no_such("group", group_index))?;
        if !group.members.contains(&mod_id) {
            group.members.push(mod_id);
        }
        let active = group.active_member;
        self.replace_group_member_in_deployers(mod_id, active);
        Ok(())
    }

    pub fn remove_mod_from_group(&mut self, group_index: usize, mod_id: u64) -> Result<()> {
        let group = self.groups.get_mut(group_index).ok_or_else(|| CoreError::no_such("group", group_index))?;
        group.members.retain(|&m| m != mod_id);
        if group.active_member == mod_id {
            if let Some(&new_active) = group.members.first() {
                group.active_member = new_active;
                self.replace_group_member_in_deployers(mod_id, new_active);
            }
        }
        if self.groups[group_index].members.len() < 2 {
            self.groups.remove(group_index);
        }
        Ok(())
    }

    pub fn change_active_group_member(&mut self, group_index: usize, new_active: u64) -> Result<()> {
        let group = self.groups.get_mut(group_index).ok_or_else(|| CoreError::no_such("group", group_index))?;
        if !group.members.contains(&new_active) {
            return Err(CoreError::no_such("group member", new_active));
        }
        let old_active = group.active_member;
        group.active_member = new_active;
        self.replace_group_member_in_deployers(old_active, new_active);
        Ok(())
    }

    /// **setProfile(n)** (§4.9): switch every deployer and the backup
    /// manager; does not re-deploy.
    pub fn set_profile(&mut self, name: &str) -> Result<()> {
        let index = self.profiles.iter().position(|p| p.name == name).ok_or_else(|| CoreError::no_such("profile", name))?;
        for record in &mut self.deployers {
            record.instance.set_profile(name)?;
        }
        self.active_profile = index;
        tracing::info!(profile = name, "switched active profile");
        Ok(())
    }

    fn mod_relative_files(&self, mod_id: u64) -> Vec<String> {
        let dir = self.paths.mod_dir(mod_id);
        if !dir.is_dir() {
            return Vec::new();
        }
        walkdir::WalkDir::new(&dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.path().strip_prefix(&dir).ok().map(|p| p.to_string_lossy().replace('\\', "/")))
            .collect()
    }

    fn reapply_auto_tags_to(&mut self, mod_ids: &[u64]) -> Result<()> {
        let mut cache: HashMap<u64, Vec<String>> = HashMap::new();
        for &id in mod_ids {
            cache.insert(id, self.mod_relative_files(id));
        }
        for tag in &mut self.auto_tags {
            for &id in mod_ids {
                let Some(m) = self.mods.get(&id) else { continue };
                let files = &cache[&id];
                let facts = ModFacts { name: &m.name, files };
                if tag.expression.evaluate(&facts) {
                    tag.mod_ids.insert(id);
                } else {
                    tag.mod_ids.remove(&id);
                }
            }
        }
        Ok(())
    }

    /// Re-evaluate every auto-tag's expression against every installed
    /// mod, reusing one cached file listing per mod across all tags
    /// (§4.9 "using a cached file-listing per mod for efficiency").
    pub fn update_auto_tags(&mut self) -> Result<()> {
        let ids: Vec<u64> = self.mods.keys().copied().collect();
        self.reapply_auto_tags_to(&ids)
    }

    /// **editManualTags(actions)** (§4.9): apply the whole batch against
    /// a clone of the tag list; on any failure the original list is left
    /// untouched.
    pub fn edit_manual_tags(&mut self, actions: &[ManualTagAction]) -> Result<()> {
        let mut working = self.manual_tags.clone();
        for action in actions {
            apply_manual_tag_action(&mut working, action)?;
        }
        self.manual_tags = working;
        Ok(())
    }

    /// **editAutoTags(actions)** (§4.9): same atomicity guarantee; any
    /// `ChangeEvaluator` action triggers a full re-evaluation once the
    /// batch commits.
    pub fn edit_auto_tags(&mut self, actions: &[AutoTagAction]) -> Result<()> {
        let mut working = self.auto_tags.clone();
        let mut needs_reapply = false;
        for action in actions {
            if matches!(action, AutoTagAction::ChangeEvaluator { .. }) {
                needs_reapply = true;
            }
            apply_auto_tag_action(&mut working, action)?;
        }
        self.auto_tags = working;
        if needs_reapply {
            self.update_auto_tags()?;
        }
        Ok(())
    }

    /// Collect each deployer's [`ExternalChange`]s for `profile`, keyed
    /// by deployer name, so a caller can surface keep-or-revert choices
    /// before committing a deploy (§4.9 "surface the choices to the
    /// user", SPEC_FULL `deploy_with_review`).
    pub fn external_changes(&self, profile: &str) -> Result<HashMap<String, Vec<ExternalChange>>> {
        let mut out = HashMap::new();
        for record in &self.deployers {
            let changes = record.instance.external_changes(profile)?;
            if !changes.is_empty() {
                out.insert(record.name.clone(), changes);
            }
        }
        Ok(out)
    }

    /// Apply any keep-or-revert decisions the caller gathered from
    /// [`Self::external_changes`], then run [`Self::deploy`].
    pub fn deploy_with_review(&mut self, profile: &str, decisions: &HashMap<String, Vec<KeepOrRevertDecision>>) -> Result<()> {
        for record in &mut self.deployers {
            if let Some(decs) = decisions.get(&record.name) {
                record.instance.keep_or_revert(profile, decs)?;
            }
        }
        self.deploy(profile)
    }

    /// **Deploy coordination** (§4.9): run every deployer in ascending
    /// priority order, writing per-mod byte totals back into the Mod
    /// records for deployers whose ids reference real mods.
    pub fn deploy(&mut self, profile: &str) -> Result<()> {
        let mut order: Vec<usize> = (0..self.deployers.len()).collect();
        order.sort_by_key(|&i| self.deployers[i].priority);

        for i in order {
            let references_real_mods = !self.deployers[i].instance.capabilities().ids_are_source_references;
            let totals = self.deployers[i].instance.deploy(profile)?;
            if references_real_mods {
                for (mod_id, bytes) in totals {
                    if let Some(m) = self.mods.get_mut(&mod_id) {
                        m.size_on_disk = bytes;
                    }
                }
            }
        }
        tracing::info!(profile, "deploy complete");
        Ok(())
    }

    pub fn undeploy_all(&mut self, profile: &str) -> Result<()> {
        for record in &mut self.deployers {
            record.instance.undeploy(profile)?;
        }
        Ok(())
    }

    pub fn add_deployer(&mut self, name: impl Into<String>, priority: i32, instance: DeployerInstance) {
        self.deployers.push(DeployerRecord::new(name, priority, instance));
    }

    pub fn mods(&self) -> impl Iterator<Item = &Mod> {
        self.mods.values()
    }

    pub fn mod_by_id(&self, id: u64) -> Option<&Mod> {
        self.mods.get(&id)
    }

    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn manual_tags(&self) -> &[ManualTag] {
        &self.manual_tags
    }

    pub fn auto_tags(&self) -> &[AutoTag] {
        &self.auto_tags
    }

    pub fn tags(&self) -> Vec<Tag> {
        let mut out: Vec<Tag> = self.manual_tags.iter().cloned().map(Tag::Manual).collect();
        out.extend(self.auto_tags.iter().cloned().map(Tag::Auto));
        out
    }

    /// **exportConfiguration** (§4.9): serialize deployer definitions and
    /// auto-tag definitions, rewriting Steam/home-relative paths under
    /// portable placeholders so the file can move between machines.
    pub fn export_configuration(&self, path: &Path) -> Result<()> {
        let deployers: Vec<ExportedDeployer> = self
            .deployers
            .iter()
            .map(|record| ExportedDeployer {
                kind: record.instance.kind().as_str().to_string(),
                name: record.name.clone(),
                source_path: portable_path(record.instance.source_path()),
                dest_path: portable_path(record.instance.target_path()),
                deploy_mode: record.instance.deploy_mode(),
            })
            .collect();

        let doc = ExportDoc { deployers, auto_tags: self.auto_tags.clone() };
        let data = serde_json::to_string_pretty(&doc).map_err(|e| CoreError::parse(path, "<root>", e))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CoreError::path_io("create_dir_all", parent, e))?;
        }
        fs::write(path, data).map_err(|e| CoreError::path_io("write", path, e))
    }
}

fn apply_manual_tag_action(tags: &mut Vec<ManualTag>, action: &ManualTagAction) -> Result<()> {
    match action {
        ManualTagAction::Add { tag, mod_id } => {
            match tags.iter_mut().find(|t| &t.name == tag) {
                Some(t) => {
                    t.mod_ids.insert(*mod_id);
                }
                None => tags.push(ManualTag { name: tag.clone(), mod_ids: HashSet::from([*mod_id]) }),
            }
        }
        ManualTagAction::Remove { tag, mod_id } => {
            let t = tags.iter_mut().find(|t| &t.name == tag).ok_or_else(|| CoreError::no_such("tag", tag.clone()))?;
            t.mod_ids.remove(mod_id);
        }
        ManualTagAction::Rename { old, new } => {
            let t = tags.iter_mut().find(|t| &t.name == old).ok_or_else(|| CoreError::no_such("tag", old.clone()))?;
            t.name = new.clone();
        }
    }
    Ok(())
}

fn apply_auto_tag_action(tags: &mut Vec<AutoTag>, action: &AutoTagAction) -> Result<()> {
    match action {
        AutoTagAction::Add { name, expression } => {
            if tags.iter().any(|t| &t.name == name) {
                return Err(CoreError::parse("cfg.json", "auto_tags[].name", format!("tag {name} already exists")));
            }
            tags.push(AutoTag { name: name.clone(), expression: expression.clone(), mod_ids: HashSet::new() });
        }
        AutoTagAction::Remove { name } => {
            tags.retain(|t| &t.name != name);
        }
        AutoTagAction::Rename { old, new } => {
            let t = tags.iter_mut().find(|t| &t.name == old).ok_or_else(|| CoreError::no_such("auto tag", old.clone()))?;
            t.name = new.clone();
        }
        AutoTagAction::ChangeEvaluator { name, expression } => {
            let t = tags.iter_mut().find(|t| &t.name == name).ok_or_else(|| CoreError::no_such("auto tag", name.clone()))?;
            t.expression = expression.clone();
        }
    }
    Ok(())
}

fn instantiate(doc: &DeployerDoc) -> Result<DeployerInstance> {
    let source = doc.source_path.clone();
    let target = doc.dest_path.clone();

    let mut instance = match doc.kind {
        DeployerKind::Generic => {
            let mut d = GenericDeployer::new(doc.name.clone(), source, target, doc.deploy_mode);
            d.enable_unsafe_sorting = doc.enable_unsafe_sorting;
            DeployerInstance::Generic(d)
        }
        DeployerKind::CaseMatching => {
            let mut inner = GenericDeployer::new(doc.name.clone(), source, target, doc.deploy_mode);
            inner.enable_unsafe_sorting = doc.enable_unsafe_sorting;
            DeployerInstance::CaseMatching(CaseMatchingDeployer::new(inner))
        }
        DeployerKind::Reverse => {
            let mut d = ReverseDeployer::new(doc.name.clone(), source, target, doc.deploy_mode);
            d.load_state()?;
            DeployerInstance::Reverse(d)
        }
        DeployerKind::PluginLoadOrder => DeployerInstance::PluginLoadOrder(LoadOrderPluginDeployer::new(
            doc.name.clone(),
            source,
            target,
            doc.masterlist_url.clone().unwrap_or_default(),
            doc.prelude_url.clone().unwrap_or_default(),
        )),
        DeployerKind::PluginArchiveList => {
            DeployerInstance::PluginArchiveList(ArchiveListPluginDeployer::new(doc.name.clone(), source, target))
        }
        DeployerKind::PluginConfigContent => {
            DeployerInstance::PluginConfigContent(ConfigContentPluginDeployer::new(doc.name.clone(), source, target))
        }
        DeployerKind::PluginModOrder => {
            DeployerInstance::PluginModOrder(ModOrderPluginDeployer::new(doc.name.clone(), source, target))
        }
    };

    if !instance.capabilities().is_autonomous {
        for profile in &doc.profiles {
            instance.set_profile(&profile.name)?;
            instance.set_loadorder(&profile.name, profile.loadorder.clone());
        }
    }

    Ok(instance)
}

#[derive(serde::Serialize)]
struct ExportedDeployer {
    kind: String,
    name: String,
    source_path: String,
    dest_path: String,
    deploy_mode: DeployMode,
}

#[derive(serde::Serialize)]
struct ExportDoc {
    deployers: Vec<ExportedDeployer>,
    auto_tags: Vec<AutoTag>,
}

/// Rewrite a Steam- or home-relative path as a portable placeholder
/// (§4.9 "exportConfiguration").
fn portable_path(path: &Path) -> String {
    let s = path.to_string_lossy().to_string();

    if let Some(idx) = s.find("/steamapps/common/") {
        let after = &s[idx + "/steamapps/common/".len()..];
        if let Some(slash) = after.find('/') {
            let app = &after[..slash];
            return format!("${{steamapps_common:{app}}}{}", &after[slash..]);
        }
        return format!("${{steamapps_common:{after}}}");
    }

    if let Some(idx) = s.find("/steamapps/compatdata/") {
        let after = &s[idx + "/steamapps/compatdata/".len()..];
        if let Some(id_end) = after.find("/pfx/") {
            let id = &after[..id_end];
            let rest = &after[id_end + "/pfx/".len()..];
            return format!("${{steamapps_compatdata:{id}}}/pfx/{rest}");
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() && s.starts_with(&home) {
            return format!("${{home}}{}", &s[home.len()..]);
        }
    }

    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::FixedClock;
    use tempfile::tempdir;

    fn request(source: PathBuf) -> InstallRequest {
        InstallRequest {
            source,
            name: "Test Mod".to_string(),
            version: "1.0".to_string(),
            options: InstallOptions::default(),
            manifest: Vec::new(),
            remote_source: None,
            remote_mod_id: None,
            remote_file_id: None,
            remote_type: None,
        }
    }

    fn fresh_controller(staging_root: &Path) -> StagingController {
        StagingController {
            paths: test_paths(staging_root),
            name: "Test Game".to_string(),
            command: "/usr/bin/game".to_string(),
            icon_path: None,
            steam_app_id: None,
            mods: HashMap::new(),
            profiles: vec![Profile::default()],
            active_profile: 0,
            groups: Vec::new(),
            deployers: Vec::new(),
            tools: Vec::new(),
            backups: BackupManager::new(),
            manual_tags: Vec::new(),
            auto_tags: Vec::new(),
        }
    }

    fn test_paths(staging_root: &Path) -> StagingPaths {
        StagingPaths::with_root("test-app", staging_root)
    }

    #[test]
    fn install_mod_allocates_smallest_free_id() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("archive_dir");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("file.txt"), b"hello").unwrap();

        let mut controller = fresh_controller(dir.path());
        let clock = FixedClock(chrono::Utc::now());
        let progress = ProgressNode::new_root();

        let id = controller
            .install_mod(request(source.clone()), &clock, &progress, &crate::collaborators::UnavailableRarExtractor)
            .unwrap();
        assert_eq!(id, 0);
        assert!(controller.mod_by_id(0).is_some());

        fs::remove_dir_all(controller.paths.mod_dir(0)).ok();
    }

    #[test]
    fn portable_path_rewrites_steam_common_prefix() {
        let p = Path::new("/home/user/.steam/steamapps/common/Skyrim/Data");
        assert_eq!(portable_path(p), "${steamapps_common:Skyrim}/Data");
    }

    #[test]
    fn create_group_folds_third_mod_into_existing_group() {
        let dir = tempdir().unwrap();
        let mut controller = fresh_controller(dir.path());
        controller.create_group(1, 2);
        let idx = controller.create_group(1, 3);
        assert_eq!(controller.groups()[idx].members.len(), 3);
    }

    #[test]
    fn edit_manual_tags_rolls_back_on_failure() {
        let dir = tempdir().unwrap();
        let mut controller = fresh_controller(dir.path());
        controller
            .edit_manual_tags(&[ManualTagAction::Add { tag: "Armor".to_string(), mod_id: 1 }])
            .unwrap();

        let result = controller.edit_manual_tags(&[
            ManualTagAction::Add { tag: "Weapons".to_string(), mod_id: 2 },
            ManualTagAction::Remove { tag: "DoesNotExist".to_string(), mod_id: 2 },
        ]);
        assert!(result.is_err());
        assert_eq!(controller.manual_tags().len(), 1);
    }

    #[test]
    fn save_reload_preserves_load_order_deployer_urls() {
        crate::test_support::init_tracing();
        let dir = tempdir().unwrap();
        let mut controller = fresh_controller(dir.path());
        let source = dir.path().join("plugins-src");
        let target = dir.path().join("plugins-target");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&target).unwrap();

        controller.add_deployer(
            "Plugins",
            0,
            DeployerInstance::PluginLoadOrder(LoadOrderPluginDeployer::new(
                "Plugins",
                source,
                target,
                "https://example.com/masterlist.yaml",
                "https://example.com/prelude.yaml",
            )),
        );

        controller.save().unwrap();
        let reloaded = StagingController::load(test_paths(dir.path()), "Test Game", "/usr/bin/game").unwrap();

        match &reloaded.deployers[0].instance {
            DeployerInstance::PluginLoadOrder(d) => {
                assert_eq!(d.masterlist_url(), "https://example.com/masterlist.yaml");
                assert_eq!(d.prelude_url(), "https://example.com/prelude.yaml");
            }
            _ => panic!("expected a load-order plugin deployer"),
        }
    }
}
