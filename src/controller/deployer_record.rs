//! The controller's deployer record (§3 "Deployer").
//!
//! Rather than storing `Box<dyn Deployer>` and losing the concrete type
//! needed to reconstruct a [`super::settings::DeployerDoc`] on save, the
//! controller keeps one closed enum over the seven concrete deployers
//! and implements [`Deployer`] on the enum itself by delegation. No
//! virtual dispatch beyond the trait call itself (§9 design note).

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::deployers::case_matching::CaseMatchingDeployer;
use crate::deployers::generic::GenericDeployer;
use crate::deployers::plugin::archive_list::ArchiveListPluginDeployer;
use crate::deployers::plugin::config_content::ConfigContentPluginDeployer;
use crate::deployers::plugin::loadorder::LoadOrderPluginDeployer;
use crate::deployers::plugin::mod_order::ModOrderPluginDeployer;
use crate::deployers::reverse::ReverseDeployer;
use crate::deployers::{Capabilities, Deployer, DeployMode, ExternalChange, KeepOrRevertDecision, ModActionRequest};
use crate::error::{CoreError, Result};
use crate::model::{ConflictGroup, LoadorderEntry};

/// The persisted type tag for a deployer record (§6 `deployers[].type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployerKind {
    Generic,
    CaseMatching,
    Reverse,
    PluginLoadOrder,
    PluginArchiveList,
    PluginConfigContent,
    PluginModOrder,
}

impl DeployerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployerKind::Generic => "generic",
            DeployerKind::CaseMatching => "case_matching",
            DeployerKind::Reverse => "reverse",
            DeployerKind::PluginLoadOrder => "plugin_load_order",
            DeployerKind::PluginArchiveList => "plugin_archive_list",
            DeployerKind::PluginConfigContent => "plugin_config_content",
            DeployerKind::PluginModOrder => "plugin_mod_order",
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "generic" => Ok(DeployerKind::Generic),
            "case_matching" => Ok(DeployerKind::CaseMatching),
            "reverse" => Ok(DeployerKind::Reverse),
            "plugin_load_order" => Ok(DeployerKind::PluginLoadOrder),
            "plugin_archive_list" => Ok(DeployerKind::PluginArchiveList),
            "plugin_config_content" => Ok(DeployerKind::PluginConfigContent),
            "plugin_mod_order" => Ok(DeployerKind::PluginModOrder),
            other => Err(CoreError::UnknownType { kind: "deployer", name: other.to_string() }),
        }
    }
}

/// One concrete deployer, tagged by kind, dispatched through [`Deployer`].
pub enum DeployerInstance {
    Generic(GenericDeployer),
    CaseMatching(CaseMatchingDeployer),
    Reverse(ReverseDeployer),
    PluginLoadOrder(LoadOrderPluginDeployer),
    PluginArchiveList(ArchiveListPluginDeployer),
    PluginConfigContent(ConfigContentPluginDeployer),
    PluginModOrder(ModOrderPluginDeployer),
}

macro_rules! dispatch {
    ($self:ident, $method:ident $(, $arg:expr)*) => {
        match $self {
            DeployerInstance::Generic(d) => d.$method($($arg),*),
            DeployerInstance::CaseMatching(d) => d.$method($($arg),*),
            DeployerInstance::Reverse(d) => d.$method($($arg),*),
            DeployerInstance::PluginLoadOrder(d) => d.$method($($arg),*),
            DeployerInstance::PluginArchiveList(d) => d.$method($($arg),*),
            DeployerInstance::PluginConfigContent(d) => d.$method($($arg),*),
            DeployerInstance::PluginModOrder(d) => d.$method($($arg),*),
        }
    };
}

impl DeployerInstance {
    pub fn kind(&self) -> DeployerKind {
        match self {
            DeployerInstance::Generic(_) => DeployerKind::Generic,
            DeployerInstance::CaseMatching(_) => DeployerKind::CaseMatching,
            DeployerInstance::Reverse(_) => DeployerKind::Reverse,
            DeployerInstance::PluginLoadOrder(_) => DeployerKind::PluginLoadOrder,
            DeployerInstance::PluginArchiveList(_) => DeployerKind::PluginArchiveList,
            DeployerInstance::PluginConfigContent(_) => DeployerKind::PluginConfigContent,
            DeployerInstance::PluginModOrder(_) => DeployerKind::PluginModOrder,
        }
    }

    /// The deploy mode this instance was configured with, where
    /// meaningful (every non-autonomous/plugin deployer links files;
    /// plugin deployers rewrite a text file and have no mode of their
    /// own, so they report `HardLink` as a persistence placeholder).
    pub fn deploy_mode(&self) -> DeployMode {
        match self {
            DeployerInstance::Generic(d) => d.mode(),
            DeployerInstance::CaseMatching(d) => d.inner().mode(),
            DeployerInstance::Reverse(d) => d.mode(),
            _ => DeployMode::HardLink,
        }
    }
}

impl Deployer for DeployerInstance {
    fn name(&self) -> &str {
        dispatch!(self, name)
    }

    fn capabilities(&self) -> Capabilities {
        dispatch!(self, capabilities)
    }

    fn source_path(&self) -> &Path {
        dispatch!(self, source_path)
    }

    fn target_path(&self) -> &Path {
        dispatch!(self, target_path)
    }

    fn deploy(&mut self, profile: &str) -> Result<HashMap<u64, u64>> {
        dispatch!(self, deploy, profile)
    }

    fn undeploy(&mut self, profile: &str) -> Result<()> {
        dispatch!(self, undeploy, profile)
    }

    fn external_changes(&self, profile: &str) -> Result<Vec<ExternalChange>> {
        dispatch!(self, external_changes, profile)
    }

    fn keep_or_revert(&mut self, profile: &str, decisions: &[KeepOrRevertDecision]) -> Result<()> {
        dispatch!(self, keep_or_revert, profile, decisions)
    }

    fn set_profile(&mut self, profile: &str) -> Result<()> {
        dispatch!(self, set_profile, profile)
    }

    fn loadorder(&self, profile: &str) -> Vec<LoadorderEntry> {
        dispatch!(self, loadorder, profile)
    }

    fn set_loadorder(&mut self, profile: &str, order: Vec<LoadorderEntry>) {
        dispatch!(self, set_loadorder, profile, order)
    }

    fn add_mod(&mut self, profile: &str, mod_id: u64) {
        dispatch!(self, add_mod, profile, mod_id)
    }

    fn remove_mod(&mut self, profile: &str, mod_id: u64) {
        dispatch!(self, remove_mod, profile, mod_id)
    }

    fn conflict_groups(&self, profile: &str) -> Vec<ConflictGroup> {
        dispatch!(self, conflict_groups, profile)
    }

    fn sort_by_conflicts(&mut self, profile: &str) -> Result<()> {
        dispatch!(self, sort_by_conflicts, profile)
    }

    fn update_deployed_for_mod(&mut self, profile: &str, mod_id: u64) -> Result<()> {
        dispatch!(self, update_deployed_for_mod, profile, mod_id)
    }

    fn apply_mod_action(&mut self, profile: &str, request: ModActionRequest<'_>) -> Result<()> {
        dispatch!(self, apply_mod_action, profile, request)
    }
}

/// A deployer together with controller-level bookkeeping: its declared
/// name and dispatch priority (lower runs first in deploy coordination).
pub struct DeployerRecord {
    pub name: String,
    pub priority: i32,
    pub instance: DeployerInstance,
}

impl DeployerRecord {
    pub fn new(name: impl Into<String>, priority: i32, instance: DeployerInstance) -> Self {
        Self { name: name.into(), priority, instance }
    }
}
