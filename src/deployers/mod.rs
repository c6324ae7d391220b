//! Deployers (§4.5-§4.8, §4.11).
//!
//! A deployer owns one `(source, target)` pair and a deploy mode. Rather
//! than a class hierarchy, each concrete deployer is a plain struct
//! implementing [`Deployer`]; what varies between them -- whether they
//! expose a loadorder, whether ids name real mods or are synthesized from
//! files already on disk, whether conflicts are meaningful -- is reported
//! through [`Capabilities`] instead of being encoded in the type system.
//! The staging-state controller dispatches against `&dyn Deployer` and
//! consults `capabilities()` before calling the methods that aren't
//! universally meaningful.

pub mod case_matching;
pub mod generic;
pub mod manifest;
pub mod plugin;
pub mod reverse;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{ConflictGroup, LoadorderEntry};

/// How a deployer places a mod's files into its target (§3 "Deployer").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployMode {
    HardLink,
    SymLink,
    Copy,
}

impl Default for DeployMode {
    fn default() -> Self {
        DeployMode::HardLink
    }
}

/// What a concrete deployer supports, so the controller can adapt its UI
/// and dispatch logic without knowing the concrete type (§4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Can sort its own loadorder from an external ordering signal
    /// (plugin deployers via [`crate::collaborators::SortingEngine`]).
    pub supports_sorting: bool,
    /// Exposes a loadorder the controller/UI can drag-reorder directly.
    pub supports_reordering: bool,
    /// Mods in its loadorder can conflict over shared destination paths.
    pub supports_mod_conflicts: bool,
    /// Individual files (not whole mods) are the conflict unit.
    pub supports_file_conflicts: bool,
    /// Deployed files can be enumerated and presented to the user.
    pub supports_file_browsing: bool,
    /// Its entries can be expanded into a sub-listing (e.g. files within
    /// a mod).
    pub supports_expandable_items: bool,
    /// Its loadorder ids reference files discovered in the target rather
    /// than mod-ids from the shared install (plugin deployers, the
    /// reverse deployer).
    pub ids_are_source_references: bool,
    /// Manages its own membership independently of `add_mod`/`remove_mod`
    /// calls from the controller (all plugin deployers, the reverse
    /// deployer).
    pub is_autonomous: bool,
}

impl Capabilities {
    /// The generic deployer and its case-matching wrapper: a plain
    /// mod-id loadorder with real conflicts.
    pub const GENERIC: Capabilities = Capabilities {
        supports_sorting: false,
        supports_reordering: true,
        supports_mod_conflicts: true,
        supports_file_conflicts: true,
        supports_file_browsing: true,
        supports_expandable_items: true,
        ids_are_source_references: false,
        is_autonomous: false,
    };

    /// Plugin deployers: autonomous, sortable, no mod-level conflicts.
    pub const PLUGIN: Capabilities = Capabilities {
        supports_sorting: true,
        supports_reordering: true,
        supports_mod_conflicts: false,
        supports_file_conflicts: false,
        supports_file_browsing: false,
        supports_expandable_items: false,
        ids_are_source_references: true,
        is_autonomous: true,
    };

    /// The reverse deployer: autonomous, no ordering, no conflicts.
    pub const REVERSE: Capabilities = Capabilities {
        supports_sorting: false,
        supports_reordering: false,
        supports_mod_conflicts: false,
        supports_file_conflicts: false,
        supports_file_browsing: true,
        supports_expandable_items: false,
        ids_are_source_references: true,
        is_autonomous: true,
    };
}

/// A path in the target whose current content no longer matches what the
/// owning deployer last deployed there (§4.5 "external changes",
/// SPEC_FULL `deploy_with_review`).
#[derive(Debug, Clone)]
pub struct ExternalChange {
    pub path: PathBuf,
    /// The mod-id that deployed this path, if the deployer's ids
    /// reference real mods.
    pub mod_id: Option<u64>,
}

/// A user decision on one [`ExternalChange`]: keep the externally-placed
/// content (detach it from the deployer's management) or revert it back
/// to the deployer's own copy.
#[derive(Debug, Clone)]
pub struct KeepOrRevertDecision {
    pub path: PathBuf,
    pub keep: bool,
}

/// A deployer-defined mutation outside the generic add/remove/reorder
/// surface (§9 "apply_mod_action"), e.g. the groundcover tag toggle on
/// [`plugin::config_content::ConfigContentPluginDeployer`]. `action_id`
/// is meaningful only to the deployer that defines it; `target` names
/// the item it applies to (a plugin filename, a mod-id as a string,
/// whatever that deployer's ids are).
#[derive(Debug, Clone, Copy)]
pub struct ModActionRequest<'a> {
    pub action_id: u32,
    pub target: &'a str,
}

/// The shared surface every concrete deployer implements.
///
/// Default bodies cover the methods that are meaningless for an
/// autonomous deployer (no loadorder mutation from the outside, no
/// mod-level conflicts) so those deployers only need to override what
/// actually applies to them.
pub trait Deployer {
    fn name(&self) -> &str;
    fn capabilities(&self) -> Capabilities;
    fn source_path(&self) -> &Path;
    fn target_path(&self) -> &Path;

    /// Place every enabled mod's files into the target for `profile`,
    /// later entries overriding earlier ones on path collision. Returns
    /// the number of bytes deployed per mod-id, for progress/reporting.
    fn deploy(&mut self, profile: &str) -> Result<HashMap<u64, u64>>;

    /// Remove every file this deployer placed for `profile`, deleting
    /// directories left empty behind them.
    fn undeploy(&mut self, profile: &str) -> Result<()>;

    /// Compare the manifest of what this deployer last deployed against
    /// what's actually on disk; report every divergent path.
    fn external_changes(&self, profile: &str) -> Result<Vec<ExternalChange>>;

    /// Apply keep/revert decisions gathered from [`Deployer::external_changes`].
    fn keep_or_revert(&mut self, profile: &str, decisions: &[KeepOrRevertDecision]) -> Result<()>;

    /// Switch this deployer's active profile, loading or creating
    /// whatever per-profile state it keeps.
    fn set_profile(&mut self, profile: &str) -> Result<()>;

    /// The deploy-priority loadorder for `profile`. Empty for deployers
    /// that don't support reordering.
    fn loadorder(&self, _profile: &str) -> Vec<LoadorderEntry> {
        Vec::new()
    }

    /// Replace the loadorder for `profile` wholesale (drag-reorder from
    /// a UI). Ignored, with a debug log, by autonomous deployers: their
    /// membership and order come from their own scan, not from the
    /// controller.
    fn set_loadorder(&mut self, _profile: &str, _order: Vec<LoadorderEntry>) {
        tracing::debug!(deployer = self.name(), "ignoring loadorder mutation on autonomous deployer");
    }

    /// Add a mod to this deployer's loadorder (enabled, at the end).
    /// Ignored by autonomous deployers.
    fn add_mod(&mut self, _profile: &str, _mod_id: u64) {
        tracing::debug!(deployer = self.name(), "ignoring add_mod on autonomous deployer");
    }

    /// Remove a mod from this deployer's loadorder. Ignored by
    /// autonomous deployers.
    fn remove_mod(&mut self, _profile: &str, _mod_id: u64) {
        tracing::debug!(deployer = self.name(), "ignoring remove_mod on autonomous deployer");
    }

    /// Partition the current loadorder into conflict-groups. Empty for
    /// deployers that don't support mod-level conflicts.
    fn conflict_groups(&self, _profile: &str) -> Vec<ConflictGroup> {
        Vec::new()
    }

    /// Reorder so that within each conflict group, members sort by
    /// current position (stable); a no-op for deployers without
    /// mod-level conflicts.
    fn sort_by_conflicts(&mut self, _profile: &str) -> Result<()> {
        Ok(())
    }

    /// Re-deploy just the files belonging to one mod, without touching
    /// the rest of the target (used after an in-place mod update).
    fn update_deployed_for_mod(&mut self, profile: &str, _mod_id: u64) -> Result<()> {
        self.deploy(profile).map(|_| ())
    }

    /// Apply a deployer-specific mutation named by `request.action_id`
    /// (§9). Deployers that define no actions of their own ignore this
    /// with a debug log.
    fn apply_mod_action(&mut self, _profile: &str, request: ModActionRequest<'_>) -> Result<()> {
        tracing::debug!(deployer = self.name(), action = request.action_id, "deployer defines no mod actions");
        Ok(())
    }
}
