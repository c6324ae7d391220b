//! The data model shared by the controller and every deployer (§3).

mod groups;
mod loadorder;
mod profile;
mod tags;

pub use groups::Group;
pub use loadorder::{ConflictGroup, LoadorderEntry};
pub use profile::Profile;
pub use tags::{AutoTag, AutoTagExpression, ManualTag, ModFacts, Tag};

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A durably-installed, numbered payload (§3 "Mod").
///
/// The identifier doubles as the relative-path component under which the
/// mod's payload lives (`staging/<id>/`), and as the deploy-priority tie
/// breaker is the loadorder position, not the id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mod {
    pub id: u64,
    pub name: String,
    pub version: String,
    pub install_time: chrono::DateTime<chrono::Utc>,
    pub remote_update_time: Option<chrono::DateTime<chrono::Utc>>,
    pub suppress_update_time: Option<chrono::DateTime<chrono::Utc>>,
    pub local_source: Option<PathBuf>,
    pub remote_source: Option<String>,
    pub remote_mod_id: Option<u64>,
    pub remote_file_id: Option<u64>,
    pub remote_type: Option<String>,
    pub size_on_disk: u64,
    pub installer: InstallerKind,
}

/// Which installer path produced a mod, persisted so a replace/reinstall
/// can pick the same path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallerKind {
    Simple,
    FileManifest,
}

impl Mod {
    /// The path component this mod occupies under the staging root.
    pub fn staging_dir_name(&self) -> String {
        self.id.to_string()
    }
}
