//! The deployed-files manifest (§6 `<target>/.lmmfiles`).
//!
//! `{ "files": [ {"path": <string>, "mod_id": <int>}, ... ] }`. The write
//! is the commit point of a deploy call (§5) and must be atomic:
//! write-to-tempfile, then rename.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub const MANIFEST_FILE_NAME: &str = ".lmmfiles";

#[derive(Debug, Default, Serialize, Deserialize)]
struct ManifestFile {
    files: Vec<ManifestFileEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestFileEntry {
    path: PathBuf,
    mod_id: u64,
}

/// Maps every relative path a deployer placed in its target to the
/// mod-id that produced it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeployedManifest {
    pub files: HashMap<PathBuf, u64>,
}

impl DeployedManifest {
    pub fn path_for(target: &Path) -> PathBuf {
        target.join(MANIFEST_FILE_NAME)
    }

    /// Read the manifest at `<target>/.lmmfiles`. A missing manifest is
    /// treated as empty -- no restoration is possible, but that's not an
    /// error (§7 "Recovered locally").
    pub fn read(target: &Path) -> Result<Self> {
        let path = Self::path_for(target);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path).map_err(|e| CoreError::path_io("read", &path, e))?;
        let parsed: ManifestFile = serde_json::from_str(&content)
            .map_err(|e| CoreError::parse(&path, "files", e))?;
        Ok(Self {
            files: parsed.files.into_iter().map(|e| (e.path, e.mod_id)).collect(),
        })
    }

    /// Write the manifest atomically: serialize to `.lmmfiles.tmp`, then
    /// rename over `.lmmfiles`.
    pub fn write(&self, target: &Path) -> Result<()> {
        let path = Self::path_for(target);
        let tmp = path.with_extension("lmmfiles.tmp");

        let mut entries: Vec<ManifestFileEntry> = self
            .files
            .iter()
            .map(|(path, mod_id)| ManifestFileEntry {
                path: path.clone(),
                mod_id: *mod_id,
            })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        let serialized = serde_json::to_string_pretty(&ManifestFile { files: entries })
            .map_err(|e| CoreError::parse(&path, "files", e))?;

        fs::write(&tmp, serialized).map_err(|e| CoreError::path_io("write", &tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| CoreError::path_io("rename", &tmp, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let mut manifest = DeployedManifest::default();
        manifest.files.insert(PathBuf::from("a.esp"), 0);
        manifest.files.insert(PathBuf::from("textures/b.dds"), 1);

        manifest.write(dir.path()).unwrap();
        let read_back = DeployedManifest::read(dir.path()).unwrap();
        assert_eq!(manifest, read_back);
    }

    #[test]
    fn missing_manifest_reads_as_empty() {
        let dir = tempdir().unwrap();
        let read_back = DeployedManifest::read(dir.path()).unwrap();
        assert!(read_back.files.is_empty());
    }
}
