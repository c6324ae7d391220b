//! XDG-compliant path management for the staging-state controller.
//!
//! Mirrors the per-application directory layout the rest of the crate
//! assumes: a data-side staging root holding `<cfg>.json` and every mod's
//! payload, plus a cache directory for plugin-sorting masterlists.

use std::path::PathBuf;

use directories::ProjectDirs;

/// Resolves every on-disk location the controller needs, rooted under
/// the OS-appropriate XDG (or equivalent) base directories for one named
/// application instance (one game, in the common case).
#[derive(Debug, Clone)]
pub struct StagingPaths {
    app_id: String,
    roots: Roots,
}

#[derive(Debug, Clone)]
enum Roots {
    ProjectDirs(ProjectDirs),
    Explicit { data_dir: PathBuf, cache_dir: PathBuf },
}

impl StagingPaths {
    /// `app_id` distinguishes multiple managed applications sharing the
    /// same qualifier/organization (`directories` requires all three
    /// components but this crate only uses the application name).
    pub fn new(app_id: impl Into<String>) -> Self {
        let dirs = ProjectDirs::from("", "", "stagehand").expect("failed to determine project directories");
        Self { app_id: app_id.into(), roots: Roots::ProjectDirs(dirs) }
    }

    /// Pin the data and cache roots to an explicit directory instead of
    /// resolving OS project dirs, so tests and multi-instance setups can
    /// point a controller at a throwaway tree.
    pub fn with_root(app_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            app_id: app_id.into(),
            roots: Roots::Explicit { data_dir: root.join("data"), cache_dir: root.join("cache") },
        }
    }

    fn data_dir(&self) -> &std::path::Path {
        match &self.roots {
            Roots::ProjectDirs(dirs) => dirs.data_dir(),
            Roots::Explicit { data_dir, .. } => data_dir,
        }
    }

    fn cache_root(&self) -> &std::path::Path {
        match &self.roots {
            Roots::ProjectDirs(dirs) => dirs.cache_dir(),
            Roots::Explicit { cache_dir, .. } => cache_dir,
        }
    }

    /// Data root for this application: `<data_dir>/staging/<app_id>/`.
    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir().join("staging").join(&self.app_id)
    }

    /// The controller's persisted settings file.
    pub fn settings_file(&self) -> PathBuf {
        self.staging_dir().join("cfg.json")
    }

    /// The settings backup: refreshed with the settings file's content
    /// after every successful read, and again just before every write
    /// (so it always holds the last known-good document, never the one
    /// currently being replaced).
    pub fn settings_backup_file(&self) -> PathBuf {
        self.staging_dir().join(".cfg.json.bak")
    }

    /// Per-mod payload directory under the staging root.
    pub fn mod_dir(&self, mod_id: u64) -> PathBuf {
        self.staging_dir().join(mod_id.to_string())
    }

    /// Cache root for downloaded masterlists/preludes.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_root().join(&self.app_id)
    }

    /// Exported configuration bundles land alongside the settings file.
    pub fn export_file(&self, name: &str) -> PathBuf {
        self.staging_dir().join(format!("{name}.export.json"))
    }

    /// Create every directory this instance will write into.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.staging_dir())?;
        std::fs::create_dir_all(self.cache_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn mod_dir_nests_under_staging_dir() {
        let paths = StagingPaths::new("skyrim");
        assert_eq!(paths.mod_dir(7), paths.staging_dir().join("7"));
    }

    #[test]
    fn with_root_pins_staging_dir_under_explicit_root() {
        let paths = StagingPaths::with_root("skyrim", "/tmp/stagehand-test-root");
        assert_eq!(
            paths.staging_dir(),
            Path::new("/tmp/stagehand-test-root/data/staging/skyrim")
        );
        assert_eq!(
            paths.cache_dir(),
            Path::new("/tmp/stagehand-test-root/cache/skyrim")
        );
    }
}
