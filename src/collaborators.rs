//! External collaborators (§1 out-of-scope, SPEC_FULL "Supplemented from
//! original source").
//!
//! The GUI, archive-parsing libraries, plugin-sorting engines, the HTTP
//! client, and credential/token encryption are treated as external
//! collaborators described only by their interface to the core. These
//! traits are that interface; a consuming application supplies real
//! implementations, tests supply fakes or [`mockall`] mocks.

use chrono::{DateTime, Utc};

use crate::error::Result;

/// One plugin as seen by an external sorting engine: its filename and the
/// master/requirement names parsed from its header (out of scope here --
/// parsing plugin headers is an archive-format concern outside the core).
#[derive(Debug, Clone)]
pub struct PluginRecord {
    pub name: String,
    pub masters: Vec<String>,
}

/// An external collaborator (e.g. a LOOT-style sorting library) that
/// computes a total order for a set of plugins. The load-order plugin
/// deployer calls this after refreshing its masterlist.
#[cfg_attr(test, mockall::automock)]
pub trait SortingEngine {
    fn sort(&self, plugins: &[PluginRecord]) -> Result<Vec<String>>;
}

/// Preserves scan order -- used when no real sorting engine is wired in.
pub struct NoopSortingEngine;

impl SortingEngine for NoopSortingEngine {
    fn sort(&self, plugins: &[PluginRecord]) -> Result<Vec<String>> {
        Ok(plugins.iter().map(|p| p.name.clone()).collect())
    }
}

/// The out-of-scope HTTP client that downloads masterlists, preludes, and
/// mod archives.
#[cfg_attr(test, mockall::automock)]
pub trait UrlFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// The out-of-scope RAR decoder (§1 "external archive-parsing libraries").
/// The general extractor falls back to this when a `.rar`-extension
/// archive fails to open as zip/7z; the core never bundles a decoder of
/// its own, only this boundary.
#[cfg_attr(test, mockall::automock)]
pub trait RarExtractor {
    fn extract(&self, archive: &std::path::Path, dest: &std::path::Path) -> Result<()>;
}

/// No RAR decoder wired in: every `.rar` fallback fails with an
/// "extraction failed" error naming the archive. A consuming application
/// that needs real RAR support supplies its own [`RarExtractor`] (e.g.
/// shelling out to `unrar`, or a vendored decoder).
pub struct UnavailableRarExtractor;

impl RarExtractor for UnavailableRarExtractor {
    fn extract(&self, archive: &std::path::Path, _dest: &std::path::Path) -> Result<()> {
        Err(crate::error::CoreError::archive(
            "extraction failed",
            archive,
            "no RAR extractor configured",
        ))
    }
}

/// An injected clock, so masterlist/prelude staleness (§4.7: "older than
/// an hour") can be tested deterministically instead of racing
/// `SystemTime::now()`.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub struct FixedClock(pub DateTime<Utc>);

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
