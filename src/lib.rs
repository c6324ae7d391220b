//! Stagehand - the staging-based core of a mod manager for games and
//! similar applications.
//!
//! This crate installs mods into a managed staging area, composes them on
//! demand into a target directory (the game install or config directory)
//! through a configurable deployer, and maintains the invariants needed to
//! undo any composition non-destructively. It is a library: a GUI, a CLI
//! shell, the HTTP client that downloads archives, and the platform IPC
//! receiver that accepts protocol-handler URLs are external collaborators
//! described only by the traits in [`collaborators`].

pub mod archive;
pub mod backup;
pub mod collaborators;
pub mod config;
pub mod controller;
pub mod deployers;
pub mod error;
pub mod installer;
pub mod model;
pub mod path_utils;
pub mod progress;

#[cfg(test)]
pub(crate) mod test_support;

pub use collaborators::{Clock, RarExtractor, SortingEngine, UrlFetcher};
pub use config::StagingPaths;
pub use controller::StagingController;
pub use error::{CoreError, Result};
pub use model::{AutoTag, Group, InstallerKind, ManualTag, Mod, ModFacts, Profile, Tag};
pub use progress::ProgressNode;
