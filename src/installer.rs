//! Mod installer (§4.4).
//!
//! Extracts a source archive or directory into a fresh temporary sibling
//! of the destination, applies case/flatten options (simple installer) or
//! replays an ordered file manifest (fomod-style installer), then commits
//! into the destination mod directory.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::archive;
use crate::collaborators::RarExtractor;
use crate::error::{CoreError, Result};
use crate::path_utils;
use crate::progress::ProgressNode;

/// Case-handling option (mutually exclusive group 1 in §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaseOption {
    #[default]
    Preserve,
    Lower,
    Upper,
}

/// Directory-flattening option (mutually exclusive group 2 in §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectoryOption {
    #[default]
    Preserve,
    Flatten,
}

/// Flags accepted by the simple installer path.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    pub case: CaseOption,
    pub directories: DirectoryOption,
    pub root_level: usize,
}

/// One entry of a file-manifest install: a source path inside the
/// extracted archive and its destination path relative to the mod
/// directory.
#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub source: PathBuf,
    pub destination: PathBuf,
}

/// What kind of installer a freshly extracted archive needs, and at what
/// root level its fomod marker (if any) was found.
#[derive(Debug, Clone)]
pub enum InstallerType {
    Simple,
    FileManifest { root_level: usize, head: PathBuf },
}

/// Scan extracted archive contents for `fomod/ModuleConfig.xml` at
/// increasing root levels. The first match determines the installer
/// type; absent any match, installation is `Simple`.
pub fn detect_installer_type(extracted_root: &Path) -> InstallerType {
    let mut current = extracted_root.to_path_buf();
    let mut level = 0;

    loop {
        if current.join("fomod").join("ModuleConfig.xml").is_file() {
            return InstallerType::FileManifest {
                root_level: level,
                head: current,
            };
        }

        // descend one level only if there is exactly one subdirectory and
        // no sibling files -- a single wrapping folder.
        let mut entries = match fs::read_dir(&current) {
            Ok(e) => e.filter_map(|e| e.ok()).collect::<Vec<_>>(),
            Err(_) => return InstallerType::Simple,
        };
        let dirs: Vec<_> = entries
            .drain(..)
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .collect();
        if dirs.len() != 1 {
            return InstallerType::Simple;
        }
        current = dirs.into_iter().next().unwrap().path();
        level += 1;
        if level > 8 {
            return InstallerType::Simple;
        }
    }
}

/// Pick a fresh sibling temporary directory under `destination`'s parent,
/// named `lmm_tmp_extract<k>`.
fn fresh_temp_dir(destination: &Path) -> Result<PathBuf> {
    let parent = destination
        .parent()
        .ok_or_else(|| CoreError::path_io("parent", destination, "destination has no parent"))?;
    fs::create_dir_all(parent).map_err(|e| CoreError::path_io("create_dir_all", parent, e))?;

    for k in 0.. {
        let candidate = parent.join(format!("lmm_tmp_extract{k}"));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    unreachable!()
}

/// Run the simple installer path: extract, optionally recase and
/// flatten, optionally strip a fixed number of root components, then
/// commit into `destination`. Returns the total byte size of the
/// installed subtree.
pub fn install_simple(
    source: &Path,
    destination: &Path,
    options: InstallOptions,
    progress: &ProgressNode,
    rar: &dyn RarExtractor,
) -> Result<u64> {
    let temp = fresh_temp_dir(destination)?;
    if let Err(e) = archive::extract(source, &temp, progress, rar) {
        fs::remove_dir_all(&temp).ok();
        return Err(e);
    }

    if let Err(e) = apply_simple_options(&temp, options) {
        fs::remove_dir_all(&temp).ok();
        return Err(e);
    }

    if let Err(e) = path_utils::rename_or_copy(&temp, destination) {
        fs::remove_dir_all(&temp).ok();
        fs::remove_dir_all(destination).ok();
        return Err(e);
    }

    directory_size(destination)
}

fn apply_simple_options(root: &Path, options: InstallOptions) -> Result<()> {
    match options.case {
        CaseOption::Preserve => {}
        CaseOption::Lower => recase_subtree(root, |s| s.to_lowercase())?,
        CaseOption::Upper => recase_subtree(root, |s| s.to_uppercase())?,
    }

    if options.directories == DirectoryOption::Flatten {
        flatten(root)?;
    }

    if options.root_level > 0 {
        let staging = root.with_extension("lmm_move_tmp");
        fs::rename(root, &staging).map_err(|e| CoreError::path_io("rename", root, e))?;
        fs::create_dir_all(root).map_err(|e| CoreError::path_io("create_dir_all", root, e))?;
        let result = path_utils::move_to_depth(&staging, root, options.root_level);
        fs::remove_dir_all(&staging).ok();
        result?;
    }

    Ok(())
}

fn recase_subtree(root: &Path, transform: impl Fn(&str) -> String) -> Result<()> {
    let mut renames = Vec::new();
    for entry in WalkDir::new(root)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.path() == root {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let transformed = transform(&name);
        if transformed != name {
            renames.push((entry.path().to_path_buf(), entry.path().with_file_name(transformed)));
        }
    }
    for (from, to) in renames {
        if from.exists() {
            fs::rename(&from, &to).map_err(|e| CoreError::path_io("rename", &from, e))?;
        }
    }
    Ok(())
}

/// Pull every regular file to `root`, then delete all sub-directories.
fn flatten(root: &Path) -> Result<()> {
    let mut moves = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            let name = entry.file_name().to_string_lossy().to_string();
            moves.push((entry.path().to_path_buf(), root.join(name)));
        }
    }
    for (from, to) in moves {
        if from != to {
            path_utils::rename_or_copy(&from, &to)?;
        }
    }

    let mut dirs: Vec<PathBuf> = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.path().to_path_buf())
        .collect();
    dirs.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    for dir in dirs {
        fs::remove_dir_all(&dir).ok();
    }
    Ok(())
}

/// Run the file-manifest installer path, given an already-extracted temp
/// directory `head` (the directory above the manifest's relative source
/// paths) and an ordered list of `(src, dst)` pairs.
///
/// Sources are moved rather than copied when an entry doesn't appear as a
/// path prefix of any later entry's source -- i.e. nothing still needs it.
pub fn install_file_manifest(
    head: &Path,
    destination: &Path,
    manifest: &[ManifestEntry],
) -> Result<u64> {
    for (i, entry) in manifest.iter().enumerate() {
        let src = head.join(&entry.source);
        if !src.exists() {
            fs::remove_dir_all(destination).ok();
            return Err(CoreError::path_io(
                "stat",
                &src,
                "file-manifest source entry missing from archive",
            ));
        }

        let dst = destination.join(&entry.destination);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| CoreError::path_io("create_dir_all", parent, e))?;
        }

        let reused_later = manifest[i + 1..]
            .iter()
            .any(|later| head.join(&later.source).starts_with(&src));

        if src.is_dir() {
            path_utils::move_files_to_directory(&src, &dst)?;
        } else {
            if dst.is_file() {
                fs::remove_file(&dst).map_err(|e| CoreError::path_io("remove_file", &dst, e))?;
            }
            if reused_later {
                fs::copy(&src, &dst).map_err(|e| CoreError::path_io("copy", &src, e))?;
            } else {
                path_utils::rename_or_copy(&src, &dst)?;
            }
        }
    }

    directory_size(destination)
}

/// Run extraction then dispatch to the simple or file-manifest path
/// according to [`detect_installer_type`].
///
/// For a file-manifest install, the archive is re-scanned after
/// extraction so that manifest source paths are resolved relative to the
/// fomod marker's actual root level rather than the raw extraction root
/// -- a fomod archive commonly ships wrapped in one extra folder.
pub fn install(
    source: &Path,
    destination: &Path,
    options: InstallOptions,
    manifest: &[ManifestEntry],
    progress: &ProgressNode,
    rar: &dyn RarExtractor,
) -> Result<u64> {
    if !manifest.is_empty() {
        let temp = fresh_temp_dir(destination)?;
        if let Err(e) = archive::extract(source, &temp, progress, rar) {
            fs::remove_dir_all(&temp).ok();
            return Err(e);
        }
        let head = match detect_installer_type(&temp) {
            InstallerType::FileManifest { head, .. } => head,
            InstallerType::Simple => temp.clone(),
        };
        let result = install_file_manifest(&head, destination, manifest);
        fs::remove_dir_all(&temp).ok();
        result
    } else {
        install_simple(source, destination, options, progress, rar)
    }
}

fn directory_size(root: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            total += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok(total)
}

/// Remove any leftover temporary directories from a prior failed install:
/// `tmp_replace_*`, `*.lmm_move_tmp`, and `lmm_tmp_extract<k>` siblings of
/// `destination_parent`. If `failed_mod_dir` is given, its staging
/// subtree is removed too.
pub fn cleanup_temp_dirs(destination_parent: &Path, failed_mod_dir: Option<&Path>) {
    if let Ok(entries) = fs::read_dir(destination_parent) {
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("tmp_replace_")
                || name.starts_with("lmm_tmp_extract")
                || name.ends_with("lmm_move_tmp")
            {
                fs::remove_dir_all(entry.path()).ok();
            }
        }
    }
    if let Some(dir) = failed_mod_dir {
        fs::remove_dir_all(dir).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn detect_installer_type_finds_fomod_marker() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("fomod")).unwrap();
        fs::write(dir.path().join("fomod/ModuleConfig.xml"), b"<config/>").unwrap();

        match detect_installer_type(dir.path()) {
            InstallerType::FileManifest { root_level, .. } => assert_eq!(root_level, 0),
            InstallerType::Simple => panic!("expected file-manifest"),
        }
    }

    #[test]
    fn detect_installer_type_descends_single_wrapping_folder() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("ModName/fomod")).unwrap();
        fs::write(dir.path().join("ModName/fomod/ModuleConfig.xml"), b"<config/>").unwrap();

        match detect_installer_type(dir.path()) {
            InstallerType::FileManifest { root_level, .. } => assert_eq!(root_level, 1),
            InstallerType::Simple => panic!("expected file-manifest"),
        }
    }

    #[test]
    fn detect_installer_type_defaults_to_simple() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("readme.txt"), b"hi").unwrap();
        assert!(matches!(detect_installer_type(dir.path()), InstallerType::Simple));
    }

    #[test]
    fn install_simple_extracts_directory_source() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        let dest = dir.path().join("staging/0");
        fs::create_dir_all(source.join("Meshes")).unwrap();
        fs::write(source.join("Meshes/Thing.NIF"), b"x").unwrap();

        let progress = ProgressNode::new_root();
        let size = install_simple(
            &source,
            &dest,
            InstallOptions {
                case: CaseOption::Lower,
                directories: DirectoryOption::Preserve,
                root_level: 0,
            },
            &progress,
            &crate::collaborators::UnavailableRarExtractor,
        )
        .unwrap();

        assert!(size > 0);
        assert!(dest.join("meshes/thing.nif").exists());
    }

    #[test]
    fn install_file_manifest_moves_and_copies() {
        let dir = tempdir().unwrap();
        let head = dir.path().join("head");
        let dest = dir.path().join("dest");
        fs::create_dir_all(head.join("00 core")).unwrap();
        fs::write(head.join("00 core/a.esp"), b"x").unwrap();

        let manifest = vec![ManifestEntry {
            source: PathBuf::from("00 core/a.esp"),
            destination: PathBuf::from("a.esp"),
        }];

        install_file_manifest(&head, &dest, &manifest).unwrap();
        assert!(dest.join("a.esp").exists());
    }

    #[test]
    fn install_file_manifest_aborts_on_missing_source() {
        let dir = tempdir().unwrap();
        let head = dir.path().join("head");
        let dest = dir.path().join("dest");
        fs::create_dir_all(&head).unwrap();

        let manifest = vec![ManifestEntry {
            source: PathBuf::from("missing.esp"),
            destination: PathBuf::from("a.esp"),
        }];

        let result = install_file_manifest(&head, &dest, &manifest);
        assert!(result.is_err());
        assert!(!dest.exists());
    }

    #[test]
    fn install_resolves_manifest_paths_through_a_wrapping_fomod_folder() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        let dest = dir.path().join("staging/0");
        fs::create_dir_all(source.join("ModName/fomod")).unwrap();
        fs::write(source.join("ModName/fomod/ModuleConfig.xml"), b"<config/>").unwrap();
        fs::create_dir_all(source.join("ModName/00 core")).unwrap();
        fs::write(source.join("ModName/00 core/a.esp"), b"plugin").unwrap();

        let manifest = vec![ManifestEntry {
            source: PathBuf::from("00 core/a.esp"),
            destination: PathBuf::from("a.esp"),
        }];

        let progress = ProgressNode::new_root();
        install(
            &source,
            &dest,
            InstallOptions::default(),
            &manifest,
            &progress,
            &crate::collaborators::UnavailableRarExtractor,
        )
        .unwrap();

        assert_eq!(fs::read(dest.join("a.esp")).unwrap(), b"plugin");
    }
}
