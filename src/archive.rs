//! Archive extraction (§4.3).
//!
//! Streams a regular file or directory source into a destination tree,
//! reporting progress in bytes. RAR support is an external collaborator
//! (§1: "external archive-parsing libraries") reached through
//! [`crate::collaborators::RarExtractor`], attempted when the general
//! extractor fails on a `.rar` extension and the destination is cleaned
//! first. After extraction, permissions are normalized: `644` files,
//! `755` directories.

use std::fs;
use std::io;
use std::path::Path;

use walkdir::WalkDir;

use crate::collaborators::RarExtractor;
use crate::error::{CoreError, Result};
use crate::progress::ProgressNode;

/// Extract (or copy) `source` into `dest`.
///
/// - If `source` is a directory, it is recursively copied/moved into
///   `dest`.
/// - If `source` is an archive, it is streamed in two passes: one to sum
///   entry sizes for progress, one to write entries.
/// - `rar` is consulted only when a `.rar`-extension source fails the
///   general extractor; the destination is cleaned first.
pub fn extract(source: &Path, dest: &Path, progress: &ProgressNode, rar: &dyn RarExtractor) -> Result<()> {
    fs::create_dir_all(dest).map_err(|e| CoreError::path_io("create_dir_all", dest, e))?;

    if source.is_dir() {
        copy_directory(source, dest, progress)?;
        normalize_permissions(dest);
        return Ok(());
    }

    let result = match extension_lower(source).as_deref() {
        Some("zip") => extract_zip(source, dest, progress),
        Some("7z") => extract_7z(source, dest, progress),
        Some("rar") => extract_zip(source, dest, progress).or_else(|_| {
            clean_destination(dest)?;
            rar.extract(source, dest)
        }),
        _ => extract_zip(source, dest, progress).or_else(|_| extract_7z(source, dest, progress)),
    };

    result?;
    normalize_permissions(dest);
    Ok(())
}

fn extension_lower(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_lowercase())
}

fn clean_destination(dest: &Path) -> Result<()> {
    if dest.exists() {
        fs::remove_dir_all(dest).map_err(|e| CoreError::path_io("remove_dir_all", dest, e))?;
    }
    fs::create_dir_all(dest).map_err(|e| CoreError::path_io("create_dir_all", dest, e))?;
    Ok(())
}

fn copy_directory(source: &Path, dest: &Path, progress: &ProgressNode) -> Result<()> {
    let entries: Vec<_> = WalkDir::new(source).into_iter().filter_map(|e| e.ok()).collect();
    let total: u64 = entries
        .iter()
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum();
    progress.set_total(total.max(1));

    for entry in entries {
        let rel = entry
            .path()
            .strip_prefix(source)
            .expect("walkdir entries are rooted at `source`");
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| CoreError::path_io("create_dir_all", &target, e))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| CoreError::path_io("create_dir_all", parent, e))?;
            }
            let size = fs::copy(entry.path(), &target)
                .map_err(|e| CoreError::path_io("copy", entry.path(), e))?;
            progress.advance(size);
        }
    }
    Ok(())
}

fn extract_zip(archive: &Path, dest: &Path, progress: &ProgressNode) -> Result<()> {
    let file = fs::File::open(archive).map_err(|e| CoreError::archive("could not open", archive, e))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| CoreError::archive("extraction failed", archive, e))?;

    let total: u64 = (0..zip.len())
        .filter_map(|i| zip.by_index(i).ok().map(|e| e.size()))
        .sum();
    progress.set_total(total.max(1));

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| CoreError::archive("extraction failed", archive, e))?;
        let outpath = dest.join(sanitize_entry_name(entry.name()));

        if entry.is_dir() {
            fs::create_dir_all(&outpath).map_err(|e| CoreError::path_io("create_dir_all", &outpath, e))?;
            continue;
        }

        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent).map_err(|e| CoreError::path_io("create_dir_all", parent, e))?;
        }
        let mut outfile =
            fs::File::create(&outpath).map_err(|e| CoreError::path_io("create", &outpath, e))?;
        let copied = io::copy(&mut entry, &mut outfile)
            .map_err(|e| CoreError::archive("extraction failed", archive, e))?;
        progress.advance(copied);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&outpath, fs::Permissions::from_mode(mode)).ok();
            }
        }
    }
    Ok(())
}

fn extract_7z(archive: &Path, dest: &Path, progress: &ProgressNode) -> Result<()> {
    let total = fs::metadata(archive)
        .map_err(|e| CoreError::archive("could not open", archive, e))?
        .len();
    progress.set_total(total.max(1));

    sevenz_rust::decompress_file(archive, dest)
        .map_err(|e| CoreError::archive("extraction failed", archive, e))?;
    progress.advance(total);
    Ok(())
}

fn sanitize_entry_name(name: &str) -> std::path::PathBuf {
    name.replace('\\', "/")
        .split('/')
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .collect()
}

fn normalize_permissions(root: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            let mode = if entry.file_type().is_dir() { 0o755 } else { 0o644 };
            fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode)).ok();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = root;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::UnavailableRarExtractor;
    use tempfile::tempdir;

    #[test]
    fn sanitize_entry_name_strips_traversal() {
        assert_eq!(
            sanitize_entry_name("../../etc/passwd"),
            std::path::PathBuf::from("etc/passwd")
        );
        assert_eq!(
            sanitize_entry_name("a\\b\\c.txt"),
            std::path::PathBuf::from("a/b/c.txt")
        );
    }

    #[test]
    fn extract_copies_directory_sources() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        let dest = dir.path().join("dest");
        fs::create_dir_all(source.join("sub")).unwrap();
        fs::write(source.join("sub/a.txt"), b"hello").unwrap();

        let progress = ProgressNode::new_root();
        extract(&source, &dest, &progress, &UnavailableRarExtractor).unwrap();

        assert_eq!(fs::read(dest.join("sub/a.txt")).unwrap(), b"hello");
        assert_eq!(progress.progress(), 1.0);
    }

    #[test]
    fn rar_fallback_without_extractor_fails() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("mod.rar");
        fs::write(&archive, b"not a real rar or zip").unwrap();
        let dest = dir.path().join("dest");

        let progress = ProgressNode::new_root();
        let result = extract(&archive, &dest, &progress, &UnavailableRarExtractor);
        assert!(result.is_err());
    }
}
