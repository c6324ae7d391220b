//! Filesystem path helpers shared by every deployer and the installer.
//!
//! All mutations here prefer a metadata-preserving rename and fall back to
//! copy+remove on cross-device failures (EXDEV), per §4.1/§9.

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{CoreError, Result};

/// Rename `from` to `to`, falling back to copy+remove if the rename fails
/// (typically because `from` and `to` live on different filesystems).
pub fn rename_or_copy(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|e| CoreError::path_io("create_dir_all", parent, e))?;
    }

    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            if from.is_dir() {
                copy_dir_recursive(from, to)?;
                fs::remove_dir_all(from).map_err(|e| CoreError::path_io("remove_dir_all", from, e))?;
            } else {
                fs::copy(from, to).map_err(|e| CoreError::path_io("copy", from, e))?;
                fs::remove_file(from).map_err(|e| CoreError::path_io("remove_file", from, e))?;
            }
            Ok(())
        }
    }
}

fn copy_dir_recursive(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from).into_iter().filter_map(|e| e.ok()) {
        let rel = entry
            .path()
            .strip_prefix(from)
            .expect("walkdir entries are rooted at `from`");
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest).map_err(|e| CoreError::path_io("create_dir_all", &dest, e))?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| CoreError::path_io("create_dir_all", parent, e))?;
            }
            fs::copy(entry.path(), &dest).map_err(|e| CoreError::path_io("copy", entry.path(), e))?;
        }
    }
    Ok(())
}

/// Resolve `candidate` (a path relative to `base`) case-insensitively.
///
/// Walks the candidate segment by segment; at each step either an exact
/// match exists on disk, or exactly one case-insensitive match is scanned
/// for in the current directory. Returns `None` if no match can be found
/// at any step, or if more than one candidate directory entry matches
/// ambiguously (case-insensitively) is not actually possible to
/// disambiguate further, so the first lexical match wins deterministically.
pub fn resolve_case_insensitive(base: &Path, candidate: &Path) -> Option<PathBuf> {
    let mut current = base.to_path_buf();

    for component in candidate.components() {
        let Component::Normal(part) = component else {
            continue;
        };
        let exact = current.join(part);
        if exact.exists() {
            current = exact;
            continue;
        }

        let part_lower = part.to_string_lossy().to_lowercase();
        let entries = fs::read_dir(&current).ok()?;
        let mut found = None;
        for entry in entries.filter_map(|e| e.ok()) {
            if entry.file_name().to_string_lossy().to_lowercase() == part_lower {
                found = Some(entry.path());
                break;
            }
        }
        current = found?;
    }

    Some(current)
}

/// Remove the first `n` path components, returning `(removed, remaining)`.
pub fn split_at_depth(path: &Path, n: usize) -> (PathBuf, PathBuf) {
    let mut removed = PathBuf::new();
    let mut remaining = PathBuf::new();
    for (i, component) in path.components().enumerate() {
        if i < n {
            removed.push(component);
        } else {
            remaining.push(component);
        }
    }
    (removed, remaining)
}

/// Move every file under `source` into `dest`, with the first `depth`
/// path components stripped from each file's relative path.
///
/// Rejects with [`CoreError::DuplicatePath`] if two distinct source files
/// would collide on the same stripped destination path.
pub fn move_to_depth(source: &Path, dest: &Path, depth: usize) -> Result<()> {
    let mut seen: HashMap<PathBuf, PathBuf> = HashMap::new();
    let mut moves = Vec::new();

    for entry in WalkDir::new(source).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(source)
            .expect("walkdir entries are rooted at `source`");
        let (_, stripped) = split_at_depth(rel, depth);

        if let Some(existing) = seen.get(&stripped) {
            return Err(CoreError::DuplicatePath {
                path: stripped,
                first: existing.clone(),
                second: entry.path().to_path_buf(),
            });
        }
        seen.insert(stripped.clone(), entry.path().to_path_buf());
        moves.push((entry.path().to_path_buf(), dest.join(stripped)));
    }

    for (from, to) in moves {
        rename_or_copy(&from, &to)?;
    }

    remove_empty_dirs(source);
    Ok(())
}

/// Merge `source` into `dest`: directories recurse, files at an existing
/// destination path are replaced, absent entries are moved in.
pub fn move_files_to_directory(source: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).map_err(|e| CoreError::path_io("create_dir_all", dest, e))?;

    for entry in fs::read_dir(source).map_err(|e| CoreError::path_io("read_dir", source, e))? {
        let entry = entry.map_err(|e| CoreError::path_io("read_dir", source, e))?;
        let dest_entry = dest.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|e| CoreError::path_io("file_type", entry.path(), e))?;

        if file_type.is_dir() {
            if dest_entry.is_dir() {
                move_files_to_directory(&entry.path(), &dest_entry)?;
                fs::remove_dir(entry.path()).ok();
            } else {
                rename_or_copy(&entry.path(), &dest_entry)?;
            }
        } else {
            if dest_entry.exists() {
                fs::remove_file(&dest_entry).map_err(|e| CoreError::path_io("remove_file", &dest_entry, e))?;
            }
            rename_or_copy(&entry.path(), &dest_entry)?;
        }
    }
    Ok(())
}

/// Rename every file under `source` into `dest`, transforming every path
/// character through `char_map`. Empty source directories are removed
/// once their contents have moved.
///
/// Fails with [`CoreError::DuplicatePath`] if a renamed target would
/// collide with an existing, distinct file.
pub fn rename_subtree_with_char_map(
    source: &Path,
    dest: &Path,
    char_map: &HashMap<char, char>,
) -> Result<()> {
    let mut directories = Vec::new();
    let mut planned: HashMap<PathBuf, PathBuf> = HashMap::new();

    for entry in WalkDir::new(source).into_iter().filter_map(|e| e.ok()) {
        let rel = entry
            .path()
            .strip_prefix(source)
            .expect("walkdir entries are rooted at `source`");
        let mapped_rel = map_path_chars(rel, char_map);

        if entry.file_type().is_dir() {
            if !rel.as_os_str().is_empty() {
                directories.push(entry.path().to_path_buf());
            }
            continue;
        }

        let mapped_dest = dest.join(&mapped_rel);
        if let Some(existing) = planned.get(&mapped_dest) {
            if existing != entry.path() {
                return Err(CoreError::DuplicatePath {
                    path: mapped_dest,
                    first: existing.clone(),
                    second: entry.path().to_path_buf(),
                });
            }
        }
        planned.insert(mapped_dest.clone(), entry.path().to_path_buf());
        rename_or_copy(entry.path(), &mapped_dest)?;
    }

    // Remove now-empty original directories, deepest first.
    directories.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    for dir in directories {
        fs::remove_dir(&dir).ok();
    }
    Ok(())
}

fn map_path_chars(path: &Path, char_map: &HashMap<char, char>) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        if let Component::Normal(part) = component {
            let mapped: String = part
                .to_string_lossy()
                .chars()
                .map(|c| *char_map.get(&c).unwrap_or(&c))
                .collect();
            out.push(mapped);
        } else {
            out.push(component.as_os_str());
        }
    }
    out
}

/// Remove every now-empty directory under `root`, deepest first, leaving
/// `root` itself if it is empty too.
pub fn remove_empty_dirs(root: &Path) {
    let mut dirs: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.path().to_path_buf())
        .collect();
    dirs.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    for dir in dirs {
        fs::remove_dir(&dir).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn resolve_case_insensitive_matches_single_segment() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("Textures")).unwrap();
        fs::write(dir.path().join("Textures").join("Rock.DDS"), b"x").unwrap();

        let resolved =
            resolve_case_insensitive(dir.path(), Path::new("textures/rock.dds")).unwrap();
        assert_eq!(resolved, dir.path().join("Textures").join("Rock.DDS"));
    }

    #[test]
    fn resolve_case_insensitive_returns_none_when_missing() {
        let dir = tempdir().unwrap();
        assert!(resolve_case_insensitive(dir.path(), Path::new("nope/missing.txt")).is_none());
    }

    #[test]
    fn split_at_depth_splits_components() {
        let (removed, remaining) = split_at_depth(Path::new("a/b/c/d.txt"), 2);
        assert_eq!(removed, PathBuf::from("a/b"));
        assert_eq!(remaining, PathBuf::from("c/d.txt"));
    }

    #[test]
    fn move_to_depth_detects_collisions() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        let dest = dir.path().join("dest");
        fs::create_dir_all(source.join("a/sub")).unwrap();
        fs::create_dir_all(source.join("b/sub")).unwrap();
        fs::write(source.join("a/sub/f.txt"), b"1").unwrap();
        fs::write(source.join("b/sub/f.txt"), b"2").unwrap();

        let result = move_to_depth(&source, &dest, 1);
        assert!(matches!(result, Err(CoreError::DuplicatePath { .. })));
    }

    #[test]
    fn move_to_depth_strips_components() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        let dest = dir.path().join("dest");
        fs::create_dir_all(source.join("00 core/meshes")).unwrap();
        fs::write(source.join("00 core/meshes/a.nif"), b"x").unwrap();

        move_to_depth(&source, &dest, 1).unwrap();
        assert!(dest.join("meshes/a.nif").exists());
    }

    #[test]
    fn rename_subtree_with_char_map_transforms_names() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        let dest = dir.path().join("dest");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("a b.txt"), b"x").unwrap();

        let mut map = HashMap::new();
        map.insert(' ', '_');
        rename_subtree_with_char_map(&source, &dest, &map).unwrap();

        assert!(dest.join("a_b.txt").exists());
    }
}
