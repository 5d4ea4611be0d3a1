use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use chrono::{DateTime, Utc};

use crate::error::Result;

/// A discovered candidate file.
#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    /// Fully resolved absolute path.
    pub absolute_path: PathBuf,
    /// Last modification time as seconds since the Unix epoch.
    pub mtime: u64,
    /// Size in bytes.
    pub size: u64,
}

impl DiscoveredFile {
    pub fn mtime_utc(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.mtime as i64, 0).unwrap_or_default()
    }
}

/// Extensions that never contain indexable text.
const SKIPPED_EXTENSIONS: &[&str] = &[
    "exe", "dll", "so", "dylib", "bin", "jar", "war", "zip", "tar", "gz",
    "rar", "7z",
];

/// Whether a file name is eligible for indexing.
///
/// Skips hidden files, editor backups (`~` prefix), temp files and known
/// binary archive formats.
pub fn should_index(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };

    if name.starts_with('.') || name.starts_with('~') {
        return false;
    }

    let lower = name.to_lowercase();
    if lower.ends_with(".tmp") || lower.ends_with(".temp") {
        return false;
    }

    !path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SKIPPED_EXTENSIONS.contains(&ext.to_lowercase().as_str())
        })
}

/// Recursively walk a directory and discover eligible files.
///
/// Hidden directories are skipped entirely. Symlinks that resolve back
/// into or above the root are skipped to prevent cycles.
pub fn discover_files(root: &Path) -> Result<Vec<DiscoveredFile>> {
    let canonical_root = root.canonicalize()?;
    let mut results = Vec::new();
    walk_dir(&canonical_root, &canonical_root, &mut results)?;
    results.sort_by(|a, b| a.absolute_path.cmp(&b.absolute_path));
    Ok(results)
}

fn walk_dir(
    root: &Path,
    current: &Path,
    results: &mut Vec<DiscoveredFile>,
) -> Result<()> {
    let entries = std::fs::read_dir(current)?;

    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();

        if name.starts_with('.') {
            continue;
        }

        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            walk_dir(root, &entry.path(), results)?;
        } else if file_type.is_symlink() {
            let resolved = match entry.path().canonicalize() {
                Ok(p) => p,
                Err(_) => continue, // Skip broken symlinks
            };
            if resolved.starts_with(root) && resolved.is_dir() {
                continue;
            }
            if resolved.is_file()
                && should_index(&resolved)
                && let Some(df) = make_discovered(&resolved)?
            {
                results.push(df);
            }
        } else if file_type.is_file() && should_index(&entry.path()) {
            let abs = entry.path().canonicalize()?;
            if let Some(df) = make_discovered(&abs)? {
                results.push(df);
            }
        }
    }

    Ok(())
}

fn make_discovered(absolute_path: &Path) -> Result<Option<DiscoveredFile>> {
    let meta = std::fs::metadata(absolute_path)?;

    let mtime = meta
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    Ok(Some(DiscoveredFile {
        absolute_path: absolute_path.to_path_buf(),
        mtime,
        size: meta.len(),
    }))
}
