//! Shared utility functions for the weave crate.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Maximum length of a sanitised branch name.
pub const MAX_BRANCH_LEN: usize = 80;

/// Replace `path` with `contents` so readers see either the old or the new
/// file, never a partial one: write a sibling temp file, fsync, rename.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "state".to_string());
    let tmp = parent.join(format!(".{}.tmp-{}", file_name, std::process::id()));

    let mut file = std::fs::File::create(&tmp)
        .with_context(|| format!("Failed to create temp file {}", tmp.display()))?;
    file.write_all(contents)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    file.sync_all()
        .with_context(|| format!("Failed to fsync {}", tmp.display()))?;
    drop(file);

    std::fs::rename(&tmp, path).with_context(|| {
        let _ = std::fs::remove_file(&tmp);
        format!("Failed to replace {}", path.display())
    })?;
    Ok(())
}

/// Exclusive advisory lock on a file, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Block until the exclusive lock on `path` is held, creating the file if needed.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;
        FileExt::lock_exclusive(&file)
            .with_context(|| format!("Failed to lock {}", path.display()))?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Lowercase ASCII slug for file and directory names: runs of anything that
/// is not `[a-z0-9]` collapse to a single `-`.
pub fn slugify(text: &str) -> String {
    let slug = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug
    }
}

/// Sanitise a branch name: anything outside `[a-zA-Z0-9-/]` becomes `-`,
/// lowercased, at most [`MAX_BRANCH_LEN`] characters.
pub fn sanitize_branch(name: &str) -> String {
    let mut branch: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '/' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    // All characters are ASCII here, so byte truncation is safe.
    branch.truncate(MAX_BRANCH_LEN);
    branch.trim_matches(|c| c == '-' || c == '/').to_string()
}

/// True when `rel` is a relative path that stays inside the directory it
/// is joined to: no root, prefix or `..` components.
pub fn is_contained_path(rel: &str) -> bool {
    use std::path::Component;
    !rel.trim().is_empty()
        && Path::new(rel)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Token estimate used for context ceilings: `ceil(chars / 4)`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}
