//! Directory traversal with layered ignore files.
//!
//! The scanner walks a rooted tree depth-first and emits file, directory,
//! and symlink entries. Directories are emitted before their children so a
//! restorer can pre-create them. Symlinks are recorded but never followed;
//! special files (sockets, devices, pipes) are dropped silently. Paths are
//! relative to the root in forward-slash form.

use std::path::{Path, PathBuf};

use ::ignore::WalkBuilder;

use crate::error::{Result, SkiffError};
use crate::ignore::{build_excludes, is_excluded};
use crate::manifest::Entry;

/// Client-specific ignore file, layered alongside `.gitignore` per
/// directory as the walk descends.
pub const IGNORE_FILENAME: &str = ".ibignore";

pub struct Scanner {
    root: PathBuf,
    excludes: Vec<String>,
}

impl Scanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            excludes: Vec::new(),
        }
    }

    /// Explicit exclude patterns applied on top of the ignore files.
    pub fn with_excludes(mut self, patterns: &[String]) -> Self {
        self.excludes = patterns.to_vec();
        self
    }

    /// Walk the tree, yielding entries lazily. Per-entry I/O failures are
    /// yielded as errors so the caller can decide whether to continue.
    pub fn scan(&self) -> Result<impl Iterator<Item = Result<Entry>> + '_> {
        let explicit = build_excludes(&self.root, &self.excludes)?;

        let mut builder = WalkBuilder::new(&self.root);
        builder
            .follow_links(false)
            .hidden(false)
            .ignore(false)
            .git_global(false)
            .git_exclude(false)
            .parents(false)
            .git_ignore(true)
            .require_git(false)
            .sort_by_file_name(std::ffi::OsStr::cmp);
        builder.add_custom_ignore_filename(IGNORE_FILENAME);

        let root = self.root.clone();
        let iter = builder.build().filter_map(move |res| -> Option<Result<Entry>> {
            let dirent = match res {
                Ok(e) => e,
                Err(e) => return Some(Err(SkiffError::Other(format!("walk error: {e}")))),
            };
            let path = dirent.path();
            if path == root {
                return None;
            }

            let rel = path.strip_prefix(&root).unwrap_or(path);
            let rel_path = to_slash(rel);

            let meta = match std::fs::symlink_metadata(path) {
                Ok(m) => m,
                Err(e) => {
                    return Some(Err(SkiffError::Other(format!(
                        "stat {}: {e}",
                        path.display()
                    ))))
                }
            };
            let file_type = meta.file_type();
            let is_dir = file_type.is_dir();

            if is_excluded(&explicit, &rel_path, is_dir) {
                return None;
            }

            let mode = mode_bits(&meta);
            let mtime = mtime_nanos(&meta);

            if is_dir {
                Some(Ok(Entry::dir(rel_path, mode, mtime)))
            } else if file_type.is_symlink() {
                match std::fs::read_link(path) {
                    Ok(target) => Some(Ok(Entry::symlink(
                        rel_path,
                        mode,
                        mtime,
                        target.to_string_lossy().into_owned(),
                    ))),
                    Err(e) => Some(Err(SkiffError::Other(format!(
                        "readlink {}: {e}",
                        path.display()
                    )))),
                }
            } else if file_type.is_file() {
                Some(Ok(Entry::file(rel_path, mode, mtime, meta.len())))
            } else {
                // Sockets, devices, and pipes are dropped silently.
                None
            }
        });

        Ok(iter)
    }
}

fn to_slash(path: &Path) -> String {
    let s = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        s.into_owned()
    } else {
        s.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

#[cfg(unix)]
fn mode_bits(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn mode_bits(meta: &std::fs::Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else {
        0o644
    }
}

#[cfg(unix)]
fn mtime_nanos(meta: &std::fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    meta.mtime()
        .saturating_mul(1_000_000_000)
        .saturating_add(meta.mtime_nsec())
}

#[cfg(not(unix))]
fn mtime_nanos(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::EntryKind;
    use std::fs;

    fn scan_paths(scanner: &Scanner) -> Vec<(String, EntryKind)> {
        scanner
            .scan()
            .unwrap()
            .map(|r| r.unwrap())
            .map(|e| (e.path.clone(), e.kind))
            .collect()
    }

    #[test]
    fn emits_dirs_before_children() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("sub/file.txt"), b"x").unwrap();
        fs::write(tmp.path().join("top.txt"), b"y").unwrap();

        let entries = scan_paths(&Scanner::new(tmp.path()));
        let dir_pos = entries.iter().position(|(p, _)| p == "sub").unwrap();
        let child_pos = entries
            .iter()
            .position(|(p, _)| p == "sub/file.txt")
            .unwrap();
        assert!(dir_pos < child_pos);
        assert!(entries.iter().any(|(p, k)| p == "top.txt" && *k == EntryKind::File));
    }

    #[test]
    fn gitignore_and_ibignore_are_honored() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(".gitignore"), "*.log\n").unwrap();
        fs::write(tmp.path().join(".ibignore"), "cache/\n").unwrap();
        fs::write(tmp.path().join("app.log"), b"x").unwrap();
        fs::write(tmp.path().join("app.txt"), b"x").unwrap();
        fs::create_dir(tmp.path().join("cache")).unwrap();
        fs::write(tmp.path().join("cache/blob"), b"x").unwrap();

        let entries = scan_paths(&Scanner::new(tmp.path()));
        let paths: Vec<&str> = entries.iter().map(|(p, _)| p.as_str()).collect();
        assert!(paths.contains(&"app.txt"));
        assert!(!paths.contains(&"app.log"));
        assert!(!paths.contains(&"cache"));
        assert!(!paths.contains(&"cache/blob"));
    }

    #[test]
    fn nested_ignore_files_layer_per_directory() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("sub/.gitignore"), "local.tmp\n").unwrap();
        fs::write(tmp.path().join("sub/local.tmp"), b"x").unwrap();
        fs::write(tmp.path().join("local.tmp"), b"x").unwrap();

        let entries = scan_paths(&Scanner::new(tmp.path()));
        let paths: Vec<&str> = entries.iter().map(|(p, _)| p.as_str()).collect();
        // The nested pattern only applies below its own directory.
        assert!(paths.contains(&"local.tmp"));
        assert!(!paths.contains(&"sub/local.tmp"));
    }

    #[test]
    fn explicit_excludes_apply() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("keep.txt"), b"x").unwrap();
        fs::write(tmp.path().join("drop.txt"), b"x").unwrap();

        let scanner =
            Scanner::new(tmp.path()).with_excludes(&["drop.txt".to_string()]);
        let entries = scan_paths(&scanner);
        let paths: Vec<&str> = entries.iter().map(|(p, _)| p.as_str()).collect();
        assert!(paths.contains(&"keep.txt"));
        assert!(!paths.contains(&"drop.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_recorded_not_followed() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("real")).unwrap();
        fs::write(tmp.path().join("real/inner.txt"), b"x").unwrap();
        std::os::unix::fs::symlink("real", tmp.path().join("alias")).unwrap();

        let entries = scan_paths(&Scanner::new(tmp.path()));
        assert!(entries
            .iter()
            .any(|(p, k)| p == "alias" && *k == EntryKind::Symlink));
        // Nothing under the symlink is traversed.
        assert!(!entries.iter().any(|(p, _)| p.starts_with("alias/")));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_target_is_recorded() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("file"), b"x").unwrap();
        std::os::unix::fs::symlink("file", tmp.path().join("ln")).unwrap();

        let entry = Scanner::new(tmp.path())
            .scan()
            .unwrap()
            .map(|r| r.unwrap())
            .find(|e| e.path == "ln")
            .unwrap();
        assert_eq!(entry.link_target.as_deref(), Some("file"));
    }

    #[cfg(unix)]
    #[test]
    fn special_files_are_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("regular"), b"x").unwrap();
        let fifo = tmp.path().join("pipe");
        let c_path = std::ffi::CString::new(fifo.to_string_lossy().as_bytes()).unwrap();
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o644) };
        assert_eq!(rc, 0, "mkfifo failed");

        let entries = scan_paths(&Scanner::new(tmp.path()));
        let paths: Vec<&str> = entries.iter().map(|(p, _)| p.as_str()).collect();
        assert!(paths.contains(&"regular"));
        assert!(!paths.contains(&"pipe"));
    }
}
