//! Explicit gitignore-style exclude patterns.
//!
//! Per-directory `.gitignore`/`.ibignore` layering is handled by the walker
//! in [`crate::scanner`]; this module compiles explicit pattern lists (CLI
//! `--exclude`) into a matcher with the same syntax: `#` comments and blank
//! lines skipped, `!` negation, trailing `/` restricts to directories,
//! leading `/` anchors to the root, `**` crosses directory boundaries, and
//! later patterns override earlier ones.

use std::path::Path;

use ::ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::error::{Result, SkiffError};

/// Compile explicit exclude patterns into a matcher rooted at `root`.
pub fn build_excludes(root: &Path, patterns: &[String]) -> Result<Gitignore> {
    let mut builder = GitignoreBuilder::new(root);
    for pat in patterns {
        builder
            .add_line(None, pat)
            .map_err(|e| SkiffError::Config(format!("invalid exclude pattern '{pat}': {e}")))?;
    }
    builder
        .build()
        .map_err(|e| SkiffError::Config(format!("exclude matcher build failed: {e}")))
}

/// Whether `rel_path` (forward-slash, relative to the matcher root) is
/// excluded. A path is also excluded when any of its parents match.
pub fn is_excluded(matcher: &Gitignore, rel_path: &str, is_dir: bool) -> bool {
    matcher
        .matched_path_or_any_parents(Path::new(rel_path), is_dir)
        .is_ignore()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(patterns: &[&str]) -> Gitignore {
        let owned: Vec<String> = patterns.iter().map(|s| s.to_string()).collect();
        build_excludes(Path::new("/backup/root"), &owned).unwrap()
    }

    #[test]
    fn basename_pattern_matches_anywhere() {
        let m = matcher(&["*.log"]);
        assert!(is_excluded(&m, "debug.log", false));
        assert!(is_excluded(&m, "a/b/c/debug.log", false));
        assert!(!is_excluded(&m, "debug.txt", false));
    }

    #[test]
    fn negation_overrides_earlier_pattern() {
        let m = matcher(&["*.log", "!keep.log"]);
        assert!(is_excluded(&m, "other.log", false));
        assert!(!is_excluded(&m, "keep.log", false));
        assert!(!is_excluded(&m, "sub/keep.log", false));
    }

    #[test]
    fn trailing_slash_is_directory_only() {
        let m = matcher(&["build/"]);
        assert!(is_excluded(&m, "build", true));
        assert!(!is_excluded(&m, "build", false));
        // Contents of a matched directory are excluded too.
        assert!(is_excluded(&m, "build/output.o", false));
    }

    #[test]
    fn leading_slash_anchors_to_root() {
        let m = matcher(&["/top.txt"]);
        assert!(is_excluded(&m, "top.txt", false));
        assert!(!is_excluded(&m, "nested/top.txt", false));
    }

    #[test]
    fn double_star_crosses_directories() {
        let m = matcher(&["docs/**/*.md"]);
        assert!(is_excluded(&m, "docs/readme.md", false));
        assert!(is_excluded(&m, "docs/a/b/notes.md", false));
        assert!(!is_excluded(&m, "src/readme.md", false));
    }

    #[test]
    fn later_pattern_wins() {
        let m = matcher(&["!data", "data"]);
        assert!(is_excluded(&m, "data", false));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = build_excludes(Path::new("/r"), &["a[".to_string()]);
        assert!(err.is_err());
    }

    #[test]
    fn empty_pattern_list_matches_nothing() {
        let m = matcher(&[]);
        assert!(!is_excluded(&m, "anything", false));
    }
}
