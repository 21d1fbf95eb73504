//! Gitignore matching for the scanner and watcher.
//!
//! Thin wrapper over the `ignore` crate's gitignore implementation, rooted at
//! the project directory. A missing or unreadable .gitignore yields a matcher
//! that ignores nothing.

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::Path;
use tracing::debug;

pub struct GitignoreMatcher {
    matcher: Gitignore,
}

impl GitignoreMatcher {
    /// Build a matcher from the root-level .gitignore of `root`.
    pub fn load(root: &Path) -> Self {
        let mut builder = GitignoreBuilder::new(root);
        let gitignore_path = root.join(".gitignore");
        if gitignore_path.exists() {
            if let Some(err) = builder.add(&gitignore_path) {
                debug!(error = %err, "Failed to parse .gitignore, ignoring it");
            }
        }
        let matcher = builder.build().unwrap_or_else(|_| Gitignore::empty());
        Self { matcher }
    }

    /// A matcher that never matches anything.
    pub fn empty() -> Self {
        Self {
            matcher: Gitignore::empty(),
        }
    }

    /// Whether the path is excluded by the gitignore rules.
    pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        self.matcher.matched(path, is_dir).is_ignore()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_gitignore_matching() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".gitignore"), "*.log\nbuild/\n").unwrap();

        let matcher = GitignoreMatcher::load(dir.path());
        assert!(matcher.is_ignored(&dir.path().join("debug.log"), false));
        assert!(matcher.is_ignored(&dir.path().join("build"), true));
        assert!(!matcher.is_ignored(&dir.path().join("main.rs"), false));
    }

    #[test]
    fn test_missing_gitignore_matches_nothing() {
        let dir = TempDir::new().unwrap();
        let matcher = GitignoreMatcher::load(dir.path());
        assert!(!matcher.is_ignored(&dir.path().join("anything.log"), false));
    }

    #[test]
    fn test_empty_matcher() {
        let matcher = GitignoreMatcher::empty();
        assert!(!matcher.is_ignored(Path::new("/tmp/whatever.log"), false));
    }
}
