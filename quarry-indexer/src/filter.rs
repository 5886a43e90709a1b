//! Exclusion policy shared by full passes and the change handler.
//!
//! A path is excluded when any component is hidden (unless hidden files are
//! enabled) or a build/output directory, when its extension is binary noise,
//! or when it matches one of the configured gitignore-style patterns.

use crate::config::FilterSettings;
use crate::error::{IndexError, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::{Component, Path, PathBuf};

/// Directories that only ever hold generated output or tooling state.
pub const BUILD_DIRS: &[&str] = &[
    "target",
    "node_modules",
    ".git",
    "build",
    "dist",
    "__pycache__",
    ".venv",
    ".quarry",
];

/// Extensions that never carry indexable text.
pub const NOISE_EXTENSIONS: &[&str] = &[
    "exe", "dll", "so", "dylib", "bin", "o", "a", "class", "pyc", "wasm", "png", "jpg", "jpeg",
    "gif", "ico", "bmp", "webp", "mp3", "mp4", "wav", "mov", "avi", "zip", "gz", "tar", "7z",
    "lock", "db", "sqlite", "db-wal", "db-shm",
];

#[derive(Debug, Clone)]
pub struct PathFilter {
    roots: Vec<PathBuf>,
    include_hidden: bool,
    patterns: Gitignore,
}

impl PathFilter {
    pub fn new(roots: &[PathBuf], settings: &FilterSettings) -> Result<Self> {
        let mut builder = GitignoreBuilder::new("");
        for pattern in &settings.exclude {
            builder
                .add_line(None, pattern)
                .map_err(|e| IndexError::config(format!("bad exclude pattern {pattern:?}: {e}")))?;
        }
        let patterns = builder
            .build()
            .map_err(|e| IndexError::config(format!("bad exclude patterns: {e}")))?;

        Ok(Self {
            roots: roots.to_vec(),
            include_hidden: settings.include_hidden,
            patterns,
        })
    }

    /// Filter with the default policy and no extra patterns.
    pub fn permissive(roots: &[PathBuf]) -> Self {
        Self {
            roots: roots.to_vec(),
            include_hidden: false,
            patterns: Gitignore::empty(),
        }
    }

    /// Path relative to whichever root contains it.
    fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        self.roots
            .iter()
            .find_map(|root| path.strip_prefix(root).ok())
            .unwrap_or(path)
    }

    pub fn is_excluded(&self, path: &Path, is_dir: bool) -> bool {
        let rel = self.relative(path);

        for component in rel.components() {
            if let Component::Normal(name) = component {
                let name = name.to_string_lossy();
                if !self.include_hidden && name.starts_with('.') {
                    return true;
                }
                if BUILD_DIRS.contains(&name.as_ref()) {
                    return true;
                }
            }
        }

        if !is_dir {
            if let Some(ext) = rel.extension().and_then(|e| e.to_str()) {
                if NOISE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
                    return true;
                }
            }
        }

        self.matches_pattern(rel, is_dir)
    }

    fn matches_pattern(&self, rel: &Path, is_dir: bool) -> bool {
        if self.patterns.is_empty() || rel.has_root() {
            return false;
        }
        // Check the path itself, then each parent directory
        let mut current = Some(rel);
        let mut current_is_dir = is_dir;
        while let Some(p) = current.filter(|p| !p.as_os_str().is_empty()) {
            let matched = self.patterns.matched(p, current_is_dir);
            if matched.is_ignore() {
                return true;
            }
            if matched.is_whitelist() {
                return false;
            }
            current = p.parent();
            current_is_dir = true;
        }
        false
    }

    pub fn accepts_file(&self, path: &Path) -> bool {
        !self.is_excluded(path, false)
    }

    /// Whether the path lies under one of the roots.
    pub fn covers(&self, path: &Path) -> bool {
        self.roots.iter().any(|root| path.starts_with(root))
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_with(exclude: &[&str]) -> PathFilter {
        let settings = FilterSettings {
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
            include_hidden: false,
        };
        PathFilter::new(&[PathBuf::from("/project")], &settings).unwrap()
    }

    #[test]
    fn test_default_policy() {
        let filter = PathFilter::permissive(&[PathBuf::from("/project")]);

        assert!(filter.accepts_file(Path::new("/project/src/lib.rs")));
        assert!(filter.accepts_file(Path::new("/project/README.md")));
        assert!(filter.accepts_file(Path::new("/project/docs/guide.pdf")));

        assert!(!filter.accepts_file(Path::new("/project/.env")));
        assert!(!filter.accepts_file(Path::new("/project/.git/config")));
        assert!(!filter.accepts_file(Path::new("/project/target/debug/app")));
        assert!(!filter.accepts_file(Path::new("/project/web/node_modules/x/index.js")));
        assert!(!filter.accepts_file(Path::new("/project/image.PNG")));
        assert!(!filter.accepts_file(Path::new("/project/Cargo.lock")));
    }

    #[test]
    fn test_hidden_root_is_not_excluded() {
        // Only components below the root count
        let filter = PathFilter::permissive(&[PathBuf::from("/home/me/.notes")]);
        assert!(filter.accepts_file(Path::new("/home/me/.notes/today.md")));
        assert!(filter.covers(Path::new("/home/me/.notes/today.md")));
        assert!(!filter.covers(Path::new("/home/me/other.md")));
    }

    #[test]
    fn test_include_hidden() {
        let settings = FilterSettings {
            exclude: vec![],
            include_hidden: true,
        };
        let filter = PathFilter::new(&[PathBuf::from("/p")], &settings).unwrap();
        assert!(filter.accepts_file(Path::new("/p/.github/workflow.yml")));
        // Build dirs stay excluded
        assert!(!filter.accepts_file(Path::new("/p/.git/HEAD")));
    }

    #[test]
    fn test_exclude_patterns() {
        let filter = filter_with(&["*.log", "drafts/", "!keep.log"]);

        assert!(!filter.accepts_file(Path::new("/project/server.log")));
        assert!(filter.accepts_file(Path::new("/project/keep.log")));
        assert!(!filter.accepts_file(Path::new("/project/drafts/idea.md")));
        assert!(filter.is_excluded(Path::new("/project/drafts"), true));
        assert!(filter.accepts_file(Path::new("/project/final/idea.md")));
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let settings = FilterSettings {
            exclude: vec!["a[".into()],
            include_hidden: false,
        };
        let err = PathFilter::new(&[], &settings).unwrap_err();
        assert!(matches!(err, IndexError::Config { .. }));
    }
}
