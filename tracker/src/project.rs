//! Project detection for heartbeat enrichment.
//!
//! A file belongs to the nearest enclosing directory that contains one of the
//! [`PROJECT_INDICATORS`]. The project name is that directory's name.
//!
//! ```text
//! /home/user/code/repo/          <- contains .git: project "repo"
//! +-- Cargo.toml
//! +-- src/
//!     +-- main.rs                <- resolve("/home/user/code/repo/src/main.rs")
//! ```
//!
//! # Caching
//!
//! Results are cached per directory, including every directory passed through
//! on the way up. A later lookup stops at the first cached directory it meets,
//! so files in an already-seen directory resolve with a single map lookup.
//! Entries live until [`ProjectResolver::clear_cache`] is called.
//!
//! # Failure handling
//!
//! An I/O error while probing for an indicator is treated as "indicator
//! absent". Detection degrades to "no project" and never fails.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

/// File and directory names that mark a project root.
pub const PROJECT_INDICATORS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "Cargo.toml",
    "package.json",
    "pyproject.toml",
];

/// Existence check used for indicator probing.
pub trait Probe {
    /// Returns whether `path` exists.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when existence cannot be determined.
    fn exists(&self, path: &Path) -> io::Result<bool>;
}

/// Probes the real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsProbe;

impl Probe for FsProbe {
    fn exists(&self, path: &Path) -> io::Result<bool> {
        path.try_exists()
    }
}

/// Project context attached to a heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectInfo {
    pub name: Option<String>,
    pub root: Option<PathBuf>,
}

impl ProjectInfo {
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.name.is_none() && self.root.is_none()
    }
}

/// A detected project root.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ProjectRoot {
    name: Option<String>,
    root: PathBuf,
}

impl ProjectRoot {
    fn at(dir: &Path) -> Self {
        Self {
            name: dir.file_name().map(|n| n.to_string_lossy().into_owned()),
            root: dir.to_path_buf(),
        }
    }
}

impl From<ProjectRoot> for ProjectInfo {
    fn from(root: ProjectRoot) -> Self {
        Self {
            name: root.name,
            root: Some(root.root),
        }
    }
}

/// Resolves files to projects, caching results per directory.
#[derive(Debug)]
pub struct ProjectResolver<P = FsProbe> {
    probe: P,
    /// Static project name that bypasses detection.
    override_name: Option<String>,
    cache: HashMap<PathBuf, Option<ProjectRoot>>,
}

impl ProjectResolver<FsProbe> {
    /// Creates a resolver over the real filesystem.
    #[must_use]
    pub fn new(override_name: Option<String>) -> Self {
        Self::with_probe(FsProbe, override_name)
    }
}

impl<P: Probe> ProjectResolver<P> {
    #[must_use]
    pub fn with_probe(probe: P, override_name: Option<String>) -> Self {
        Self {
            probe,
            override_name,
            cache: HashMap::new(),
        }
    }

    /// Resolves the project for `file`.
    ///
    /// With a configured override the override name is returned without
    /// touching the filesystem. Otherwise directories are walked upward from
    /// the file's parent until an indicator or a cached directory is found.
    pub fn resolve(&mut self, file: &Path) -> ProjectInfo {
        if let Some(name) = &self.override_name {
            return ProjectInfo {
                name: Some(name.clone()),
                root: None,
            };
        }

        let Some(start) = file.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return ProjectInfo::default();
        };

        let mut visited = Vec::new();
        let mut found = None;
        let mut current = Some(start);

        while let Some(dir) = current {
            if let Some(cached) = self.cache.get(dir) {
                trace!(dir = %dir.display(), "Project cache hit");
                found = cached.clone();
                break;
            }

            visited.push(dir.to_path_buf());

            if self.has_indicator(dir) {
                found = Some(ProjectRoot::at(dir));
                break;
            }

            current = dir.parent();
        }

        if !visited.is_empty() {
            debug!(
                file = %file.display(),
                root = ?found.as_ref().map(|r| &r.root),
                walked = visited.len(),
                "Project resolved"
            );
        }

        for dir in visited {
            self.cache.insert(dir, found.clone());
        }

        found.map(ProjectInfo::from).unwrap_or_default()
    }

    fn has_indicator(&self, dir: &Path) -> bool {
        PROJECT_INDICATORS.iter().any(|name| {
            let candidate = dir.join(name);
            match self.probe.exists(&candidate) {
                Ok(exists) => exists,
                Err(e) => {
                    trace!(path = %candidate.display(), error = %e, "Indicator probe failed");
                    false
                }
            }
        })
    }

    /// Number of directories with a cached result.
    #[must_use]
    pub fn cached_dirs(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }
}
