//! Version-control tracking oracles.
//!
//! The selector asks an oracle which files are tracked and whether the
//! working tree has changes that would be left out of the artifact.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use git2::{ObjectType, Repository, Status, StatusOptions, TreeWalkMode, TreeWalkResult};
use tracing::debug;

/// Errors reported by a tracking oracle.
#[derive(Debug, thiserror::Error)]
pub enum TrackingError {
    /// Git operation error
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    /// The repository has no working directory (bare repository)
    #[error("repository at {} has no working tree", .0.display())]
    Bare(PathBuf),

    /// Could not resolve the project root
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Files known to version control, relative to the project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackedFiles {
    /// Every file counts as tracked
    Everything,
    /// Only these paths are tracked
    Only(HashSet<PathBuf>),
}

impl TrackedFiles {
    /// Whether `path` (relative to the project root) is tracked.
    pub fn contains(&self, path: &Path) -> bool {
        match self {
            Self::Everything => true,
            Self::Only(paths) => paths.contains(path),
        }
    }
}

/// Reports version-control state for a project root.
pub trait TrackingOracle: Send + Sync {
    /// List tracked files under `root`, relative to `root`.
    fn tracked_files(&self, root: &Path) -> Result<TrackedFiles, TrackingError>;

    /// Whether there are untracked files under `root` that selection will leave out.
    fn has_uncommitted_changes(&self, root: &Path) -> bool;
}

/// Git-backed oracle: tracked means "present in the HEAD tree".
#[derive(Debug, Clone, Copy, Default)]
pub struct GitOracle;

impl GitOracle {
    /// Create a new git oracle.
    pub fn new() -> Self {
        Self
    }

    /// Hash of the HEAD commit of the repository containing `root`.
    pub fn head_commit(root: &Path) -> Option<String> {
        let repo = Repository::discover(root).ok()?;
        let commit = repo.head().ok()?.peel_to_commit().ok()?;
        Some(commit.id().to_string())
    }

    /// `root` expressed relative to the repository work tree.
    fn root_prefix(repo: &Repository, root: &Path) -> Result<PathBuf, TrackingError> {
        let workdir = repo
            .workdir()
            .ok_or_else(|| TrackingError::Bare(repo.path().to_path_buf()))?
            .canonicalize()?;
        let root = root.canonicalize()?;
        Ok(root.strip_prefix(&workdir).map(Path::to_path_buf).unwrap_or_default())
    }
}

impl TrackingOracle for GitOracle {
    fn tracked_files(&self, root: &Path) -> Result<TrackedFiles, TrackingError> {
        let repo = Repository::discover(root)?;
        let prefix = Self::root_prefix(&repo, root)?;
        let tree = repo.head()?.peel_to_tree()?;

        let mut tracked = HashSet::new();
        tree.walk(TreeWalkMode::PreOrder, |dir, entry| {
            if entry.kind() == Some(ObjectType::Blob) {
                if let Some(name) = entry.name() {
                    let path = Path::new(dir).join(name);
                    if let Ok(relative) = path.strip_prefix(&prefix) {
                        tracked.insert(relative.to_path_buf());
                    }
                }
            }
            TreeWalkResult::Ok
        })?;

        debug!("{} files tracked under {}", tracked.len(), root.display());
        Ok(TrackedFiles::Only(tracked))
    }

    fn has_uncommitted_changes(&self, root: &Path) -> bool {
        let Ok(repo) = Repository::discover(root) else {
            return false;
        };
        let Ok(prefix) = Self::root_prefix(&repo, root) else {
            return false;
        };

        let mut options = StatusOptions::new();
        options.include_untracked(true).recurse_untracked_dirs(true);

        let Ok(statuses) = repo.statuses(Some(&mut options)) else {
            return false;
        };

        statuses.iter().any(|entry| {
            let status = entry.status();
            let inside_root = entry
                .path()
                .map(|p| Path::new(p).starts_with(&prefix))
                .unwrap_or(false);
            // modified tracked files are packaged as they are on disk
            inside_root && status.contains(Status::WT_NEW)
        })
    }
}

/// Oracle for projects without version control: everything is tracked.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeTracked;

impl TrackingOracle for AssumeTracked {
    fn tracked_files(&self, _root: &Path) -> Result<TrackedFiles, TrackingError> {
        Ok(TrackedFiles::Everything)
    }

    fn has_uncommitted_changes(&self, _root: &Path) -> bool {
        false
    }
}
