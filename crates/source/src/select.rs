//! Source selection - deciding which files belong in the artifact.
//!
//! Selection is split in two stages: [`classify`] decides for a single
//! root-relative path, and [`copy_files`] materialises the result in the
//! staging directory.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use shipyard_core::{FileSet, SelectionPolicy};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Result, SourceError};
use crate::tracking::{GitOracle, TrackedFiles, TrackingOracle};

/// Directory names holding version-control metadata.
const VCS_DIRS: &[&str] = &[".git", ".hg", ".svn"];

/// Directory names holding build caches.
const CACHE_DIRS: &[&str] = &["__pycache__"];

/// Why a file was included or excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// Version-control metadata or build cache; cannot be overridden
    AlwaysExcluded,
    /// Matched an exclude rule
    ExplicitExclude,
    /// Matched an include rule
    ExplicitInclude,
    /// Tracked by version control
    Tracked,
    /// Not tracked by version control
    Untracked,
}

/// Outcome of [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Package the file
    Include(Reason),
    /// Leave the file out
    Exclude(Reason),
}

impl Decision {
    /// True for [`Decision::Include`].
    pub fn is_included(&self) -> bool {
        matches!(self, Self::Include(_))
    }
}

/// Decide whether a root-relative `path` is packaged.
///
/// Rules, first match wins:
/// 1. version-control metadata and build caches are always excluded;
/// 2. the most specific matching include/exclude rule decides (a rule
///    matches when it names the file or one of its ancestor directories;
///    more path components means more specific);
/// 3. otherwise the file is included iff it is tracked.
pub fn classify(path: &Path, policy: &SelectionPolicy, tracked: &TrackedFiles) -> Decision {
    if is_always_excluded(path) {
        return Decision::Exclude(Reason::AlwaysExcluded);
    }

    let include = most_specific(policy.included(), path);
    let exclude = most_specific(policy.excluded(), path);

    match (include, exclude) {
        (Some(i), Some(e)) if i > e => Decision::Include(Reason::ExplicitInclude),
        (_, Some(_)) => Decision::Exclude(Reason::ExplicitExclude),
        (Some(_), None) => Decision::Include(Reason::ExplicitInclude),
        (None, None) if tracked.contains(path) => Decision::Include(Reason::Tracked),
        (None, None) => Decision::Exclude(Reason::Untracked),
    }
}

/// Depth of the deepest rule matching `path`.
fn most_specific(rules: &BTreeSet<PathBuf>, path: &Path) -> Option<usize> {
    rules
        .iter()
        .filter(|rule| path.starts_with(rule))
        .map(|rule| rule.components().count())
        .max()
}

/// Version-control metadata (`.git/`, `.gitignore`, ...) or cache directories.
fn is_always_excluded(path: &Path) -> bool {
    let in_excluded_dir = path.components().any(|c| match c {
        Component::Normal(name) => name
            .to_str()
            .map(|n| VCS_DIRS.contains(&n) || CACHE_DIRS.contains(&n))
            .unwrap_or(false),
        _ => false,
    });

    let git_file = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(".git"))
        .unwrap_or(false);

    in_excluded_dir || git_file
}

/// Non-fatal issue found during selection, reported at the end of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionWarning {
    /// Tracking state unknown; everything not excluded was packaged
    TrackingUnavailable {
        /// Why the oracle failed
        reason: String,
    },
    /// Untracked files were left out
    UncommittedChanges,
}

impl fmt::Display for SelectionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TrackingUnavailable { reason } => write!(
                f,
                "Unable to get git tracked files: {reason}. Everything will be included, \
                 except for files in the 'exclude' section"
            ),
            Self::UncommittedChanges => write!(
                f,
                "Your git repository contains untracked files, which \
                 will be ignored when building the artifact. Commit them if needed."
            ),
        }
    }
}

/// Result of a selection run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// Files to package, relative to the project root
    pub files: FileSet,

    /// Warnings to surface once the run is over
    pub warnings: Vec<SelectionWarning>,
}

/// Selects project files using a tracking oracle.
pub struct Selector<O = GitOracle> {
    oracle: O,
    skipped: Vec<PathBuf>,
}

impl Selector<GitOracle> {
    /// Selector backed by git.
    pub fn git() -> Self {
        Self::new(GitOracle)
    }
}

impl<O: TrackingOracle> Selector<O> {
    /// Create a selector with a custom oracle.
    pub fn new(oracle: O) -> Self {
        Self {
            oracle,
            skipped: Vec::new(),
        }
    }

    /// Never walk into `dir` (relative to the project root), in addition to the destination.
    pub fn skipping(mut self, dir: impl Into<PathBuf>) -> Self {
        self.skipped.push(dir.into());
        self
    }

    /// Compute the selection without touching the destination.
    pub fn plan(&self, root: &Path, destination: &Path, policy: &SelectionPolicy) -> Result<Selection> {
        let root = root
            .canonicalize()
            .map_err(|e| SourceError::io("resolve", root, e))?;
        let mut pruned = vec![resolve_destination(&root, destination)];
        pruned.extend(self.skipped.iter().map(|dir| resolve_destination(&root, dir)));
        let policy = policy.rebased(&root);

        let mut warnings = Vec::new();
        let tracked = match self.oracle.tracked_files(&root) {
            Ok(tracked) => {
                if self.oracle.has_uncommitted_changes(&root) {
                    warnings.push(SelectionWarning::UncommittedChanges);
                }
                tracked
            }
            Err(e) => {
                warnings.push(SelectionWarning::TrackingUnavailable { reason: e.to_string() });
                TrackedFiles::Everything
            }
        };
        for warning in &warnings {
            warn!("{}", warning);
        }

        let mut files = FileSet::new();
        let walker = WalkDir::new(&root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !pruned.iter().any(|dir| e.path().starts_with(dir)));

        for entry in walker {
            let entry = entry.map_err(|source| SourceError::Walk {
                path: root.clone(),
                source,
            })?;
            if !entry.path().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&root) else {
                continue;
            };

            let decision = classify(relative, &policy, &tracked);
            debug!("{} -> {:?}", relative.display(), decision);
            if decision.is_included() {
                files.insert(relative.to_path_buf());
            }
        }

        Ok(Selection { files, warnings })
    }

    /// Select files under `root` and copy them into `destination`.
    pub fn select(&self, root: &Path, destination: &Path, policy: &SelectionPolicy) -> Result<Selection> {
        let selection = self.plan(root, destination, policy)?;
        let root = root
            .canonicalize()
            .map_err(|e| SourceError::io("resolve", root, e))?;
        copy_files(&root, &resolve_destination(&root, destination), &selection.files)?;
        info!("Selected {} files from {}", selection.files.len(), root.display());
        Ok(selection)
    }
}

/// Validate the overrides, then select and copy using git tracking state.
pub fn select<I, E>(root: &Path, destination: &Path, include: I, exclude: E) -> Result<Selection>
where
    I: IntoIterator,
    I::Item: AsRef<Path>,
    E: IntoIterator,
    E::Item: AsRef<Path>,
{
    let policy = SelectionPolicy::new(include, exclude)?;
    Selector::git().select(root, destination, &policy)
}

/// Copy `files` (relative to `root`) into `destination`, keeping their paths.
pub fn copy_files(root: &Path, destination: &Path, files: &FileSet) -> Result<()> {
    for file in files.iter() {
        let source = root.join(file);
        let target = destination.join(file);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| SourceError::io("create directory", parent, e))?;
        }
        fs::copy(&source, &target).map_err(|e| SourceError::io("copy", &source, e))?;
        debug!("Copying {} -> {}", source.display(), target.display());
    }
    Ok(())
}

fn resolve_destination(root: &Path, destination: &Path) -> PathBuf {
    let joined = root.join(destination);
    joined.canonicalize().unwrap_or(joined)
}
