//! File selection model - what goes into a deployable artifact.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

/// Errors raised while building a [`SelectionPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// The same path was both included and excluded.
    #[error("include and exclude must not have overlapping elements: {}", display_paths(.paths))]
    Overlap {
        /// Every path present in both sets
        paths: Vec<PathBuf>,
    },

    /// A rule escapes the project root (e.g. `../secrets`).
    #[error("selection rule {path:?} must stay inside the project root")]
    OutsideRoot {
        /// The offending rule
        path: PathBuf,
    },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A deduplicated set of paths, relative to the project root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSet(BTreeSet<PathBuf>);

impl FileSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a path. Returns false if it was already present.
    pub fn insert(&mut self, path: impl Into<PathBuf>) -> bool {
        self.0.insert(path.into())
    }

    /// Whether the path is part of the set.
    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.0.contains(path.as_ref())
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if nothing was selected.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in lexicographic path order.
    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.0.iter().map(PathBuf::as_path)
    }
}

impl FromIterator<PathBuf> for FileSet {
    fn from_iter<I: IntoIterator<Item = PathBuf>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for FileSet {
    type Item = PathBuf;
    type IntoIter = std::collections::btree_set::IntoIter<PathBuf>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Explicit include/exclude overrides for source selection.
///
/// Rules are paths relative to the project root. A rule matches a file when
/// it names the file exactly or names one of its ancestor directories.
/// The two sets are guaranteed disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionPolicy {
    included: BTreeSet<PathBuf>,
    excluded: BTreeSet<PathBuf>,
}

impl SelectionPolicy {
    /// Build a policy, rejecting overlapping include/exclude entries.
    pub fn new<I, E>(include: I, exclude: E) -> Result<Self, PolicyError>
    where
        I: IntoIterator,
        I::Item: AsRef<Path>,
        E: IntoIterator,
        E::Item: AsRef<Path>,
    {
        let included = normalize_all(include)?;
        let excluded = normalize_all(exclude)?;

        let overlap: Vec<PathBuf> = included.intersection(&excluded).cloned().collect();
        if !overlap.is_empty() {
            return Err(PolicyError::Overlap { paths: overlap });
        }

        Ok(Self { included, excluded })
    }

    /// Paths that are always packaged.
    pub fn included(&self) -> &BTreeSet<PathBuf> {
        &self.included
    }

    /// Paths that are never packaged.
    pub fn excluded(&self) -> &BTreeSet<PathBuf> {
        &self.excluded
    }

    /// Rewrite absolute rules that point inside `root` as root-relative ones.
    ///
    /// Absolute rules outside of `root` can never match and are dropped.
    pub fn rebased(&self, root: &Path) -> Self {
        let rebase = |set: &BTreeSet<PathBuf>| {
            set.iter()
                .filter_map(|p| {
                    if p.is_absolute() {
                        p.strip_prefix(root).ok().map(normalize_lexically)
                    } else {
                        Some(p.clone())
                    }
                })
                .collect()
        };

        Self {
            included: rebase(&self.included),
            excluded: rebase(&self.excluded),
        }
    }
}

fn normalize_all<T>(paths: T) -> Result<BTreeSet<PathBuf>, PolicyError>
where
    T: IntoIterator,
    T::Item: AsRef<Path>,
{
    let mut out = BTreeSet::new();
    for path in paths {
        let path = path.as_ref();
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(PolicyError::OutsideRoot { path: path.to_path_buf() });
        }
        out.insert(normalize_lexically(path));
    }
    Ok(out)
}

/// Drop `.` components and trailing separators so `./dir/` and `dir` compare equal.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}
