//! Artifact archiving.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Builder, HeaderMode};
use tracing::info;
use walkdir::WalkDir;

use crate::error::{Result, SourceError};

/// Compress `source_dir` into a gzip'd tarball at `archive_path`.
///
/// The archive holds a single top-level entry named after `source_dir`, so
/// unpacking it anywhere recreates the directory. Entries are written in
/// name order with normalised headers: the same tree always produces the
/// same bytes. `source_dir` is removed only once the archive is complete.
pub fn compress(source_dir: &Path, archive_path: &Path) -> Result<()> {
    let source_dir = source_dir
        .canonicalize()
        .map_err(|e| SourceError::io("resolve", source_dir, e))?;
    if !source_dir.is_dir() {
        return Err(SourceError::io(
            "archive",
            &source_dir,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
        ));
    }

    let archive_abs = absolute(archive_path)?;
    if archive_abs.starts_with(&source_dir) {
        return Err(SourceError::ArchiveInsideSource {
            archive: archive_path.to_path_buf(),
            directory: source_dir,
        });
    }

    let name = source_dir
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("artifact"));

    if let Err(e) = write_archive(&source_dir, &name, archive_path) {
        let _ = fs::remove_file(archive_path);
        return Err(e);
    }

    fs::remove_dir_all(&source_dir).map_err(|e| SourceError::io("remove", &source_dir, e))?;
    info!("Compressed {} -> {}", name.display(), archive_path.display());
    Ok(())
}

fn write_archive(source_dir: &Path, name: &Path, archive_path: &Path) -> Result<()> {
    let file = File::create(archive_path).map_err(|e| SourceError::io("create", archive_path, e))?;
    let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
    builder.mode(HeaderMode::Deterministic);

    for entry in WalkDir::new(source_dir).sort_by_file_name() {
        let entry = entry.map_err(|source| SourceError::Walk {
            path: source_dir.to_path_buf(),
            source,
        })?;
        let Ok(relative) = entry.path().strip_prefix(source_dir) else {
            continue;
        };
        let archived = name.join(relative);

        let appended = if entry.file_type().is_dir() {
            builder.append_dir(&archived, entry.path())
        } else {
            builder.append_path_with_name(entry.path(), &archived)
        };
        appended.map_err(|e| SourceError::io("archive", entry.path(), e))?;
    }

    let mut encoder = builder
        .into_inner()
        .map_err(|e| SourceError::io("write", archive_path, e))?;
    encoder.flush().map_err(|e| SourceError::io("write", archive_path, e))?;
    let file = encoder.finish().map_err(|e| SourceError::io("write", archive_path, e))?;
    file.sync_all().map_err(|e| SourceError::io("sync", archive_path, e))?;
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| SourceError::io("resolve", path, e))?;
    let joined = cwd.join(path);
    // the archive itself does not exist yet, resolve its parent
    match (joined.parent().and_then(|p| p.canonicalize().ok()), joined.file_name()) {
        (Some(parent), Some(file)) => Ok(parent.join(file)),
        _ => Ok(joined),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::collections::BTreeSet;

    fn unpack(archive: &Path, target: &Path) {
        let file = File::open(archive).unwrap();
        tar::Archive::new(GzDecoder::new(file)).unpack(target).unwrap();
    }

    fn tree(root: &Path) -> BTreeSet<String> {
        WalkDir::new(root)
            .into_iter()
            .map(|e| e.unwrap())
            .filter_map(|e| e.path().strip_prefix(root).ok().map(|p| p.to_string_lossy().into_owned()))
            .filter(|p| !p.is_empty())
            .collect()
    }

    fn staging(root: &Path) -> PathBuf {
        let dir = root.join("dist/project-name");
        fs::create_dir_all(dir.join("pkg")).unwrap();
        fs::write(dir.join("file"), b"top level").unwrap();
        fs::write(dir.join("pkg/module.py"), b"print('hi')\n").unwrap();
        fs::write(dir.join(".env"), b"KEY=1").unwrap();
        dir
    }

    #[test]
    fn test_compress_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = staging(tmp.path());
        let archive = tmp.path().join("dist/project-name.tar.gz");

        compress(&dir, &archive).unwrap();
        assert!(!dir.exists());

        let out = tmp.path().join("out");
        unpack(&archive, &out);

        let expected: BTreeSet<String> = ["project-name", "project-name/.env", "project-name/file", "project-name/pkg", "project-name/pkg/module.py"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(tree(&out), expected);
        assert_eq!(fs::read(out.join("project-name/pkg/module.py")).unwrap(), b"print('hi')\n");
    }

    #[test]
    fn test_compress_is_deterministic() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let archive_a = a.path().join("a.tar.gz");
        let archive_b = b.path().join("b.tar.gz");

        compress(&staging(a.path()), &archive_a).unwrap();
        compress(&staging(b.path()), &archive_b).unwrap();

        assert_eq!(fs::read(archive_a).unwrap(), fs::read(archive_b).unwrap());
    }

    #[test]
    fn test_missing_source_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let err = compress(&tmp.path().join("missing"), &tmp.path().join("x.tar.gz")).unwrap_err();
        assert!(matches!(err, SourceError::Io { .. }));
    }

    #[test]
    fn test_failure_keeps_staging_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = staging(tmp.path());

        let err = compress(&dir, &tmp.path().join("no/such/parent/x.tar.gz")).unwrap_err();
        assert!(matches!(err, SourceError::Io { .. }));
        assert!(dir.join("file").is_file());
    }

    #[test]
    fn test_archive_inside_source_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = staging(tmp.path());

        let err = compress(&dir, &dir.join("self.tar.gz")).unwrap_err();
        assert!(matches!(err, SourceError::ArchiveInsideSource { .. }));
        assert!(dir.exists());
    }
}
