//! Transfer engine - uploads local files and directories to an object store.
//!
//! Files below the chunk threshold go up in a single request; larger ones
//! use an upload session, streamed part by part with a running SHA-1 that
//! the store checks at commit time.
//!
//! Name conflicts are resolved at most once per object: with `replace`
//! set, the conflicting remote object is deleted and the operation retried;
//! a second conflict is an error.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha1::{Digest, Sha1};
use shipyard_core::{
    FileId, FolderId, RemoteFile, RemoteFolder, SessionId, UploadSession, DEFAULT_CHUNK_THRESHOLD,
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

use crate::digest::ContentDigest;
use crate::trait_::{ObjectStore, StoreError};

/// Errors raised by the transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// A requested local path does not exist
    #[error("Invalid or non-existent path: {}", .path.display())]
    NotFound {
        /// Missing path
        path: PathBuf,
    },

    /// The remote object exists and replacing was not requested
    #[error("{} already exists remotely (id {remote_id})", .path.display())]
    AlreadyExists {
        /// Local path being uploaded
        path: PathBuf,
        /// Identifier of the existing remote object
        remote_id: String,
    },

    /// A conflict remained after the remote object was replaced once
    #[error("{} still conflicts with remote object {remote_id} after replacing it", .path.display())]
    ConflictPersisted {
        /// Local path being uploaded
        path: PathBuf,
        /// Identifier of the conflicting remote object
        remote_id: String,
    },

    /// The store rejected the content digest at commit time
    #[error("integrity check failed for {} (session {session}): {detail}", .path.display())]
    Integrity {
        /// Local path being uploaded
        path: PathBuf,
        /// Upload session that failed
        session: SessionId,
        /// Store-provided detail
        detail: String,
    },

    /// The file size changed while its parts were being read
    #[error("{} changed while it was being uploaded", .path.display())]
    SourceChanged {
        /// Local path being uploaded
        path: PathBuf,
    },

    /// Local I/O failure
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        /// Local path involved
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Any other store error
    #[error("upload of {} failed: {source}", .path.display())]
    Store {
        /// Local path being uploaded
        path: PathBuf,
        /// Underlying store error
        source: StoreError,
    },
}

impl TransferError {
    fn store(path: &Path, source: StoreError) -> Self {
        Self::Store {
            path: path.to_path_buf(),
            source,
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result type for transfers.
pub type Result<T> = std::result::Result<T, TransferError>;

/// Observer for upload progress.
pub trait TransferProgress: Send + Sync {
    /// `bytes` more bytes of `item` were transferred.
    fn advance(&self, item: &str, bytes: u64);
}

/// Ignores progress.
#[derive(Debug, Default)]
pub struct NoProgress;

impl TransferProgress for NoProgress {
    fn advance(&self, _item: &str, _bytes: u64) {}
}

/// What an upload batch produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Folders created
    pub folders: Vec<RemoteFolder>,
    /// Files uploaded
    pub files: Vec<RemoteFile>,
    /// Total bytes sent
    pub bytes: u64,
}

/// Tracks the single permitted delete-and-retry after a name conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConflictState {
    FirstAttempt,
    Replaced,
}

impl ConflictState {
    /// Decide what to do about a conflict; `Ok` means delete and retry.
    fn on_conflict(&mut self, replace: bool, path: &Path, remote_id: &str) -> Result<()> {
        match (*self, replace) {
            (Self::FirstAttempt, true) => {
                *self = Self::Replaced;
                Ok(())
            }
            (Self::FirstAttempt, false) => Err(TransferError::AlreadyExists {
                path: path.to_path_buf(),
                remote_id: remote_id.to_string(),
            }),
            (Self::Replaced, _) => Err(TransferError::ConflictPersisted {
                path: path.to_path_buf(),
                remote_id: remote_id.to_string(),
            }),
        }
    }
}

/// Uploads files and directory trees into an [`ObjectStore`].
pub struct TransferEngine {
    store: Arc<dyn ObjectStore>,
    chunk_threshold: u64,
    progress: Arc<dyn TransferProgress>,
}

impl TransferEngine {
    /// Create an engine with the default chunk threshold.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            progress: Arc::new(NoProgress),
        }
    }

    /// Files of at least `threshold` bytes are uploaded in parts.
    pub fn with_chunk_threshold(mut self, threshold: u64) -> Self {
        self.chunk_threshold = threshold;
        self
    }

    /// Report progress to `progress`.
    pub fn with_progress(mut self, progress: Arc<dyn TransferProgress>) -> Self {
        self.progress = progress;
        self
    }

    /// The store uploads go to.
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Upload `paths` into the store's root folder.
    pub async fn upload_to_root(&self, paths: &[PathBuf], replace: bool) -> Result<UploadReport> {
        let root = self
            .store
            .root_folder()
            .await
            .map_err(|e| TransferError::store(Path::new("/"), e))?;
        self.upload(paths, &root, replace).await
    }

    /// Resolve a `/`-separated folder path below the store root, creating
    /// missing folders and reusing existing ones.
    pub async fn resolve_folder(&self, path: &str) -> Result<RemoteFolder> {
        let mut folder = self
            .store
            .root_folder()
            .await
            .map_err(|e| TransferError::store(Path::new(path), e))?;

        for name in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            folder = match self.store.create_folder(&folder.id, name).await {
                Ok(created) => created,
                Err(StoreError::Conflict { existing_id, .. }) => RemoteFolder::new(existing_id, name),
                Err(e) => return Err(TransferError::store(Path::new(path), e)),
            };
        }
        debug!("Resolved target folder {} ({})", path, folder.id);
        Ok(folder)
    }

    /// Upload every path (file or directory) into `target`.
    ///
    /// All paths are checked before anything is sent; a missing one aborts
    /// the batch. Inside directories, dotfiles are skipped.
    pub async fn upload(&self, paths: &[PathBuf], target: &RemoteFolder, replace: bool) -> Result<UploadReport> {
        for path in paths {
            if tokio::fs::metadata(path).await.is_err() {
                return Err(TransferError::NotFound { path: path.clone() });
            }
        }

        let mut report = UploadReport::default();
        for path in paths {
            let metadata = tokio::fs::metadata(path)
                .await
                .map_err(|e| TransferError::io(path, e))?;
            if metadata.is_dir() {
                self.upload_directory(path, &target.id, replace, &mut report).await?;
            } else if metadata.is_file() {
                let file = self.upload_each_file(&target.id, path, metadata.len(), replace).await?;
                report.bytes += file.size;
                report.files.push(file);
            }
        }
        Ok(report)
    }

    /// Mirror the tree under `path` as a same-named folder inside `parent`.
    async fn upload_directory(
        &self,
        path: &Path,
        parent: &FolderId,
        replace: bool,
        report: &mut UploadReport,
    ) -> Result<()> {
        let folder = self.create_folder(parent, path, replace).await?;
        let mut pending = vec![(path.to_path_buf(), folder.id.clone())];
        report.folders.push(folder);

        while let Some((dir, folder_id)) = pending.pop() {
            for child in list_visible(&dir).await? {
                let metadata = tokio::fs::metadata(&child)
                    .await
                    .map_err(|e| TransferError::io(&child, e))?;
                if metadata.is_dir() {
                    let sub = self.create_folder(&folder_id, &child, replace).await?;
                    pending.push((child, sub.id.clone()));
                    report.folders.push(sub);
                } else if metadata.is_file() {
                    let file = self.upload_each_file(&folder_id, &child, metadata.len(), replace).await?;
                    report.bytes += file.size;
                    report.files.push(file);
                }
            }
        }
        Ok(())
    }

    async fn create_folder(&self, parent: &FolderId, path: &Path, replace: bool) -> Result<RemoteFolder> {
        let name = file_name(path)?;
        let mut state = ConflictState::FirstAttempt;
        loop {
            match self.store.create_folder(parent, &name).await {
                Ok(folder) => {
                    info!("Folder {} created", folder.name);
                    return Ok(folder);
                }
                Err(StoreError::Conflict { existing_id, .. }) => {
                    state.on_conflict(replace, path, &existing_id)?;
                    debug!("Replacing remote folder {} ({})", name, existing_id);
                    self.store
                        .delete_folder(&FolderId::new(existing_id))
                        .await
                        .map_err(|e| TransferError::store(path, e))?;
                }
                Err(e) => return Err(TransferError::store(path, e)),
            }
        }
    }

    async fn upload_each_file(&self, folder: &FolderId, path: &Path, size: u64, replace: bool) -> Result<RemoteFile> {
        if size < self.chunk_threshold {
            self.upload_small(folder, path, size, replace).await
        } else {
            self.upload_large(folder, path, size, replace).await
        }
    }

    async fn upload_small(&self, folder: &FolderId, path: &Path, size: u64, replace: bool) -> Result<RemoteFile> {
        let mut state = ConflictState::FirstAttempt;
        loop {
            match self.store.upload_file(folder, path).await {
                Ok(file) => {
                    self.progress.advance(&file.name, size);
                    info!("File {} uploaded", file.name);
                    return Ok(file);
                }
                Err(StoreError::Conflict { existing_id, .. }) => {
                    state.on_conflict(replace, path, &existing_id)?;
                    self.delete_file(path, existing_id).await?;
                }
                Err(e) => return Err(TransferError::store(path, e)),
            }
        }
    }

    async fn upload_large(&self, folder: &FolderId, path: &Path, size: u64, replace: bool) -> Result<RemoteFile> {
        let name = file_name(path)?;
        let mut state = ConflictState::FirstAttempt;
        let session = loop {
            match self.store.create_upload_session(folder, size, &name).await {
                Ok(session) => break session,
                Err(StoreError::Conflict { existing_id, .. }) => {
                    state.on_conflict(replace, path, &existing_id)?;
                    self.delete_file(path, existing_id).await?;
                }
                Err(e) => return Err(TransferError::store(path, e)),
            }
        };
        debug!(
            "Upload session {} for {}: {} parts of {} bytes",
            session.id, name, session.total_parts, session.part_size
        );

        let mut reader = tokio::fs::File::open(path)
            .await
            .map_err(|e| TransferError::io(path, e))?;
        let file = self.upload_parts(&session, &mut reader, path).await?;
        info!("File: {} uploaded", file.name);
        Ok(file)
    }

    /// Stream `reader` into `session` and commit it.
    ///
    /// Parts are uploaded strictly in offset order, which is also the order
    /// bytes are fed to the digest.
    async fn upload_parts<R>(&self, session: &UploadSession, reader: &mut R, path: &Path) -> Result<RemoteFile>
    where
        R: AsyncRead + Unpin + Send,
    {
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let mut hasher = Sha1::new();
        let mut parts = Vec::new();

        for index in 0..session.total_parts {
            let expected = session.part_len(index);
            let chunk = read_part(reader, expected)
                .await
                .map_err(|e| TransferError::io(path, e))?;
            if chunk.len() as u64 != expected || expected == 0 {
                return Err(TransferError::SourceChanged { path: path.to_path_buf() });
            }

            let offset = session.part_offset(index);
            let part = self
                .store
                .upload_part(session, &chunk, offset, session.file_size)
                .await
                .map_err(|e| TransferError::store(path, e))?;
            hasher.update(&chunk);
            self.progress.advance(&name, chunk.len() as u64);
            debug!("Uploaded part {}/{} of {}", index + 1, session.total_parts, name);
            parts.push(part);
        }

        let digest = ContentDigest::from(hasher);
        match self.store.commit_session(session, &digest, &parts).await {
            Ok(file) => Ok(file),
            Err(StoreError::Integrity(detail)) => Err(TransferError::Integrity {
                path: path.to_path_buf(),
                session: session.id.clone(),
                detail,
            }),
            Err(e) => Err(TransferError::store(path, e)),
        }
    }

    async fn delete_file(&self, path: &Path, existing_id: String) -> Result<()> {
        debug!("Replacing remote file {} ({})", path.display(), existing_id);
        self.store
            .delete_file(&FileId::new(existing_id))
            .await
            .map_err(|e| TransferError::store(path, e))
    }
}

/// Read up to `len` bytes, continuing across short reads until `len`
/// bytes were read or the reader hit end-of-file.
pub async fn read_part<R>(reader: &mut R, len: u64) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = Vec::with_capacity(len as usize);
    reader.take(len).read_to_end(&mut chunk).await?;
    Ok(chunk)
}

/// Non-hidden entries of `dir`, sorted by name.
async fn list_visible(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    let mut rd = tokio::fs::read_dir(dir).await.map_err(|e| TransferError::io(dir, e))?;
    while let Some(entry) = rd.next_entry().await.map_err(|e| TransferError::io(dir, e))? {
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        entries.push(entry.path());
    }
    entries.sort();
    Ok(entries)
}

fn file_name(path: &Path) -> Result<String> {
    path.canonicalize()
        .ok()
        .as_deref()
        .unwrap_or(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| TransferError::NotFound { path: path.to_path_buf() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use shipyard_core::PartDescriptor;
    use std::collections::HashSet;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        CreateFolder(String),
        DeleteFolder(String),
        UploadFile(String),
        DeleteFile(String),
        CreateSession(String, u64),
        UploadPart { offset: u64, len: usize, total: u64 },
        Commit { digest: ContentDigest, parts: usize },
    }

    /// Records every call; names listed in `conflicts` clash until deleted
    /// (or forever when listed in `sticky`).
    struct RecordingStore {
        part_size: u64,
        calls: Mutex<Vec<Call>>,
        conflicts: Mutex<HashSet<String>>,
        sticky: HashSet<String>,
        reject_digest: bool,
    }

    impl RecordingStore {
        fn new(part_size: u64) -> Self {
            Self {
                part_size,
                calls: Mutex::new(Vec::new()),
                conflicts: Mutex::new(HashSet::new()),
                sticky: HashSet::new(),
                reject_digest: false,
            }
        }

        fn with_conflict(self, name: &str) -> Self {
            self.conflicts.lock().unwrap().insert(name.to_string());
            self
        }

        fn with_sticky_conflict(mut self, name: &str) -> Self {
            self.sticky.insert(name.to_string());
            self.with_conflict(name)
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }

        fn check_conflict(&self, name: &str) -> crate::trait_::Result<()> {
            if self.conflicts.lock().unwrap().contains(name) {
                return Err(StoreError::Conflict {
                    name: name.to_string(),
                    existing_id: format!("existing-{name}"),
                });
            }
            Ok(())
        }

        fn resolve(&self, id: &str) {
            let name = id.trim_start_matches("existing-");
            if !self.sticky.contains(name) {
                self.conflicts.lock().unwrap().remove(name);
            }
        }
    }

    #[async_trait]
    impl ObjectStore for RecordingStore {
        async fn root_folder(&self) -> crate::trait_::Result<RemoteFolder> {
            Ok(RemoteFolder::new("0", "All Files"))
        }

        async fn create_folder(&self, _parent: &FolderId, name: &str) -> crate::trait_::Result<RemoteFolder> {
            self.record(Call::CreateFolder(name.to_string()));
            self.check_conflict(name)?;
            Ok(RemoteFolder::new(format!("folder-{name}"), name))
        }

        async fn delete_folder(&self, id: &FolderId) -> crate::trait_::Result<()> {
            self.record(Call::DeleteFolder(id.to_string()));
            self.resolve(id.as_str());
            Ok(())
        }

        async fn upload_file(&self, _folder: &FolderId, local_path: &Path) -> crate::trait_::Result<RemoteFile> {
            let name = local_path.file_name().unwrap().to_string_lossy().into_owned();
            self.record(Call::UploadFile(name.clone()));
            self.check_conflict(&name)?;
            let size = std::fs::metadata(local_path)?.len();
            Ok(RemoteFile { id: FileId::new(format!("file-{name}")), name, size })
        }

        async fn delete_file(&self, id: &FileId) -> crate::trait_::Result<()> {
            self.record(Call::DeleteFile(id.to_string()));
            self.resolve(id.as_str());
            Ok(())
        }

        async fn create_upload_session(
            &self,
            _folder: &FolderId,
            file_size: u64,
            file_name: &str,
        ) -> crate::trait_::Result<UploadSession> {
            self.record(Call::CreateSession(file_name.to_string(), file_size));
            self.check_conflict(file_name)?;
            Ok(UploadSession {
                id: SessionId::new(format!("session-{file_name}")),
                part_size: self.part_size,
                total_parts: file_size.div_ceil(self.part_size),
                file_size,
            })
        }

        async fn upload_part(
            &self,
            _session: &UploadSession,
            bytes: &[u8],
            offset: u64,
            total_size: u64,
        ) -> crate::trait_::Result<PartDescriptor> {
            self.record(Call::UploadPart { offset, len: bytes.len(), total: total_size });
            Ok(PartDescriptor {
                part_id: format!("{offset}"),
                offset,
                size: bytes.len() as u64,
                sha1: ContentDigest::of(bytes).to_base64(),
            })
        }

        async fn commit_session(
            &self,
            session: &UploadSession,
            digest: &ContentDigest,
            parts: &[PartDescriptor],
        ) -> crate::trait_::Result<RemoteFile> {
            self.record(Call::Commit { digest: *digest, parts: parts.len() });
            if self.reject_digest {
                return Err(StoreError::Integrity("sha1 mismatch".into()));
            }
            Ok(RemoteFile {
                id: FileId::new(format!("file-{}", session.id)),
                name: session.id.to_string(),
                size: session.file_size,
            })
        }
    }

    /// Hands out at most `step` bytes per read.
    struct FlakyReader {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl AsyncRead for FlakyReader {
        fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
            let end = (self.pos + self.step).min(self.data.len());
            let n = (end - self.pos).min(buf.remaining());
            let start = self.pos;
            buf.put_slice(&self.data[start..start + n]);
            self.pos += n;
            Poll::Ready(Ok(()))
        }
    }

    fn write_file(dir: &Path, name: &str, len: usize) -> PathBuf {
        let path = dir.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, data).unwrap();
        path
    }

    fn engine(store: &Arc<RecordingStore>, threshold: u64) -> TransferEngine {
        TransferEngine::new(store.clone()).with_chunk_threshold(threshold)
    }

    #[test]
    fn test_conflict_state_machine() {
        let path = Path::new("x");

        let mut state = ConflictState::FirstAttempt;
        assert!(matches!(state.on_conflict(false, path, "1"), Err(TransferError::AlreadyExists { .. })));

        let mut state = ConflictState::FirstAttempt;
        assert!(state.on_conflict(true, path, "1").is_ok());
        assert!(matches!(state.on_conflict(true, path, "1"), Err(TransferError::ConflictPersisted { .. })));
    }

    #[tokio::test]
    async fn test_threshold_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let below = write_file(dir.path(), "below", 99);
        let exact = write_file(dir.path(), "exact", 100);

        let store = Arc::new(RecordingStore::new(40));
        let report = engine(&store, 100).upload_to_root(&[below, exact], false).await.unwrap();

        assert_eq!(report.files.len(), 2);
        assert_eq!(report.bytes, 199);
        let calls = store.calls();
        assert_eq!(calls[0], Call::UploadFile("below".into()));
        assert_eq!(calls[1], Call::CreateSession("exact".into(), 100));
        assert!(!calls.contains(&Call::UploadFile("exact".into())));
    }

    #[tokio::test]
    async fn test_large_file_session_calls() {
        let dir = tempfile::tempdir().unwrap();
        let big = write_file(dir.path(), "big.bin", 25_000_000);
        let part_size = 8_388_608;

        let store = Arc::new(RecordingStore::new(part_size));
        engine(&store, DEFAULT_CHUNK_THRESHOLD)
            .upload_to_root(&[big.clone()], false)
            .await
            .unwrap();

        let calls = store.calls();
        let sessions = calls.iter().filter(|c| matches!(c, Call::CreateSession(..))).count();
        let parts: Vec<_> = calls
            .iter()
            .filter_map(|c| match c {
                Call::UploadPart { offset, len, total } => Some((*offset, *len, *total)),
                _ => None,
            })
            .collect();
        let commits: Vec<_> = calls.iter().filter(|c| matches!(c, Call::Commit { .. })).collect();

        assert_eq!(sessions, 1);
        assert_eq!(parts.len() as u64, 25_000_000u64.div_ceil(part_size));
        assert_eq!(parts[0], (0, part_size as usize, 25_000_000));
        assert_eq!(parts[1].0, part_size);
        assert_eq!(parts[2], (2 * part_size, 25_000_000 - 2 * part_size as usize, 25_000_000));
        assert_eq!(commits.len(), 1);

        let expected = ContentDigest::of(&std::fs::read(&big).unwrap());
        assert_eq!(commits[0], &Call::Commit { digest: expected, parts: 3 });
        assert!(matches!(calls.last(), Some(Call::Commit { .. })));
    }

    #[tokio::test]
    async fn test_short_reads_are_accumulated() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 7) as u8).collect();
        let mut reader = FlakyReader { data: data.clone(), pos: 0, step: 3 };

        let first = read_part(&mut reader, 400).await.unwrap();
        assert_eq!(first, data[..400]);

        let store = Arc::new(RecordingStore::new(400));
        let session = UploadSession {
            id: SessionId::new("s"),
            part_size: 400,
            total_parts: 3,
            file_size: 1000,
        };
        let mut reader = FlakyReader { data: data.clone(), pos: 0, step: 7 };
        engine(&store, 1)
            .upload_parts(&session, &mut reader, Path::new("flaky.bin"))
            .await
            .unwrap();

        let sizes: Vec<_> = store
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::UploadPart { offset, len, .. } => Some((offset, len)),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![(0, 400), (400, 400), (800, 200)]);
        assert!(store.calls().contains(&Call::Commit { digest: ContentDigest::of(&data), parts: 3 }));
    }

    #[tokio::test]
    async fn test_truncated_source_is_detected() {
        let store = Arc::new(RecordingStore::new(400));
        let session = UploadSession {
            id: SessionId::new("s"),
            part_size: 400,
            total_parts: 3,
            file_size: 1000,
        };
        let mut reader = FlakyReader { data: vec![1; 500], pos: 0, step: 64 };

        let err = engine(&store, 1)
            .upload_parts(&session, &mut reader, Path::new("shrunk.bin"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::SourceChanged { .. }));
        assert!(!store.calls().iter().any(|c| matches!(c, Call::Commit { .. })));
    }

    #[tokio::test]
    async fn test_digest_rejection_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let big = write_file(dir.path(), "big.bin", 300);
        let mut store = RecordingStore::new(128);
        store.reject_digest = true;
        let store = Arc::new(store);

        let err = engine(&store, 100).upload_to_root(&[big], false).await.unwrap_err();
        assert!(matches!(err, TransferError::Integrity { .. }));
        let commits = store.calls().iter().filter(|c| matches!(c, Call::Commit { .. })).count();
        assert_eq!(commits, 1);
    }

    #[tokio::test]
    async fn test_directory_upload_skips_dotfiles() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("project");
        write_file(&project, "a.txt", 10);
        write_file(&project, ".secret", 10);
        write_file(&project, "sub/b.txt", 10);
        write_file(&project, ".hidden/c.txt", 10);

        let store = Arc::new(RecordingStore::new(40));
        let report = engine(&store, 1000).upload_to_root(&[project], false).await.unwrap();

        assert_eq!(report.folders.len(), 2);
        assert_eq!(report.files.len(), 2);
        let calls = store.calls();
        assert_eq!(calls[0], Call::CreateFolder("project".into()));
        assert!(calls.contains(&Call::CreateFolder("sub".into())));
        assert!(calls.contains(&Call::UploadFile("a.txt".into())));
        assert!(calls.contains(&Call::UploadFile("b.txt".into())));
        assert!(!calls.contains(&Call::UploadFile(".secret".into())));
        assert!(!calls.contains(&Call::CreateFolder(".hidden".into())));
    }

    #[tokio::test]
    async fn test_folder_conflict_without_replace() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("project");
        write_file(&project, "a.txt", 10);

        let store = Arc::new(RecordingStore::new(40).with_conflict("project"));
        let err = engine(&store, 1000).upload_to_root(&[project], false).await.unwrap_err();

        match err {
            TransferError::AlreadyExists { remote_id, .. } => assert_eq!(remote_id, "existing-project"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!store.calls().iter().any(|c| matches!(c, Call::DeleteFolder(_))));
    }

    #[tokio::test]
    async fn test_folder_conflict_with_replace() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("project");
        write_file(&project, "a.txt", 10);

        let store = Arc::new(RecordingStore::new(40).with_conflict("project"));
        engine(&store, 1000).upload_to_root(&[project], true).await.unwrap();

        let calls = store.calls();
        assert_eq!(
            calls[..3],
            [
                Call::CreateFolder("project".into()),
                Call::DeleteFolder("existing-project".into()),
                Call::CreateFolder("project".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_file_conflict_retries_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_file(dir.path(), "report.csv", 10);

        let store = Arc::new(RecordingStore::new(40).with_sticky_conflict("report.csv"));
        let err = engine(&store, 1000).upload_to_root(&[file], true).await.unwrap_err();

        assert!(matches!(err, TransferError::ConflictPersisted { .. }));
        assert_eq!(
            store.calls(),
            vec![
                Call::UploadFile("report.csv".into()),
                Call::DeleteFile("existing-report.csv".into()),
                Call::UploadFile("report.csv".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_resolve_folder_reuses_existing() {
        let store = Arc::new(RecordingStore::new(40).with_sticky_conflict("runs"));
        let folder = engine(&store, 1000).resolve_folder("runs/abc123/").await.unwrap();

        assert_eq!(folder.id.as_str(), "folder-abc123");
        assert_eq!(
            store.calls(),
            vec![Call::CreateFolder("runs".into()), Call::CreateFolder("abc123".into())]
        );
    }

    #[tokio::test]
    async fn test_missing_path_aborts_before_upload() {
        let dir = tempfile::tempdir().unwrap();
        let present = write_file(dir.path(), "present", 10);

        let store = Arc::new(RecordingStore::new(40));
        let err = engine(&store, 1000)
            .upload_to_root(&[present, dir.path().join("absent")], false)
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::NotFound { .. }));
        assert!(store.calls().is_empty());
    }
}
