//! Object store backed by a local directory.
//!
//! Folder and file identifiers are paths relative to the store root, with
//! `.` naming the root itself. Upload sessions stage their parts in a
//! hidden `.shipyard-sessions` directory and move the finished file into
//! place on commit.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};

use sha1::{Digest, Sha1};
use shipyard_core::{FileId, FolderId, PartDescriptor, RemoteFile, RemoteFolder, SessionId, UploadSession};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::digest::ContentDigest;
use crate::trait_::{ObjectStore, Result, StoreError};

const SESSIONS_DIR: &str = ".shipyard-sessions";

// read buffer for verifying staged files
const HASH_BUFFER: usize = 64 * 1024;

/// Part size used for upload sessions unless configured otherwise.
pub const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;

struct StagedUpload {
    folder: PathBuf,
    name: String,
    staging: PathBuf,
    session: UploadSession,
    // offset -> length
    received: BTreeMap<u64, u64>,
}

/// Directory-backed [`ObjectStore`].
pub struct LocalStore {
    root: PathBuf,
    part_size: u64,
    sessions: Mutex<HashMap<SessionId, StagedUpload>>,
}

impl LocalStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            part_size: DEFAULT_PART_SIZE,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Use `part_size` bytes per upload-session part.
    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    /// Directory the store writes into.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, id: &str) -> Result<PathBuf> {
        let relative = Path::new(id);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(StoreError::Invalid(format!("invalid object id: {id}")));
        }
        Ok(self.root.join(relative))
    }

    fn id_for(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.to_string_lossy().into_owned(),
            Err(_) => path.to_string_lossy().into_owned(),
        }
    }

    async fn folder_path(&self, id: &FolderId) -> Result<PathBuf> {
        let path = self.resolve(id.as_str())?;
        if !fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(StoreError::NotFound(format!("folder {id}")));
        }
        Ok(path)
    }

    async fn ensure_free(&self, target: &Path, name: &str) -> Result<()> {
        if fs::symlink_metadata(target).await.is_ok() {
            return Err(StoreError::Conflict {
                name: name.to_string(),
                existing_id: self.id_for(target),
            });
        }
        Ok(())
    }
}

fn check_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(StoreError::Invalid(format!("invalid object name: {name}"))),
    }
}

#[async_trait::async_trait]
impl ObjectStore for LocalStore {
    async fn root_folder(&self) -> Result<RemoteFolder> {
        let name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(RemoteFolder::new(".", name))
    }

    async fn create_folder(&self, parent: &FolderId, name: &str) -> Result<RemoteFolder> {
        check_name(name)?;
        let target = self.folder_path(parent).await?.join(name);
        self.ensure_free(&target, name).await?;
        fs::create_dir(&target).await?;
        debug!("Created folder {}", target.display());
        Ok(RemoteFolder::new(self.id_for(&target), name))
    }

    async fn delete_folder(&self, id: &FolderId) -> Result<()> {
        if id.as_str() == "." {
            return Err(StoreError::Invalid("refusing to delete the store root".into()));
        }
        let path = self.folder_path(id).await?;
        fs::remove_dir_all(&path).await?;
        Ok(())
    }

    async fn upload_file(&self, folder: &FolderId, local_path: &Path) -> Result<RemoteFile> {
        let name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| StoreError::Invalid(format!("no file name in {}", local_path.display())))?;
        let target = self.folder_path(folder).await?.join(&name);
        self.ensure_free(&target, &name).await?;
        let size = fs::copy(local_path, &target).await?;
        Ok(RemoteFile {
            id: FileId::new(self.id_for(&target)),
            name,
            size,
        })
    }

    async fn delete_file(&self, id: &FileId) -> Result<()> {
        let path = self.resolve(id.as_str())?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(format!("file {id}"))),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_upload_session(&self, folder: &FolderId, file_size: u64, file_name: &str) -> Result<UploadSession> {
        check_name(file_name)?;
        let folder = self.folder_path(folder).await?;
        self.ensure_free(&folder.join(file_name), file_name).await?;

        let id = SessionId::new(ulid::Ulid::new().to_string());
        let sessions_dir = self.root.join(SESSIONS_DIR);
        fs::create_dir_all(&sessions_dir).await?;
        let staging = sessions_dir.join(format!("{id}.part"));
        let file = fs::File::create(&staging).await?;
        file.set_len(file_size).await?;

        let session = UploadSession {
            id: id.clone(),
            part_size: self.part_size,
            total_parts: file_size.div_ceil(self.part_size),
            file_size,
        };
        self.sessions.lock().await.insert(
            id,
            StagedUpload {
                folder,
                name: file_name.to_string(),
                staging,
                session: session.clone(),
                received: BTreeMap::new(),
            },
        );
        Ok(session)
    }

    async fn upload_part(&self, session: &UploadSession, bytes: &[u8], offset: u64, total_size: u64) -> Result<PartDescriptor> {
        let mut sessions = self.sessions.lock().await;
        let staged = sessions
            .get_mut(&session.id)
            .ok_or_else(|| StoreError::NotFound(format!("upload session {}", session.id)))?;

        let expected = &staged.session;
        if total_size != expected.file_size || offset % expected.part_size != 0 {
            return Err(StoreError::Invalid(format!(
                "part at {offset} does not fit session {}",
                expected.id
            )));
        }
        let index = offset / expected.part_size;
        if index >= expected.total_parts || bytes.len() as u64 != expected.part_len(index) {
            return Err(StoreError::Invalid(format!(
                "part {index} of session {} has {} bytes, expected {}",
                expected.id,
                bytes.len(),
                expected.part_len(index)
            )));
        }

        let mut file = fs::OpenOptions::new().write(true).open(&staged.staging).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        staged.received.insert(offset, bytes.len() as u64);

        Ok(PartDescriptor {
            part_id: format!("{index:08}"),
            offset,
            size: bytes.len() as u64,
            sha1: ContentDigest::of(bytes).to_base64(),
        })
    }

    async fn commit_session(&self, session: &UploadSession, digest: &ContentDigest, parts: &[PartDescriptor]) -> Result<RemoteFile> {
        let staged = self
            .sessions
            .lock()
            .await
            .remove(&session.id)
            .ok_or_else(|| StoreError::NotFound(format!("upload session {}", session.id)))?;

        let target = staged.folder.join(&staged.name);
        let checked = match finish(&staged, digest, parts).await {
            Ok(()) => self.ensure_free(&target, &staged.name).await,
            Err(e) => Err(e),
        };
        // the session is gone, so nothing else will clean up its staging file
        if let Err(e) = checked {
            let _ = fs::remove_file(&staged.staging).await;
            return Err(e);
        }
        fs::rename(&staged.staging, &target).await?;
        Ok(RemoteFile {
            id: FileId::new(self.id_for(&target)),
            name: staged.name,
            size: staged.session.file_size,
        })
    }
}

/// Check that every byte was received and that the content matches `digest`.
async fn finish(staged: &StagedUpload, digest: &ContentDigest, parts: &[PartDescriptor]) -> Result<()> {
    let mut covered = 0u64;
    for (offset, len) in &staged.received {
        if *offset != covered {
            return Err(StoreError::Integrity(format!("missing bytes at offset {covered}")));
        }
        covered += len;
    }
    if covered != staged.session.file_size {
        return Err(StoreError::Integrity(format!(
            "received {covered} of {} bytes",
            staged.session.file_size
        )));
    }
    if parts.len() != staged.received.len() {
        return Err(StoreError::Integrity(format!(
            "commit lists {} parts, {} were uploaded",
            parts.len(),
            staged.received.len()
        )));
    }

    let mut file = fs::File::open(&staged.staging).await?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; HASH_BUFFER];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let actual = ContentDigest::from(hasher);
    if actual != *digest {
        return Err(StoreError::Integrity(format!("sha1 mismatch: expected {digest}, got {actual}")));
    }
    Ok(())
}
