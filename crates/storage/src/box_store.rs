//! Box.com object store.
//!
//! Talks to the Box content API directly over HTTPS with a bearer token.
//! Small files go through `files/content`; chunked uploads use Box upload
//! sessions, which verify every part and the whole file with SHA-1.

use std::path::Path;
use std::time::Duration;

use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shipyard_core::{FileId, FolderId, PartDescriptor, RemoteFile, RemoteFolder, SessionId, UploadSession};
use tracing::{debug, info};

use crate::digest::ContentDigest;
use crate::trait_::{ObjectStore, Result, StoreError};

const API_BASE: &str = "https://api.box.com/2.0";
const UPLOAD_BASE: &str = "https://upload.box.com/api/2.0";
const ROOT_FOLDER_ID: &str = "0";
/// How often a `202 Accepted` commit is polled before giving up.
const COMMIT_POLL_LIMIT: u32 = 10;

/// Credentials file contents (`~/.auth/box.yaml` by convention).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BoxCredentials {
    /// OAuth2 client id
    pub client_id: String,

    /// OAuth2 client secret
    pub client_secret: String,

    /// Developer or primary access token used as the bearer token
    pub primary_access_token: String,
}

impl BoxCredentials {
    /// Load credentials from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }
}

#[derive(Debug, Deserialize)]
struct BoxItem {
    id: String,
    name: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct Entries {
    entries: Vec<BoxItem>,
}

#[derive(Debug, Deserialize)]
struct SessionBody {
    id: String,
    part_size: u64,
    total_parts: u64,
}

#[derive(Debug, Deserialize)]
struct PartEnvelope {
    part: PartDescriptor,
}

/// [`ObjectStore`] implementation for Box.
pub struct BoxStore {
    client: Client,
    api_base: String,
    upload_base: String,
    token: String,
}

impl BoxStore {
    /// Create a store authenticating with `credentials`.
    pub fn new(credentials: &BoxCredentials) -> Self {
        Self {
            client: Client::new(),
            api_base: API_BASE.to_string(),
            upload_base: UPLOAD_BASE.to_string(),
            token: credentials.primary_access_token.clone(),
        }
    }

    /// Create a store from a credentials file.
    pub fn from_credentials_file(path: &Path) -> Result<Self> {
        Ok(Self::new(&BoxCredentials::from_file(path)?))
    }

    /// Point the store at different API hosts.
    pub fn with_base_urls(mut self, api_base: impl Into<String>, upload_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self.upload_base = upload_base.into();
        self
    }

    fn api(&self, path: &str) -> String {
        format!("{}/{}", self.api_base.trim_end_matches('/'), path)
    }

    fn upload(&self, path: &str) -> String {
        format!("{}/{}", self.upload_base.trim_end_matches('/'), path)
    }

    async fn first_entry(response: Response) -> Result<RemoteFile> {
        let mut body: Entries = response.json().await?;
        if body.entries.is_empty() {
            return Err(StoreError::Invalid("upload response has no entries".into()));
        }
        let item = body.entries.swap_remove(0);
        Ok(RemoteFile {
            id: FileId::new(item.id),
            name: item.name,
            size: item.size,
        })
    }
}

/// Pull the identifier of the clashing item out of a 409 body.
///
/// Box reports folder conflicts as a list and file conflicts as a single
/// object.
fn conflict_id(body: &Value) -> Option<String> {
    let conflicts = body.get("context_info")?.get("conflicts")?;
    let entry = match conflicts.as_array() {
        Some(list) => list.first()?,
        None => conflicts,
    };
    entry.get("id")?.as_str().map(str::to_string)
}

fn error_for(status: StatusCode, body: &Value, text: String, name: &str) -> StoreError {
    match status {
        StatusCode::CONFLICT => match conflict_id(body) {
            Some(existing_id) => StoreError::Conflict {
                name: name.to_string(),
                existing_id,
            },
            None => StoreError::Server {
                status: status.as_u16(),
                message: text,
            },
        },
        StatusCode::NOT_FOUND => StoreError::NotFound(name.to_string()),
        StatusCode::TOO_MANY_REQUESTS => StoreError::RateLimited,
        _ => StoreError::Server {
            status: status.as_u16(),
            message: body
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or(text),
        },
    }
}

async fn check(response: Response, name: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let body = serde_json::from_str(&text).unwrap_or(Value::Null);
    Err(error_for(status, &body, text, name))
}

#[async_trait::async_trait]
impl ObjectStore for BoxStore {
    async fn root_folder(&self) -> Result<RemoteFolder> {
        let response = self
            .client
            .get(self.api(&format!("folders/{ROOT_FOLDER_ID}")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let item: BoxItem = check(response, "root folder").await?.json().await?;
        Ok(RemoteFolder::new(item.id, item.name))
    }

    async fn create_folder(&self, parent: &FolderId, name: &str) -> Result<RemoteFolder> {
        let response = self
            .client
            .post(self.api("folders"))
            .bearer_auth(&self.token)
            .json(&json!({ "name": name, "parent": { "id": parent.as_str() } }))
            .send()
            .await?;
        let item: BoxItem = check(response, name).await?.json().await?;
        Ok(RemoteFolder::new(item.id, item.name))
    }

    async fn delete_folder(&self, id: &FolderId) -> Result<()> {
        let response = self
            .client
            .delete(self.api(&format!("folders/{id}")))
            .query(&[("recursive", "true")])
            .bearer_auth(&self.token)
            .send()
            .await?;
        check(response, &format!("folder {id}")).await?;
        Ok(())
    }

    async fn upload_file(&self, folder: &FolderId, local_path: &Path) -> Result<RemoteFile> {
        let name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| StoreError::Invalid(format!("no file name in {}", local_path.display())))?;
        let data = tokio::fs::read(local_path).await?;
        let attributes = json!({ "name": name, "parent": { "id": folder.as_str() } });
        let form = reqwest::multipart::Form::new()
            .text("attributes", attributes.to_string())
            .part("file", reqwest::multipart::Part::bytes(data).file_name(name.clone()));

        let response = self
            .client
            .post(self.upload("files/content"))
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await?;
        Self::first_entry(check(response, &name).await?).await
    }

    async fn delete_file(&self, id: &FileId) -> Result<()> {
        let response = self
            .client
            .delete(self.api(&format!("files/{id}")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        check(response, &format!("file {id}")).await?;
        Ok(())
    }

    async fn create_upload_session(&self, folder: &FolderId, file_size: u64, file_name: &str) -> Result<UploadSession> {
        let response = self
            .client
            .post(self.upload("files/upload_sessions"))
            .bearer_auth(&self.token)
            .json(&json!({
                "folder_id": folder.as_str(),
                "file_size": file_size,
                "file_name": file_name,
            }))
            .send()
            .await?;
        let body: SessionBody = check(response, file_name).await?.json().await?;
        debug!("Box upload session {} opened for {}", body.id, file_name);
        Ok(UploadSession {
            id: SessionId::new(body.id),
            part_size: body.part_size,
            total_parts: body.total_parts,
            file_size,
        })
    }

    async fn upload_part(&self, session: &UploadSession, bytes: &[u8], offset: u64, total_size: u64) -> Result<PartDescriptor> {
        let last = offset + (bytes.len() as u64).saturating_sub(1);
        let response = self
            .client
            .put(self.upload(&format!("files/upload_sessions/{}", session.id)))
            .bearer_auth(&self.token)
            .header("digest", format!("sha={}", ContentDigest::of(bytes).to_base64()))
            .header(CONTENT_RANGE, format!("bytes {offset}-{last}/{total_size}"))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await?;
        let envelope: PartEnvelope = check(response, &format!("session {}", session.id)).await?.json().await?;
        Ok(envelope.part)
    }

    async fn commit_session(&self, session: &UploadSession, digest: &ContentDigest, parts: &[PartDescriptor]) -> Result<RemoteFile> {
        let url = self.upload(&format!("files/upload_sessions/{}/commit", session.id));
        let name = format!("session {}", session.id);

        for attempt in 1..=COMMIT_POLL_LIMIT {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.token)
                .header("digest", format!("sha={}", digest.to_base64()))
                .json(&json!({ "parts": parts }))
                .send()
                .await?;

            match response.status() {
                StatusCode::ACCEPTED => {
                    let wait = response
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(1);
                    debug!("Commit of {} still processing (attempt {}), retrying in {}s", name, attempt, wait);
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                }
                StatusCode::PRECONDITION_FAILED | StatusCode::UNPROCESSABLE_ENTITY => {
                    let detail = response.text().await.unwrap_or_default();
                    return Err(StoreError::Integrity(detail));
                }
                _ => {
                    let file = Self::first_entry(check(response, &name).await?).await?;
                    info!("Box upload session {} committed as file {}", session.id, file.id);
                    return Ok(file);
                }
            }
        }

        Err(StoreError::Server {
            status: StatusCode::ACCEPTED.as_u16(),
            message: format!("commit of {name} did not finish after {COMMIT_POLL_LIMIT} attempts"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{TransferEngine, TransferError};
    use httpmock::prelude::*;
    use std::sync::Arc;

    fn store_for(server: &MockServer) -> BoxStore {
        let credentials = BoxCredentials {
            client_id: "id".into(),
            client_secret: "secret".into(),
            primary_access_token: "token".into(),
        };
        BoxStore::new(&credentials).with_base_urls(server.base_url(), server.base_url())
    }

    #[test]
    fn test_credentials_from_yaml() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("box.yaml");
        std::fs::write(&path, "client_id: a\nclient_secret: b\nprimary_access_token: c\n").unwrap();

        let credentials = BoxCredentials::from_file(&path).unwrap();
        assert_eq!(credentials.primary_access_token, "c");
    }

    #[test]
    fn test_conflict_id_shapes() {
        let folder = json!({"context_info": {"conflicts": [{"id": "12", "type": "folder"}]}});
        let file = json!({"context_info": {"conflicts": {"id": "34", "type": "file"}}});
        assert_eq!(conflict_id(&folder).as_deref(), Some("12"));
        assert_eq!(conflict_id(&file).as_deref(), Some("34"));
        assert_eq!(conflict_id(&json!({})), None);
    }

    #[tokio::test]
    async fn test_root_folder_uses_bearer_token() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(GET).path("/folders/0").header("authorization", "Bearer token");
            then.status(200).json_body(json!({"id": "0", "name": "All Files"}));
        });

        let root = store_for(&server).root_folder().await.unwrap();
        mock.assert();
        assert_eq!(root, RemoteFolder::new("0", "All Files"));
    }

    #[tokio::test]
    async fn test_folder_conflict_maps_to_existing_id() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/folders");
            then.status(409).json_body(json!({
                "type": "error",
                "code": "item_name_in_use",
                "context_info": {"conflicts": [{"type": "folder", "id": "555"}]}
            }));
        });

        let err = store_for(&server)
            .create_folder(&FolderId::new("0"), "runs")
            .await
            .unwrap_err();
        match err {
            StoreError::Conflict { name, existing_id } => {
                assert_eq!(name, "runs");
                assert_eq!(existing_id, "555");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(DELETE).path("/files/1");
            then.status(404);
        });
        server.mock(|when, then| {
            when.method(DELETE).path("/files/2");
            then.status(429);
        });
        server.mock(|when, then| {
            when.method(DELETE).path("/files/3");
            then.status(500).json_body(json!({"message": "boom"}));
        });

        let store = store_for(&server);
        assert!(matches!(store.delete_file(&FileId::new("1")).await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete_file(&FileId::new("2")).await, Err(StoreError::RateLimited)));
        match store.delete_file(&FileId::new("3")).await {
            Err(StoreError::Server { status, message }) => {
                assert_eq!(status, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_delete_folder_is_recursive() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(DELETE).path("/folders/9").query_param("recursive", "true");
            then.status(204);
        });

        store_for(&server).delete_folder(&FolderId::new("9")).await.unwrap();
        mock.assert();
    }

    #[tokio::test]
    async fn test_commit_digest_rejection() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/files/upload_sessions/S1/commit");
            then.status(412).body("sha1 mismatch");
        });

        let session = UploadSession {
            id: SessionId::new("S1"),
            part_size: 4,
            total_parts: 1,
            file_size: 4,
        };
        let err = store_for(&server)
            .commit_session(&session, &ContentDigest::of(b"abcd"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Integrity(detail) if detail == "sha1 mismatch"));
    }

    #[tokio::test]
    async fn test_chunked_upload_through_engine() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data.bin");
        let data = b"0123456789".to_vec();
        std::fs::write(&path, &data).unwrap();

        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/folders/0");
            then.status(200).json_body(json!({"id": "0", "name": "All Files"}));
        });
        let session = server.mock(|when, then| {
            when.method(POST).path("/files/upload_sessions").json_body(json!({
                "folder_id": "0",
                "file_size": 10,
                "file_name": "data.bin"
            }));
            then.status(201).json_body(json!({"id": "S1", "part_size": 4, "total_parts": 3}));
        });
        let parts: Vec<_> = [(0, "0123"), (4, "4567"), (8, "89")]
            .into_iter()
            .map(|(offset, chunk)| {
                let last = offset + chunk.len() - 1;
                let range = format!("bytes {offset}-{last}/10");
                let digest = format!("sha={}", ContentDigest::of(chunk.as_bytes()).to_base64());
                server.mock(move |when, then| {
                    when.method(PUT)
                        .path("/files/upload_sessions/S1")
                        .header("content-range", range.as_str())
                        .header("digest", digest.as_str())
                        .body(chunk);
                    then.status(200).json_body(json!({"part": {
                        "part_id": format!("P{offset}"),
                        "offset": offset,
                        "size": chunk.len(),
                        "sha1": ""
                    }}));
                })
            })
            .collect();
        let whole = format!("sha={}", ContentDigest::of(&data).to_base64());
        let commit = server.mock(|when, then| {
            when.method(POST)
                .path("/files/upload_sessions/S1/commit")
                .header("digest", whole.as_str());
            then.status(201)
                .json_body(json!({"entries": [{"id": "F1", "name": "data.bin", "size": 10}]}));
        });

        let engine = TransferEngine::new(Arc::new(store_for(&server))).with_chunk_threshold(5);
        let report = engine.upload_to_root(&[path], false).await.unwrap();

        session.assert();
        for part in &parts {
            part.assert();
        }
        commit.assert();
        assert_eq!(report.files[0].id.as_str(), "F1");
    }

    #[tokio::test]
    async fn test_small_file_conflict_replaced_once() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("notes.txt");
        std::fs::write(&path, b"hi").unwrap();

        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/folders/0");
            then.status(200).json_body(json!({"id": "0", "name": "All Files"}));
        });
        let upload = server.mock(|when, then| {
            when.method(POST).path("/files/content");
            then.status(409)
                .json_body(json!({"context_info": {"conflicts": {"id": "77", "type": "file"}}}));
        });
        let delete = server.mock(|when, then| {
            when.method(DELETE).path("/files/77");
            then.status(204);
        });

        let engine = TransferEngine::new(Arc::new(store_for(&server)));
        let err = engine.upload_to_root(&[path], true).await.unwrap_err();

        assert!(matches!(err, TransferError::ConflictPersisted { .. }));
        upload.assert_hits(2);
        delete.assert_hits(1);
    }
}
