//! Dropbox destination: one folder that always holds the latest item.

use super::{Destination, UploadError, UploadReceipt, UploadRequest};
use crate::config::DropboxCredentials;
use crate::http::describe_ureq_error;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::{Value, json};
use std::cell::RefCell;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{info, warn};

const TOKEN_URL: &str = "https://api.dropboxapi.com/oauth2/token";
const API_URL: &str = "https://api.dropboxapi.com/2";
const CONTENT_URL: &str = "https://content.dropboxapi.com/2";
/// Files up to this size go through a single `files/upload` call.
pub const SINGLE_UPLOAD_LIMIT: u64 = 150 * 1024 * 1024;
pub const SESSION_CHUNK: u64 = 50 * 1024 * 1024;
pub const THUMBNAIL_NAME: &str = "thumbnail.jpg";

/// Where the Dropbox API lives.
#[derive(Debug, Clone)]
pub struct DropboxEndpoints {
    pub token: String,
    pub api: String,
    pub content: String,
}

impl Default for DropboxEndpoints {
    fn default() -> Self {
        Self {
            token: TOKEN_URL.to_string(),
            api: API_URL.to_string(),
            content: CONTENT_URL.to_string(),
        }
    }
}

pub struct DropboxDestination {
    credentials: DropboxCredentials,
    folder: String,
    api: ureq::Agent,
    transfer: ureq::Agent,
    endpoints: DropboxEndpoints,
    single_limit: u64,
    chunk: u64,
    token: RefCell<Option<String>>,
}

/// One call of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStep {
    Start,
    Append,
    Finish,
}

/// A session call carrying `len` bytes of the file from `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedChunk {
    pub step: SessionStep,
    pub offset: u64,
    pub len: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct ListFolderResponse {
    entries: Vec<ListEntry>,
    cursor: String,
    has_more: bool,
}

#[derive(Deserialize)]
struct ListEntry {
    path_display: Option<String>,
    path_lower: Option<String>,
}

#[derive(Deserialize)]
struct SessionStart {
    session_id: String,
}

impl DropboxDestination {
    pub fn new(
        credentials: DropboxCredentials,
        folder: String,
        api: ureq::Agent,
        transfer: ureq::Agent,
    ) -> Self {
        Self {
            credentials,
            folder,
            api,
            transfer,
            endpoints: DropboxEndpoints::default(),
            single_limit: SINGLE_UPLOAD_LIMIT,
            chunk: SESSION_CHUNK,
            token: RefCell::new(None),
        }
    }

    pub fn with_endpoints(mut self, endpoints: DropboxEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    fn access_token(&self) -> Result<String, UploadError> {
        if let Some(token) = self.token.borrow().as_ref() {
            return Ok(token.clone());
        }
        let basic = STANDARD.encode(format!(
            "{}:{}",
            self.credentials.app_key.expose(),
            self.credentials.app_secret.expose()
        ));
        let response: TokenResponse = self
            .api
            .post(&self.endpoints.token)
            .set("Authorization", &format!("Basic {basic}"))
            .send_form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", self.credentials.refresh_token.expose()),
            ])
            .map_err(|err| UploadError::Auth {
                service: "dropbox",
                message: describe_ureq_error(err),
            })?
            .into_json()
            .map_err(|err| UploadError::Auth {
                service: "dropbox",
                message: err.to_string(),
            })?;
        *self.token.borrow_mut() = Some(response.access_token.clone());
        Ok(response.access_token)
    }

    fn rpc(&self, endpoint: &'static str, body: Value) -> Result<Value, UploadError> {
        let token = self.access_token()?;
        self.api
            .post(&format!("{}/{endpoint}", self.endpoints.api))
            .set("Authorization", &format!("Bearer {token}"))
            .send_json(body)
            .map_err(|err| UploadError::http(endpoint, err))?
            .into_json()
            .map_err(|err| UploadError::protocol(endpoint, err))
    }

    fn content_call(
        &self,
        endpoint: &'static str,
        arg: &Value,
        bytes: &[u8],
    ) -> Result<Value, UploadError> {
        let token = self.access_token()?;
        let response = self
            .transfer
            .post(&format!("{}/{endpoint}", self.endpoints.content))
            .set("Authorization", &format!("Bearer {token}"))
            .set("Dropbox-API-Arg", &header_json(arg))
            .set("Content-Type", "application/octet-stream")
            .send_bytes(bytes)
            .map_err(|err| UploadError::http(endpoint, err))?;
        let body = response
            .into_string()
            .map_err(|err| UploadError::protocol(endpoint, err))?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|err| UploadError::protocol(endpoint, err))
    }

    fn list_folder(&self) -> Result<Vec<String>, UploadError> {
        let mut page: ListFolderResponse = serde_json::from_value(
            self.rpc("files/list_folder", json!({ "path": self.folder }))?,
        )
        .map_err(|err| UploadError::protocol("files/list_folder", err))?;
        let mut paths = Vec::new();
        loop {
            paths.extend(
                page.entries
                    .into_iter()
                    .filter_map(|entry| entry.path_display.or(entry.path_lower)),
            );
            if !page.has_more {
                return Ok(paths);
            }
            page = serde_json::from_value(
                self.rpc("files/list_folder/continue", json!({ "cursor": page.cursor }))?,
            )
            .map_err(|err| UploadError::protocol("files/list_folder/continue", err))?;
        }
    }

    /// Removes everything in the folder, creating it if it does not exist.
    /// Only a failed token exchange is an error; the rest is logged.
    fn clear_folder(&self) -> Result<(), UploadError> {
        let entries = match self.list_folder() {
            Ok(entries) => entries,
            Err(err @ UploadError::Auth { .. }) => return Err(err),
            Err(err) if is_path_not_found(&err) => {
                info!("{} does not exist yet; creating it", self.folder);
                if let Err(err) = self.rpc(
                    "files/create_folder_v2",
                    json!({ "path": self.folder, "autorename": false }),
                ) {
                    warn!("Could not create {}: {}", self.folder, err);
                }
                return Ok(());
            }
            Err(err) => {
                warn!("Could not list {}; leaving it as is: {}", self.folder, err);
                return Ok(());
            }
        };
        for path in entries {
            match self.rpc("files/delete_v2", json!({ "path": path })) {
                Ok(_) => info!("Deleted {}", path),
                Err(err) => warn!("Could not delete {}: {}", path, err),
            }
        }
        Ok(())
    }

    fn upload_file(&self, local: &Path, remote: &str) -> Result<(), UploadError> {
        let size = local
            .metadata()
            .map_err(|err| UploadError::io(local, err))?
            .len();
        let mut file = File::open(local).map_err(|err| UploadError::io(local, err))?;
        let commit = json!({
            "path": remote,
            "mode": "overwrite",
            "autorename": false,
            "mute": true,
        });

        if size <= self.single_limit {
            let mut bytes = Vec::with_capacity(size as usize);
            file.read_to_end(&mut bytes)
                .map_err(|err| UploadError::io(local, err))?;
            self.content_call("files/upload", &commit, &bytes)?;
            return Ok(());
        }

        info!(
            "Uploading {} in {} MiB chunks",
            local.display(),
            self.chunk / 1024 / 1024
        );
        let mut session_id = String::new();
        for planned in session_plan(size, self.chunk) {
            let bytes = read_chunk(&mut file, local, planned.len)?;
            if bytes.len() as u64 != planned.len {
                return Err(UploadError::protocol(
                    "files/upload_session/append_v2",
                    format!("{} shrank during upload", local.display()),
                ));
            }
            let cursor = json!({ "session_id": session_id, "offset": planned.offset });
            match planned.step {
                SessionStep::Start => {
                    let started: SessionStart = serde_json::from_value(self.content_call(
                        "files/upload_session/start",
                        &json!({ "close": false }),
                        &bytes,
                    )?)
                    .map_err(|err| UploadError::protocol("files/upload_session/start", err))?;
                    session_id = started.session_id;
                }
                SessionStep::Append => {
                    self.content_call(
                        "files/upload_session/append_v2",
                        &json!({ "cursor": cursor, "close": false }),
                        &bytes,
                    )?;
                }
                SessionStep::Finish => {
                    self.content_call(
                        "files/upload_session/finish",
                        &json!({ "cursor": cursor, "commit": commit }),
                        &bytes,
                    )?;
                }
            }
        }
        Ok(())
    }

    fn remote_path(&self, name: &str) -> String {
        format!("{}/{}", self.folder.trim_end_matches('/'), name)
    }
}

impl Destination for DropboxDestination {
    fn name(&self) -> &'static str {
        "dropbox"
    }

    fn prepare(&self) -> Result<(), UploadError> {
        info!("Clearing Dropbox folder {}", self.folder);
        self.clear_folder()
    }

    fn upload(&self, request: &UploadRequest<'_>) -> Result<UploadReceipt, UploadError> {
        let mut thumbnail_uploaded = false;
        if let Some(thumbnail) = request.thumbnail {
            let remote = self.remote_path(THUMBNAIL_NAME);
            match self.upload_file(thumbnail, &remote) {
                Ok(()) => {
                    info!("Uploaded thumbnail to {}", remote);
                    thumbnail_uploaded = true;
                }
                Err(err) => warn!("Thumbnail upload failed: {}", err),
            }
        }

        let remote = self.remote_path(&request.file_name());
        self.upload_file(request.video, &remote)?;
        info!("Uploaded {} to {}", request.id, remote);
        Ok(UploadReceipt {
            location: remote,
            thumbnail_uploaded,
        })
    }
}

/// Splits a session upload of `size` bytes into start, appends and finish.
/// The finish call carries the last chunk, even when `size` is an exact
/// multiple of `chunk`; it is empty only when everything fit in the start.
pub fn session_plan(size: u64, chunk: u64) -> Vec<PlannedChunk> {
    let chunk = chunk.max(1);
    let first = size.min(chunk);
    let mut plan = vec![PlannedChunk {
        step: SessionStep::Start,
        offset: 0,
        len: first,
    }];
    let mut offset = first;
    loop {
        let len = (size - offset).min(chunk);
        let step = if offset + len >= size {
            SessionStep::Finish
        } else {
            SessionStep::Append
        };
        plan.push(PlannedChunk { step, offset, len });
        offset += len;
        if step == SessionStep::Finish {
            return plan;
        }
    }
}

/// Dropbox reports a missing folder as a 409 whose summary starts with
/// `path/not_found`.
fn is_path_not_found(err: &UploadError) -> bool {
    matches!(err, UploadError::Http { message, .. } if message.contains("path/not_found"))
}

fn read_chunk(file: &mut File, path: &Path, len: u64) -> Result<Vec<u8>, UploadError> {
    let mut chunk = Vec::new();
    file.take(len)
        .read_to_end(&mut chunk)
        .map_err(|err| UploadError::io(path, err))?;
    Ok(chunk)
}

/// JSON for the `Dropbox-API-Arg` header. HTTP headers must stay ASCII, so
/// everything else is written as `\uXXXX` escapes (surrogate pairs above the
/// BMP).
pub fn header_json(value: &Value) -> String {
    let raw = value.to_string();
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii() {
            out.push(c);
            continue;
        }
        let mut units = [0u16; 2];
        for unit in c.encode_utf16(&mut units) {
            out.push_str(&format!("\\u{:04x}", unit));
        }
    }
    out
}
