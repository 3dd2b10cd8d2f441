//! YouTube destination using the resumable upload protocol.

use super::{Destination, UploadError, UploadReceipt, UploadRequest, content_type_for};
use crate::config::YoutubeCredentials;
use crate::http::describe_ureq_error;
use serde::Deserialize;
use serde_json::{Value, json};
use std::cell::RefCell;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, info, warn};

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const UPLOAD_URL: &str =
    "https://www.googleapis.com/upload/youtube/v3/videos?uploadType=resumable&part=snippet,status";
const THUMBNAIL_URL: &str = "https://www.googleapis.com/upload/youtube/v3/thumbnails/set";
/// Must be a multiple of 256 KiB.
pub const UPLOAD_CHUNK: u64 = 8 * 1024 * 1024;
const MAX_TITLE_CHARS: usize = 100;
const CATEGORY_PEOPLE_AND_BLOGS: &str = "22";

#[derive(Debug, Clone)]
pub struct YoutubeEndpoints {
    pub token: String,
    /// Opens a resumable session.
    pub upload: String,
    pub thumbnail: String,
}

impl Default for YoutubeEndpoints {
    fn default() -> Self {
        Self {
            token: TOKEN_URL.to_string(),
            upload: UPLOAD_URL.to_string(),
            thumbnail: THUMBNAIL_URL.to_string(),
        }
    }
}

pub struct YoutubeDestination {
    credentials: YoutubeCredentials,
    privacy: String,
    api: ureq::Agent,
    transfer: ureq::Agent,
    endpoints: YoutubeEndpoints,
    chunk: u64,
    token: RefCell<Option<String>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct VideoResource {
    id: String,
}

/// What the server said after one chunk.
#[derive(Debug, PartialEq, Eq)]
enum ChunkStatus {
    /// More bytes expected, starting at this offset.
    Incomplete(u64),
    Complete(String),
}

impl YoutubeDestination {
    pub fn new(
        credentials: YoutubeCredentials,
        privacy: String,
        api: ureq::Agent,
        transfer: ureq::Agent,
    ) -> Self {
        Self {
            credentials,
            privacy,
            api,
            transfer,
            endpoints: YoutubeEndpoints::default(),
            chunk: UPLOAD_CHUNK,
            token: RefCell::new(None),
        }
    }

    pub fn with_endpoints(mut self, endpoints: YoutubeEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    fn access_token(&self) -> Result<String, UploadError> {
        if let Some(token) = self.token.borrow().as_ref() {
            return Ok(token.clone());
        }
        let response: TokenResponse = self
            .api
            .post(&self.endpoints.token)
            .send_form(&[
                ("client_id", self.credentials.client_id.expose()),
                ("client_secret", self.credentials.client_secret.expose()),
                ("refresh_token", self.credentials.refresh_token.expose()),
                ("grant_type", "refresh_token"),
            ])
            .map_err(|err| UploadError::Auth {
                service: "youtube",
                message: describe_ureq_error(err),
            })?
            .into_json()
            .map_err(|err| UploadError::Auth {
                service: "youtube",
                message: err.to_string(),
            })?;
        *self.token.borrow_mut() = Some(response.access_token.clone());
        Ok(response.access_token)
    }

    /// Opens a resumable session and returns its upload URL.
    fn start_session(
        &self,
        request: &UploadRequest<'_>,
        size: u64,
        content_type: &str,
    ) -> Result<String, UploadError> {
        let token = self.access_token()?;
        let response = self
            .api
            .post(&self.endpoints.upload)
            .set("Authorization", &format!("Bearer {token}"))
            .set("X-Upload-Content-Type", content_type)
            .set("X-Upload-Content-Length", &size.to_string())
            .send_json(video_metadata(request, &self.privacy))
            .map_err(|err| UploadError::http("videos.insert", err))?;
        response
            .header("Location")
            .map(str::to_string)
            .ok_or_else(|| UploadError::protocol("videos.insert", "no Location header"))
    }

    fn send_chunk(
        &self,
        session: &str,
        bytes: &[u8],
        offset: u64,
        total: u64,
        content_type: &str,
    ) -> Result<ChunkStatus, UploadError> {
        let token = self.access_token()?;
        let last = offset + bytes.len() as u64 - 1;
        let result = self
            .transfer
            .put(session)
            .set("Authorization", &format!("Bearer {token}"))
            .set("Content-Type", content_type)
            .set("Content-Range", &format!("bytes {offset}-{last}/{total}"))
            .send_bytes(bytes);
        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(308, response)) => response,
            Err(err) => return Err(UploadError::http("resumable upload", err)),
        };
        if response.status() == 308 {
            let next = next_offset(response.header("Range"));
            debug!("Upload session acknowledged {} bytes", next);
            return Ok(ChunkStatus::Incomplete(next));
        }
        let video: VideoResource = response
            .into_json()
            .map_err(|err| UploadError::protocol("resumable upload", err))?;
        Ok(ChunkStatus::Complete(video.id))
    }

    fn upload_video(&self, request: &UploadRequest<'_>) -> Result<String, UploadError> {
        let video = request.video;
        let size = fs::metadata(video)
            .map_err(|err| UploadError::io(video, err))?
            .len();
        if size == 0 {
            return Err(UploadError::protocol("resumable upload", "video is empty"));
        }
        let content_type = content_type_for(video);
        let session = self.start_session(request, size, &content_type)?;

        let mut file = File::open(video).map_err(|err| UploadError::io(video, err))?;
        let mut offset = 0u64;
        loop {
            file.seek(SeekFrom::Start(offset))
                .map_err(|err| UploadError::io(video, err))?;
            let mut chunk = Vec::new();
            (&mut file)
                .take(self.chunk)
                .read_to_end(&mut chunk)
                .map_err(|err| UploadError::io(video, err))?;
            if chunk.is_empty() {
                return Err(UploadError::protocol(
                    "resumable upload",
                    "server expects bytes past the end of the file",
                ));
            }
            match self.send_chunk(&session, &chunk, offset, size, &content_type)? {
                ChunkStatus::Complete(id) => return Ok(id),
                ChunkStatus::Incomplete(next) if next > offset => offset = next,
                ChunkStatus::Incomplete(_) => {
                    return Err(UploadError::protocol(
                        "resumable upload",
                        format!("no progress at offset {offset}"),
                    ));
                }
            }
        }
    }

    fn set_thumbnail(&self, video_id: &str, thumbnail: &Path) -> Result<(), UploadError> {
        let bytes = fs::read(thumbnail).map_err(|err| UploadError::io(thumbnail, err))?;
        let token = self.access_token()?;
        self.api
            .post(&self.endpoints.thumbnail)
            .query("videoId", video_id)
            .set("Authorization", &format!("Bearer {token}"))
            .set("Content-Type", &content_type_for(thumbnail))
            .send_bytes(&bytes)
            .map_err(|err| UploadError::http("thumbnails.set", err))?;
        Ok(())
    }
}

impl Destination for YoutubeDestination {
    fn name(&self) -> &'static str {
        "youtube"
    }

    fn prepare(&self) -> Result<(), UploadError> {
        Ok(())
    }

    fn upload(&self, request: &UploadRequest<'_>) -> Result<UploadReceipt, UploadError> {
        let video_id = self.upload_video(request)?;
        info!("Uploaded {} as YouTube video {}", request.id, video_id);

        let thumbnail_uploaded = match request.thumbnail {
            Some(thumbnail) => match self.set_thumbnail(&video_id, thumbnail) {
                Ok(()) => true,
                Err(err) => {
                    warn!("Thumbnail upload failed: {}", err);
                    false
                }
            },
            None => false,
        };
        Ok(UploadReceipt {
            location: video_id,
            thumbnail_uploaded,
        })
    }
}

fn video_metadata(request: &UploadRequest<'_>, privacy: &str) -> Value {
    json!({
        "snippet": {
            "title": video_title(request.title, request.id),
            "description": format!("Source: {}", request.source_url),
            "categoryId": CATEGORY_PEOPLE_AND_BLOGS,
        },
        "status": {
            "privacyStatus": privacy,
            "selfDeclaredMadeForKids": false,
        },
    })
}

/// Titles may not contain angle brackets and are capped at 100 characters.
fn video_title(title: &str, id: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| !matches!(c, '<' | '>'))
        .take(MAX_TITLE_CHARS)
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        id.to_string()
    } else {
        cleaned.to_string()
    }
}

/// Parses `Range: bytes=0-N` into the next offset. A missing header means
/// nothing was stored yet.
fn next_offset(range: Option<&str>) -> u64 {
    range
        .and_then(|value| value.trim().strip_prefix("bytes="))
        .and_then(|span| span.split('-').nth(1))
        .and_then(|end| end.trim().parse::<u64>().ok())
        .map_or(0, |end| end + 1)
}
