//! Upload destinations.
//!
//! A [`Destination`] receives one finished item at a time. `prepare` runs once
//! before the first upload of a run.

pub mod dropbox;
pub mod youtube;

use crate::config::DestinationConfig;
use crate::http::{api_agent, classify_ureq_error, describe_ureq_error, transfer_agent};
use crate::ytdlp::Diagnosis;
use std::path::Path;
use thiserror::Error;

pub use dropbox::DropboxDestination;
pub use youtube::YoutubeDestination;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("authentication with {service} failed: {message}")]
    Auth {
        service: &'static str,
        message: String,
    },
    #[error("{operation} failed: {message}")]
    Http {
        operation: &'static str,
        diagnosis: Diagnosis,
        message: String,
    },
    #[error("{operation} returned an unexpected response: {detail}")]
    Protocol {
        operation: &'static str,
        detail: String,
    },
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl UploadError {
    pub(crate) fn http(operation: &'static str, err: ureq::Error) -> Self {
        let diagnosis = classify_ureq_error(&err);
        UploadError::Http {
            operation,
            diagnosis,
            message: describe_ureq_error(err),
        }
    }

    pub(crate) fn protocol(operation: &'static str, detail: impl ToString) -> Self {
        UploadError::Protocol {
            operation,
            detail: detail.to_string(),
        }
    }

    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        UploadError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// One finished item ready to leave the machine.
#[derive(Debug, Clone, Copy)]
pub struct UploadRequest<'a> {
    pub id: &'a str,
    pub title: &'a str,
    pub source_url: &'a str,
    pub video: &'a Path,
    pub thumbnail: Option<&'a Path>,
}

impl UploadRequest<'_> {
    /// Remote file name: the local file name, or the id when the path has none.
    pub fn file_name(&self) -> String {
        self.video
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.mp4", self.id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Remote path or video id.
    pub location: String,
    pub thumbnail_uploaded: bool,
}

pub trait Destination {
    fn name(&self) -> &'static str;

    /// Resets the destination before the first upload of a run.
    fn prepare(&self) -> Result<(), UploadError>;

    fn upload(&self, request: &UploadRequest<'_>) -> Result<UploadReceipt, UploadError>;
}

pub fn build_destination(config: &DestinationConfig, user_agent: &str) -> Box<dyn Destination> {
    let api = api_agent(user_agent);
    let transfer = transfer_agent(user_agent);
    match config {
        DestinationConfig::Dropbox {
            folder,
            credentials,
        } => Box::new(DropboxDestination::new(
            credentials.clone(),
            folder.clone(),
            api,
            transfer,
        )),
        DestinationConfig::Youtube {
            privacy,
            credentials,
        } => Box::new(YoutubeDestination::new(
            credentials.clone(),
            privacy.clone(),
            api,
            transfer,
        )),
    }
}

/// Content type for a local file, defaulting to octet-stream.
pub(crate) fn content_type_for(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;
    use std::collections::{HashMap, HashSet};
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::{Arc, Mutex};
    use std::thread;

    /// One request as seen by [`StubServer`].
    #[derive(Debug, Clone)]
    pub struct StubRequest {
        pub method: String,
        /// Path without the query string.
        pub path: String,
        pub query: String,
        /// Header names are lowercased.
        pub headers: HashMap<String, String>,
        pub body: Vec<u8>,
    }

    impl StubRequest {
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers.get(name).map(String::as_str)
        }

        pub fn json_header(&self, name: &str) -> serde_json::Value {
            serde_json::from_str(self.header(name).unwrap_or("null")).unwrap()
        }
    }

    #[derive(Debug, Clone)]
    pub struct StubResponse {
        pub status: u16,
        pub headers: Vec<(String, String)>,
        pub body: String,
    }

    impl StubResponse {
        pub fn json(status: u16, body: serde_json::Value) -> Self {
            Self {
                status,
                headers: vec![("Content-Type".into(), "application/json".into())],
                body: body.to_string(),
            }
        }

        pub fn empty(status: u16) -> Self {
            Self {
                status,
                headers: Vec::new(),
                body: String::new(),
            }
        }

        pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
            self.headers.push((name.to_string(), value.into()));
            self
        }
    }

    type Handler = dyn Fn(&StubRequest) -> StubResponse + Send + Sync;

    /// Minimal HTTP/1.1 server on a loopback port. Requests are answered one
    /// at a time with `Connection: close` and recorded in order.
    pub struct StubServer {
        pub base: String,
        requests: Arc<Mutex<Vec<StubRequest>>>,
    }

    impl StubServer {
        pub fn start(
            handler: impl Fn(&StubRequest) -> StubResponse + Send + Sync + 'static,
        ) -> Self {
            let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
            let base = format!("http://{}", listener.local_addr().unwrap());
            let requests = Arc::new(Mutex::new(Vec::new()));
            let recorded = Arc::clone(&requests);
            let handler: Arc<Handler> = Arc::new(handler);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { break };
                    serve(stream, handler.as_ref(), &recorded);
                }
            });
            Self { base, requests }
        }

        pub fn url(&self, path: &str) -> String {
            format!("{}{}", self.base, path)
        }

        pub fn requests(&self) -> Vec<StubRequest> {
            self.requests.lock().unwrap().clone()
        }

        pub fn paths(&self) -> Vec<String> {
            self.requests().into_iter().map(|request| request.path).collect()
        }
    }

    /// Requests are recorded before the response goes out, so a caller that
    /// has its answer always finds its request in the log.
    fn serve(
        stream: TcpStream,
        handler: &Handler,
        recorded: &Mutex<Vec<StubRequest>>,
    ) -> Option<()> {
        let mut reader = BufReader::new(stream.try_clone().ok()?);
        let mut line = String::new();
        reader.read_line(&mut line).ok()?;
        let mut parts = line.split_whitespace();
        let method = parts.next()?.to_string();
        let target = parts.next()?.to_string();
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (target, String::new()),
        };

        let mut headers = HashMap::new();
        loop {
            let mut header = String::new();
            reader.read_line(&mut header).ok()?;
            let header = header.trim_end();
            if header.is_empty() {
                break;
            }
            if let Some((name, value)) = header.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }
        let length = headers
            .get("content-length")
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(0);
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).ok()?;

        let request = StubRequest {
            method,
            path,
            query,
            headers,
            body,
        };
        let response = handler(&request);
        recorded.lock().unwrap().push(request);
        let mut out = format!(
            "HTTP/1.1 {} Stub\r\nContent-Length: {}\r\nConnection: close\r\n",
            response.status,
            response.body.len()
        );
        for (name, value) in &response.headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        out.push_str("\r\n");
        out.push_str(&response.body);
        let mut stream = stream;
        stream.write_all(out.as_bytes()).ok()?;
        stream.flush().ok()
    }

    /// Accepts uploads except for the listed ids.
    #[derive(Default)]
    pub struct FakeDestination {
        pub reject: HashSet<String>,
        pub uploads: RefCell<Vec<(String, String, bool)>>,
        pub prepared: RefCell<usize>,
    }

    impl Destination for FakeDestination {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn prepare(&self) -> Result<(), UploadError> {
            *self.prepared.borrow_mut() += 1;
            Ok(())
        }

        fn upload(&self, request: &UploadRequest<'_>) -> Result<UploadReceipt, UploadError> {
            assert!(request.video.exists(), "video must exist while uploading");
            if self.reject.contains(request.id) {
                return Err(UploadError::protocol("upload", "rejected by fake"));
            }
            self.uploads.borrow_mut().push((
                request.id.to_string(),
                request.title.to_string(),
                request.thumbnail.is_some(),
            ));
            Ok(UploadReceipt {
                location: format!("/fake/{}", request.file_name()),
                thumbnail_uploaded: request.thumbnail.is_some(),
            })
        }
    }
}
