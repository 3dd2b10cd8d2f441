//! Shared blocking HTTP plumbing.

use crate::ytdlp::Diagnosis;
use anyhow::{Context, Result, bail};
use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Thumbnails larger than this are treated as bogus responses.
const MAX_THUMBNAIL_BYTES: u64 = 20 * 1024 * 1024;

/// Agent used for short API calls (translation, thumbnails, token exchange).
pub fn api_agent(user_agent: &str) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(10))
        .timeout_read(Duration::from_secs(30))
        .timeout_write(Duration::from_secs(30))
        .user_agent(user_agent)
        .build()
}

/// Agent used for bulk transfers. Read/write timeouts cover a single chunk,
/// not the whole file. Redirects are disabled so resumable-upload status
/// codes (308) reach the caller untouched.
pub fn transfer_agent(user_agent: &str) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(15))
        .timeout_read(Duration::from_secs(300))
        .timeout_write(Duration::from_secs(300))
        .redirects(0)
        .user_agent(user_agent)
        .build()
}

/// Maps a ureq failure onto the shared retry classification.
pub fn classify_ureq_error(error: &ureq::Error) -> Diagnosis {
    match error {
        ureq::Error::Status(code, _) => match code {
            412 | 429 => Diagnosis::Transient,
            408 | 500 | 502 | 503 | 504 => Diagnosis::Transient,
            400..=499 => Diagnosis::Fatal,
            _ => Diagnosis::Unknown,
        },
        ureq::Error::Transport(transport) => {
            let lowered = transport.to_string().to_ascii_lowercase();
            if lowered.contains("timed out")
                || lowered.contains("timeout")
                || lowered.contains("connection reset")
            {
                Diagnosis::Transient
            } else {
                Diagnosis::Unknown
            }
        }
    }
}

/// Short human-readable description of a ureq failure, including the start
/// of the response body for status errors.
pub fn describe_ureq_error(error: ureq::Error) -> String {
    match error {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            let snippet: String = body.chars().take(300).collect();
            format!("HTTP {code}: {snippet}")
        }
        ureq::Error::Transport(transport) => transport.to_string(),
    }
}

/// Saves `url` into `dest`. Used for thumbnails; the caller decides whether
/// a failure matters.
pub fn download_to_file(agent: &ureq::Agent, url: &str, dest: &Path) -> Result<()> {
    debug!("Fetching {} -> {}", url, dest.display());
    let response = agent
        .get(url)
        .call()
        .map_err(|err| anyhow::anyhow!(describe_ureq_error(err)))
        .with_context(|| format!("requesting {url}"))?;
    if response.status() != 200 {
        bail!("unexpected status {} for {}", response.status(), url);
    }

    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_THUMBNAIL_BYTES + 1)
        .read_to_end(&mut bytes)
        .with_context(|| format!("reading body of {url}"))?;
    if bytes.is_empty() {
        bail!("empty body for {url}");
    }
    if bytes.len() as u64 > MAX_THUMBNAIL_BYTES {
        bail!("body of {url} exceeds {MAX_THUMBNAIL_BYTES} bytes");
    }

    fs::write(dest, &bytes).with_context(|| format!("writing {}", dest.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::testing::{StubResponse, StubServer};

    fn status_error(code: u16) -> ureq::Error {
        let response = ureq::Response::new(code, "status", "body").unwrap();
        ureq::Error::Status(code, response)
    }

    #[test]
    fn throttling_statuses_are_transient() {
        assert_eq!(classify_ureq_error(&status_error(429)), Diagnosis::Transient);
        assert_eq!(classify_ureq_error(&status_error(412)), Diagnosis::Transient);
        assert_eq!(classify_ureq_error(&status_error(503)), Diagnosis::Transient);
    }

    #[test]
    fn client_errors_are_fatal() {
        assert_eq!(classify_ureq_error(&status_error(401)), Diagnosis::Fatal);
        assert_eq!(classify_ureq_error(&status_error(404)), Diagnosis::Fatal);
    }

    #[test]
    fn describe_includes_status_and_body() {
        let text = describe_ureq_error(status_error(409));
        assert!(text.starts_with("HTTP 409"));
        assert!(text.contains("body"));
    }

    #[test]
    fn download_writes_body_to_disk() {
        let server = StubServer::start(|_| StubResponse {
            status: 200,
            headers: vec![("Content-Type".into(), "image/jpeg".into())],
            body: "jpeg-bytes".into(),
        });
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("thumbnail.jpg");
        download_to_file(&api_agent("relay-test"), &server.url("/t.jpg"), &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"jpeg-bytes");
    }

    #[test]
    fn download_rejects_error_status_and_empty_body() {
        let server = StubServer::start(|request| match request.path.as_str() {
            "/gone.jpg" => StubResponse::empty(404),
            _ => StubResponse::empty(200),
        });
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("thumbnail.jpg");
        let agent = api_agent("relay-test");
        assert!(download_to_file(&agent, &server.url("/gone.jpg"), &dest).is_err());
        assert!(download_to_file(&agent, &server.url("/empty.jpg"), &dest).is_err());
        assert!(!dest.exists());
    }
}
