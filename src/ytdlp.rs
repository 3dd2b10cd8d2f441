//! yt-dlp adapter: channel listing, per-item metadata and media retrieval.
//!
//! Every invocation shares the same base flags (quiet output, the configured
//! user agent, the transient cookie file) and runs under a deadline. Output is
//! captured through anonymous temp files so a chatty child can never block on
//! a full pipe while we poll it.

use crate::discovery::{ChannelLister, ListingError};
use crate::fetch::{FetchAttempt, MediaFetcher};
use crate::model::{CandidateItem, ItemDetails};
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const FLAT_LIST_TIMEOUT: Duration = Duration::from_secs(120);
const SINGLE_ITEM_TIMEOUT: Duration = Duration::from_secs(60);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Substrings the source prints when it is throttling or blocking us.
const THROTTLE_MARKERS: &[&str] = &[
    "request is rejected by server",
    "request is blocked",
    "too many requests",
    "http error 429",
    "http error 412",
    "rate-limit",
    "rate limit",
    "timed out",
    "connection reset",
    "temporary failure in name resolution",
];

/// Numeric codes (as standalone tokens) the source uses for anti-bot rejects.
const THROTTLE_CODES: &[&str] = &["352", "412", "429"];

/// Substrings that mean retrying is pointless.
const FATAL_MARKERS: &[&str] = &[
    "video unavailable",
    "this video is not available",
    "private video",
    "has been removed",
    "unsupported url",
    "is not a valid url",
    "requested format is not available",
];

/// How a failure should be treated by the retry layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnosis {
    Transient,
    Fatal,
    Unknown,
}

impl Diagnosis {
    pub fn is_retryable(self) -> bool {
        !matches!(self, Diagnosis::Fatal)
    }
}

/// Classifies yt-dlp diagnostic output. Throttling wins over fatal markers
/// because a blocked request often also reports the item as unavailable.
pub fn classify_diagnostics(stderr: &str) -> Diagnosis {
    let lowered = stderr.to_ascii_lowercase();
    if THROTTLE_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return Diagnosis::Transient;
    }
    if lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| THROTTLE_CODES.contains(&token))
    {
        return Diagnosis::Transient;
    }
    if FATAL_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return Diagnosis::Fatal;
    }
    Diagnosis::Unknown
}

/// Result of one child process run.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.is_some_and(|status| status.success())
    }

    fn stderr_snippet(&self) -> String {
        self.stderr.trim().chars().take(400).collect()
    }

    pub fn failure_message(&self, label: &str) -> String {
        if self.timed_out {
            return format!("{label} timed out");
        }
        match self.status {
            Some(status) => format!("{label} exited with {status}: {}", self.stderr_snippet()),
            None => format!("{label} produced no exit status"),
        }
    }

    fn diagnosis(&self) -> Diagnosis {
        if self.timed_out {
            Diagnosis::Transient
        } else {
            classify_diagnostics(&self.stderr)
        }
    }
}

/// Runs `command` to completion or until `timeout`, killing it on expiry.
pub fn run_with_timeout(mut command: Command, timeout: Duration) -> Result<ProcessOutput> {
    let mut stdout_file = tempfile::tempfile().context("creating stdout capture file")?;
    let mut stderr_file = tempfile::tempfile().context("creating stderr capture file")?;
    command
        .stdin(Stdio::null())
        .stdout(Stdio::from(
            stdout_file.try_clone().context("cloning stdout capture")?,
        ))
        .stderr(Stdio::from(
            stderr_file.try_clone().context("cloning stderr capture")?,
        ));

    let program = command.get_program().to_string_lossy().into_owned();
    let mut child = command
        .spawn()
        .with_context(|| format!("spawning {program}"))?;
    let deadline = Instant::now() + timeout;

    let (status, timed_out) = loop {
        match child.try_wait().with_context(|| format!("waiting for {program}"))? {
            Some(status) => break (Some(status), false),
            None if Instant::now() >= deadline => {
                warn!("{} timed out after {}s, killing", program, timeout.as_secs());
                if let Err(err) = child.kill() {
                    warn!("Could not kill {}: {}", program, err);
                }
                let status = child.wait().ok();
                break (status, true);
            }
            None => std::thread::sleep(POLL_INTERVAL),
        }
    };

    Ok(ProcessOutput {
        status,
        stdout: read_capture(&mut stdout_file)?,
        stderr: read_capture(&mut stderr_file)?,
        timed_out,
    })
}

fn read_capture(file: &mut File) -> Result<String> {
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Subset of a yt-dlp JSON record (flat entry or full info dict).
#[derive(Debug, Deserialize)]
struct EntryJson {
    id: Option<String>,
    title: Option<String>,
    url: Option<String>,
    webpage_url: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<ThumbnailJson>,
}

#[derive(Debug, Deserialize)]
struct ThumbnailJson {
    url: Option<String>,
}

impl EntryJson {
    fn page_url(&self) -> Option<&str> {
        self.webpage_url
            .as_deref()
            .or(self.url.as_deref())
            .filter(|url| url.starts_with("http://") || url.starts_with("https://"))
    }

    fn thumbnail_url(&self) -> Option<String> {
        self.thumbnail
            .clone()
            .or_else(|| self.thumbnails.iter().rev().find_map(|thumb| thumb.url.clone()))
            .filter(|url| !url.trim().is_empty())
    }

    fn into_candidate(self) -> Option<CandidateItem> {
        let id = self
            .id
            .clone()
            .or_else(|| self.page_url().map(str::to_owned))
            .filter(|id| !id.trim().is_empty())?;
        let source_url = self.page_url().map(str::to_owned).unwrap_or_else(|| id.clone());
        Some(CandidateItem {
            thumbnail_url: self.thumbnail_url(),
            raw_title: self.title.unwrap_or_default(),
            id,
            source_url,
        })
    }

    fn into_details(self) -> ItemDetails {
        ItemDetails {
            thumbnail_url: self.thumbnail_url(),
            page_url: self.page_url().map(str::to_owned),
            title: self.title.filter(|title| !title.trim().is_empty()),
        }
    }
}

/// Parses newline-delimited JSON as printed by `--flat-playlist -j`,
/// skipping lines that do not parse.
fn parse_flat_listing(stdout: &str) -> Vec<CandidateItem> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<EntryJson>(line) {
            Ok(entry) => Some(entry),
            Err(err) => {
                debug!("Skipping unparsable listing line: {}", err);
                None
            }
        })
        .filter_map(EntryJson::into_candidate)
        .collect()
}

/// Handle on the yt-dlp executable plus the flags shared by every call.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
    user_agent: String,
    cookies: Option<PathBuf>,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>, user_agent: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            user_agent: user_agent.into(),
            cookies: None,
        }
    }

    pub fn with_cookies(mut self, cookies: Option<PathBuf>) -> Self {
        self.cookies = cookies;
        self
    }

    /// Runs `<program> --version` to fail loudly when yt-dlp is missing.
    pub fn ensure_available(&self) -> Result<String> {
        let mut command = Command::new(&self.program);
        command.arg("--version");
        let output = run_with_timeout(command, Duration::from_secs(30))
            .with_context(|| format!("{} is not installed or not in PATH", self.program.display()))?;
        if !output.success() {
            bail!(
                "{} is installed but returned a failure status",
                self.program.display()
            );
        }
        Ok(output.stdout.trim().to_string())
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--user-agent")
            .arg(&self.user_agent);
        if let Some(cookies) = &self.cookies {
            command.arg("--cookies").arg(cookies);
        }
        command
    }

    fn run(&self, command: Command, timeout: Duration, label: &str) -> Result<ProcessOutput> {
        run_with_timeout(command, timeout).with_context(|| format!("running yt-dlp for {label}"))
    }
}

fn listing_error(output: &ProcessOutput, label: &str) -> ListingError {
    ListingError {
        diagnosis: output.diagnosis(),
        message: output.failure_message(label),
    }
}

fn spawn_error(err: anyhow::Error) -> ListingError {
    ListingError {
        diagnosis: Diagnosis::Unknown,
        message: format!("{err:#}"),
    }
}

impl ChannelLister for YtDlp {
    fn list_flat(&self, channel_url: &str) -> Result<Vec<CandidateItem>, ListingError> {
        let mut command = self.command();
        command.arg("--flat-playlist").arg("-j").arg(channel_url);
        let output = self
            .run(command, FLAT_LIST_TIMEOUT, "flat listing")
            .map_err(spawn_error)?;
        // yt-dlp may exit 0 yet report an anti-bot reject on stderr.
        if !output.success() || output.diagnosis() == Diagnosis::Transient {
            return Err(listing_error(&output, "flat listing"));
        }
        Ok(parse_flat_listing(&output.stdout))
    }

    fn probe(
        &self,
        channel_url: &str,
        index: usize,
    ) -> Result<Option<CandidateItem>, ListingError> {
        let mut command = self.command();
        command
            .arg("-j")
            .arg("--playlist-items")
            .arg(index.to_string())
            .arg(channel_url);
        let output = self
            .run(command, SINGLE_ITEM_TIMEOUT, "single item")
            .map_err(spawn_error)?;
        if !output.success() || output.diagnosis() == Diagnosis::Transient {
            return Err(listing_error(&output, &format!("item {index}")));
        }
        Ok(parse_flat_listing(&output.stdout).into_iter().next())
    }

    fn describe(&self, item: &CandidateItem) -> Result<ItemDetails, ListingError> {
        let mut command = self.command();
        command
            .arg("-j")
            .arg("--skip-download")
            .arg("--no-playlist")
            .arg(&item.source_url);
        let output = self
            .run(command, SINGLE_ITEM_TIMEOUT, "metadata")
            .map_err(spawn_error)?;
        if !output.success() {
            return Err(listing_error(&output, &format!("metadata for {}", item.id)));
        }
        let first_line = output
            .stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or_default();
        serde_json::from_str::<EntryJson>(first_line)
            .map(EntryJson::into_details)
            .map_err(|err| ListingError {
                diagnosis: Diagnosis::Unknown,
                message: format!("parsing metadata for {}: {err}", item.id),
            })
    }
}

impl MediaFetcher for YtDlp {
    fn fetch(&self, source_url: &str, work_dir: &Path, stem: &str) -> FetchAttempt {
        let template = work_dir.join(format!("{stem}.%(ext)s"));
        let mut command = self.command();
        command
            .arg("-f")
            .arg("bv*+ba/b")
            .arg("--merge-output-format")
            .arg("mp4")
            .arg("--no-playlist")
            .arg("-o")
            .arg(&template)
            .arg("--no-simulate")
            .arg("--print")
            .arg("after_move:filepath")
            .arg(source_url);

        let output = match self.run(command, DOWNLOAD_TIMEOUT, "download") {
            Ok(output) => output,
            Err(err) => {
                return FetchAttempt::Failed {
                    diagnosis: Diagnosis::Unknown,
                    message: format!("{err:#}"),
                };
            }
        };

        if !output.stderr.trim().is_empty() {
            debug!("yt-dlp stderr (short): {}", output.stderr_snippet());
        }
        if !output.success() {
            return FetchAttempt::Failed {
                diagnosis: output.diagnosis(),
                message: output.failure_message("download"),
            };
        }

        let reported = output
            .stdout
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .map(PathBuf::from);
        match reported {
            Some(path) => FetchAttempt::Produced(path),
            None => FetchAttempt::Unreported,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::fs;
    use std::path::{Path, PathBuf};

    /// Writes an executable bash script named `yt-dlp` into `dir`.
    pub fn install_stub(dir: &Path, body: &str) -> PathBuf {
        install_script(dir, "yt-dlp", body)
    }

    pub fn install_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let script_path = dir.join(name);
        fs::write(&script_path, format!("#!/usr/bin/env bash\nset -u\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&script_path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&script_path, perms).unwrap();
        }
        script_path
    }
}

#[cfg(test)]
mod tests {
    use super::testing::install_stub;
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn classify_recognizes_throttling() {
        assert_eq!(
            classify_diagnostics("ERROR: [BiliBili] Request is rejected by server (352)"),
            Diagnosis::Transient
        );
        assert_eq!(
            classify_diagnostics("ERROR: HTTP Error 412: Precondition Failed"),
            Diagnosis::Transient
        );
        assert_eq!(classify_diagnostics("code -352"), Diagnosis::Transient);
    }

    #[test]
    fn classify_does_not_match_codes_inside_ids() {
        assert_eq!(
            classify_diagnostics("ERROR: [x] BV1352abc: Video unavailable"),
            Diagnosis::Fatal
        );
        assert_eq!(classify_diagnostics("ERROR: something odd"), Diagnosis::Unknown);
        assert_eq!(classify_diagnostics(""), Diagnosis::Unknown);
    }

    #[test]
    fn parse_flat_listing_skips_garbage_and_uses_urls() {
        let stdout = r#"
{"id":"BV1a","title":"第一","url":"https://www.example.com/video/BV1a"}
not json
{"id":"BV1b","thumbnails":[{"url":"https://img/s.jpg"},{"url":"https://img/l.jpg"}]}
{"title":"no id"}
"#;
        let items = parse_flat_listing(stdout);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "BV1a");
        assert_eq!(items[0].raw_title, "第一");
        assert_eq!(items[0].source_url, "https://www.example.com/video/BV1a");
        assert_eq!(items[1].source_url, "BV1b");
        assert_eq!(items[1].thumbnail_url.as_deref(), Some("https://img/l.jpg"));
    }

    #[test]
    fn run_with_timeout_kills_slow_children() {
        let mut command = Command::new("sleep");
        command.arg("5");
        let output = run_with_timeout(command, Duration::from_millis(300)).unwrap();
        assert!(output.timed_out);
        assert!(!output.success());
        assert_eq!(output.diagnosis(), Diagnosis::Transient);
    }

    #[test]
    fn flat_listing_reports_block_on_stderr() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            "echo 'ERROR: Request is blocked by server' >&2\nexit 0",
        );
        let ytdlp = YtDlp::new(stub, "agent");
        let err = ytdlp.list_flat("https://channel").unwrap_err();
        assert_eq!(err.diagnosis, Diagnosis::Transient);
    }

    #[test]
    fn flat_listing_passes_cookies_and_agent() {
        let dir = tempdir().unwrap();
        let args_log = dir.path().join("args.txt");
        let stub = install_stub(
            dir.path(),
            &format!(
                "printf '%s\\n' \"$@\" > '{}'\necho '{{\"id\":\"v1\",\"url\":\"https://site/v1\"}}'",
                args_log.display()
            ),
        );
        let cookies = dir.path().join("cookies.txt");
        fs::write(&cookies, "# Netscape").unwrap();
        let ytdlp = YtDlp::new(stub, "relay-agent").with_cookies(Some(cookies.clone()));
        let items = ytdlp.list_flat("https://channel").unwrap();
        assert_eq!(items.len(), 1);

        let args = fs::read_to_string(&args_log).unwrap();
        assert!(args.contains("--flat-playlist"));
        assert!(args.contains("relay-agent"));
        assert!(args.contains(&cookies.display().to_string()));
    }

    #[test]
    fn probe_returns_none_past_the_end() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            r#"for a in "$@"; do if [[ "$a" == "1" ]]; then echo '{"id":"first","webpage_url":"https://site/first"}'; fi; done
exit 0"#,
        );
        let ytdlp = YtDlp::new(stub, "agent");
        let first = ytdlp.probe("https://channel", 1).unwrap().expect("item");
        assert_eq!(first.id, "first");
        assert!(ytdlp.probe("https://channel", 2).unwrap().is_none());
    }

    #[test]
    fn describe_extracts_title_and_thumbnail() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            r#"echo '{"id":"v1","title":"标题","thumbnail":"https://img/v1.jpg","webpage_url":"https://site/v1"}'"#,
        );
        let ytdlp = YtDlp::new(stub, "agent");
        let details = ytdlp
            .describe(&CandidateItem::new("v1", "https://site/v1"))
            .unwrap();
        assert_eq!(details.title.as_deref(), Some("标题"));
        assert_eq!(details.thumbnail_url.as_deref(), Some("https://img/v1.jpg"));
    }

    #[test]
    fn fetch_reports_printed_path() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            r#"out=""
while [[ $# -gt 0 ]]; do
  case "$1" in
    -o) shift; out="$1" ;;
  esac
  shift
done
target="${out//%(ext)s/mp4}"
head -c 4096 /dev/zero > "$target"
echo "$target""#,
        );
        let ytdlp = YtDlp::new(stub, "agent");
        let work = dir.path().join("work");
        fs::create_dir_all(&work).unwrap();
        match ytdlp.fetch("https://site/v1", &work, "My_Title") {
            FetchAttempt::Produced(path) => {
                assert_eq!(path, work.join("My_Title.mp4"));
                assert!(path.exists());
            }
            other => panic!("unexpected attempt {other:?}"),
        }
    }

    #[test]
    fn fetch_failure_carries_diagnosis() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), "echo 'ERROR: Private video' >&2\nexit 1");
        let ytdlp = YtDlp::new(stub, "agent");
        match ytdlp.fetch("https://site/v1", dir.path(), "x") {
            FetchAttempt::Failed { diagnosis, message } => {
                assert_eq!(diagnosis, Diagnosis::Fatal);
                assert!(message.contains("Private video"));
            }
            other => panic!("unexpected attempt {other:?}"),
        }
    }

    #[test]
    fn ensure_available_fails_for_missing_program() {
        let ytdlp = YtDlp::new("/nonexistent/yt-dlp", "agent");
        assert!(ytdlp.ensure_available().is_err());
    }
}
