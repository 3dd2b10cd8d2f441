//! Download-retry engine.
//!
//! For one candidate the engine calls the media fetcher up to the retry
//! budget, validates what landed on disk, wipes partial leftovers between
//! attempts and finally classifies the candidate as fetched or exhausted.

use crate::model::CandidateItem;
use crate::pacing::{Sleeper, jitter};
use crate::ytdlp::Diagnosis;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Merged files at or below this size are placeholders from a failed merge.
pub const MIN_ARTIFACT_BYTES: u64 = 100;
/// Longest file stem (in characters) produced by [`sanitize_filename`].
pub const MAX_STEM_CHARS: usize = 140;
/// Default pause between attempts, in seconds.
pub const DEFAULT_RETRY_BACKOFF: Range<f64> = 5.0..12.0;

const MEDIA_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "m4a", "webm", "flv", "ts", "mov", "avi", "mp3", "aac",
];
const RESERVED_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const MTIME_SLACK: Duration = Duration::from_secs(2);
const TEMP_EXTENSIONS: &[&str] = &["part", "tmp", "ytdl", "temp"];

/// What a single fetcher invocation reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchAttempt {
    /// The fetcher finished and named the file it produced.
    Produced(PathBuf),
    /// The fetcher finished without naming its output.
    Unreported,
    Failed {
        diagnosis: Diagnosis,
        message: String,
    },
}

/// Retrieves media for one item into `work_dir` using `stem` as the file
/// name (the extension is chosen by the fetcher).
pub trait MediaFetcher {
    fn fetch(&self, source_url: &str, work_dir: &Path, stem: &str) -> FetchAttempt;
}

/// Final classification for a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success { media: PathBuf, attempts: u32 },
    Exhausted { attempts: u32, last_error: String },
}

pub struct DownloadEngine<'a> {
    fetcher: &'a dyn MediaFetcher,
    sleeper: &'a dyn Sleeper,
    work_dir: PathBuf,
    backoff: Range<f64>,
}

impl<'a> DownloadEngine<'a> {
    pub fn new(fetcher: &'a dyn MediaFetcher, sleeper: &'a dyn Sleeper, work_dir: &Path) -> Self {
        Self {
            fetcher,
            sleeper,
            work_dir: work_dir.to_path_buf(),
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Range<f64>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Runs at most `retry_budget` attempts. A failure the fetcher marks as
    /// fatal ends the loop early.
    pub fn fetch(&self, candidate: &CandidateItem, stem: &str, retry_budget: u32) -> FetchOutcome {
        let retry_budget = retry_budget.max(1);
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=retry_budget {
            info!(
                "Download attempt {}/{} for {}",
                attempt, retry_budget, candidate.id
            );
            let started = SystemTime::now();
            let result = self
                .fetcher
                .fetch(&candidate.source_url, &self.work_dir, stem);

            let fatal = match self.validate(result, stem, started) {
                Ok(media) => {
                    info!("Downloaded file located: {}", media.display());
                    return FetchOutcome::Success {
                        media,
                        attempts: attempt,
                    };
                }
                Err((diagnosis, message)) => {
                    last_error = message;
                    !diagnosis.is_retryable()
                }
            };

            remove_partial_files(&self.work_dir, stem);

            if fatal {
                warn!(
                    "Download of {} failed permanently on attempt {}: {}",
                    candidate.id, attempt, last_error
                );
                return FetchOutcome::Exhausted {
                    attempts: attempt,
                    last_error,
                };
            }
            if attempt < retry_budget {
                let pause = jitter(self.backoff.clone());
                warn!(
                    "Download failed for {} on attempt {} ({}). Waiting {:.1}s before retry.",
                    candidate.id,
                    attempt,
                    last_error,
                    pause.as_secs_f64()
                );
                self.sleeper.sleep(pause);
            } else {
                warn!(
                    "Download failed for {} after {} attempts: {}",
                    candidate.id, retry_budget, last_error
                );
            }
        }

        FetchOutcome::Exhausted {
            attempts: retry_budget,
            last_error,
        }
    }

    /// Turns a raw attempt into a usable file path, or a failure reason.
    fn validate(
        &self,
        attempt: FetchAttempt,
        stem: &str,
        started: SystemTime,
    ) -> Result<PathBuf, (Diagnosis, String)> {
        let path = match attempt {
            FetchAttempt::Failed { diagnosis, message } => return Err((diagnosis, message)),
            FetchAttempt::Produced(path) if path.is_relative() => self.work_dir.join(path),
            FetchAttempt::Produced(path) => path,
            FetchAttempt::Unreported => {
                debug!("Fetcher did not report a path; scanning for {stem}.*");
                // File timestamps are coarser than the wall clock.
                let since = started.checked_sub(MTIME_SLACK).unwrap_or(started);
                find_by_prefix(&self.work_dir, stem, since).ok_or_else(|| {
                    (
                        Diagnosis::Unknown,
                        format!("no media file starting with {stem} was produced"),
                    )
                })?
            }
        };

        let size = fs::metadata(&path)
            .map(|meta| meta.len())
            .map_err(|err| {
                (
                    Diagnosis::Unknown,
                    format!("reported file {} is missing: {err}", path.display()),
                )
            })?;
        if size <= MIN_ARTIFACT_BYTES {
            return Err((
                Diagnosis::Unknown,
                format!("{} is only {size} bytes", path.display()),
            ));
        }
        Ok(path)
    }
}

/// Filesystem-safe file stem that keeps every non-ASCII script character.
///
/// Control and reserved characters are dropped, whitespace runs collapse to a
/// single `_`, leading dots are removed and the result is capped at
/// [`MAX_STEM_CHARS`]. Returns an empty string when nothing usable remains.
pub fn sanitize_filename(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| if c.is_whitespace() { ' ' } else { c })
        .filter(|c| !c.is_control() && !RESERVED_CHARS.contains(c))
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_start_matches('.').trim();
    let capped: String = trimmed.chars().take(MAX_STEM_CHARS).collect();
    capped.trim_end().replace(' ', "_")
}

/// Stem for a candidate's local files: the sanitized title, else the
/// sanitized id, else `video`.
pub fn artifact_stem(display_title: &str, id: &str) -> String {
    [display_title, id]
        .into_iter()
        .map(sanitize_filename)
        .find(|stem| !stem.is_empty())
        .unwrap_or_else(|| "video".to_string())
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

fn starts_with_stem(path: &Path, stem: &str) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().starts_with(stem))
        .unwrap_or(false)
}

fn files_in(dir: &Path) -> impl Iterator<Item = walkdir::DirEntry> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
}

/// Newest media file in `dir` whose name starts with `stem` and that was
/// modified at or after `since`. Fallback for fetchers that cannot report
/// their output path.
pub fn find_by_prefix(dir: &Path, stem: &str, since: SystemTime) -> Option<PathBuf> {
    files_in(dir)
        .filter(|entry| starts_with_stem(entry.path(), stem))
        .filter(|entry| {
            extension_of(entry.path())
                .is_some_and(|ext| MEDIA_EXTENSIONS.contains(&ext.as_str()))
        })
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            (modified >= since).then(|| (modified, entry.into_path()))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}

/// Deletes media and temp files whose names start with `stem`. Failures are
/// logged and ignored.
pub fn remove_partial_files(dir: &Path, stem: &str) {
    for entry in files_in(dir) {
        let path = entry.path();
        if !starts_with_stem(path, stem) {
            continue;
        }
        let removable = extension_of(path).is_some_and(|ext| {
            MEDIA_EXTENSIONS.contains(&ext.as_str()) || TEMP_EXTENSIONS.contains(&ext.as_str())
        });
        if !removable {
            continue;
        }
        match fs::remove_file(path) {
            Ok(()) => info!("Removed partial file: {}", path.display()),
            Err(err) => warn!("Could not remove partial file {}: {}", path.display(), err),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    /// Fetcher whose behaviour is scripted per source URL. Items listed in
    /// `succeed` get a real file written; everything else fails.
    #[derive(Default)]
    pub struct ScriptedFetcher {
        pub succeed: Vec<String>,
        /// Per-URL number of failures before success.
        pub flaky: HashMap<String, u32>,
        pub calls: RefCell<Vec<String>>,
        pub total: Cell<usize>,
    }

    impl ScriptedFetcher {
        pub fn succeeding(urls: &[&str]) -> Self {
            Self {
                succeed: urls.iter().map(|url| url.to_string()).collect(),
                ..Self::default()
            }
        }

        pub fn attempts_for(&self, url: &str) -> usize {
            self.calls.borrow().iter().filter(|call| *call == url).count()
        }
    }

    impl MediaFetcher for ScriptedFetcher {
        fn fetch(&self, source_url: &str, work_dir: &Path, stem: &str) -> FetchAttempt {
            self.calls.borrow_mut().push(source_url.to_string());
            self.total.set(self.total.get() + 1);
            let previous = self.attempts_for(source_url) as u32 - 1;
            let failures_first = self.flaky.get(source_url).copied().unwrap_or(0);
            let ok = self.succeed.iter().any(|url| url == source_url) && previous >= failures_first;
            if ok {
                let path = work_dir.join(format!("{stem}.mp4"));
                fs::write(&path, vec![7u8; 4096]).unwrap();
                FetchAttempt::Produced(path)
            } else {
                fs::write(work_dir.join(format!("{stem}.mp4.part")), b"partial").unwrap();
                FetchAttempt::Failed {
                    diagnosis: Diagnosis::Unknown,
                    message: "merge failed".into(),
                }
            }
        }
    }
}
