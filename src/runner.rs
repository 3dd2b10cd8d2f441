//! The relay loop.
//!
//! Candidates are handled strictly one at a time: enrich, translate, fetch,
//! upload, record, clean up. Two counters decide when to stop: `successes`
//! against the quota and `skips` against the skip budget. Both are checked
//! only between candidates, so an item in flight always finishes first.

use crate::discovery::{ChannelLister, DiscoveryLimits, discover};
use crate::fetch::{DownloadEngine, FetchOutcome, artifact_stem};
use crate::http::download_to_file;
use crate::ledger::{Ledger, ProcessedSet, TranslationCache};
use crate::model::{CandidateItem, LocalArtifact, RunSummary, StopReason};
use crate::pacing::{Sleeper, jitter};
use crate::translate::TitleTranslator;
use crate::upload::{Destination, UploadRequest};
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

pub const THUMBNAIL_FILE: &str = "thumbnail.jpg";
/// Pause between candidates, in seconds.
pub const POLITENESS_DELAY: Range<f64> = 1.0..2.0;

/// Counters that bound a run.
#[derive(Debug, Clone, Copy)]
pub struct RunLimits {
    pub success_quota: usize,
    pub skip_budget: usize,
    pub retry_budget: u32,
}

/// Best-effort thumbnail retrieval.
pub trait ThumbnailSource {
    fn fetch(&self, url: &str, dest: &Path) -> bool;
}

/// Fetches thumbnails over HTTP.
pub struct HttpThumbnails {
    agent: ureq::Agent,
}

impl HttpThumbnails {
    pub fn new(agent: ureq::Agent) -> Self {
        Self { agent }
    }
}

impl ThumbnailSource for HttpThumbnails {
    fn fetch(&self, url: &str, dest: &Path) -> bool {
        match download_to_file(&self.agent, url, dest) {
            Ok(()) => true,
            Err(err) => {
                warn!("Thumbnail download failed: {:#}", err);
                false
            }
        }
    }
}

/// In-memory bookkeeping for one run. Never persisted.
#[derive(Debug, Default)]
struct RunState {
    successes: usize,
    skips: usize,
    cursor: usize,
    processed: Vec<String>,
    skipped: Vec<String>,
}

impl RunState {
    fn stop_reason(&self, limits: &RunLimits) -> Option<StopReason> {
        if self.successes >= limits.success_quota {
            Some(StopReason::QuotaReached)
        } else if self.skips >= limits.skip_budget {
            Some(StopReason::SkipBudgetExhausted)
        } else {
            None
        }
    }

    fn into_summary(self, stop: StopReason) -> RunSummary {
        RunSummary {
            successes: self.successes,
            skips: self.skips,
            processed: self.processed,
            skipped: self.skipped,
            stop,
        }
    }
}

enum ItemOutcome {
    Relayed,
    Skipped,
}

/// Files owned by the current iteration. Dropping the guard deletes them.
#[derive(Default)]
struct ScopedFiles {
    paths: Vec<PathBuf>,
}

impl ScopedFiles {
    fn track(&mut self, path: &Path) {
        self.paths.push(path.to_path_buf());
    }
}

impl Drop for ScopedFiles {
    fn drop(&mut self) {
        for path in &self.paths {
            match fs::remove_file(path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!("Could not remove {}: {}", path.display(), err),
            }
        }
    }
}

pub struct RunController<'a> {
    pub lister: &'a dyn ChannelLister,
    pub engine: &'a DownloadEngine<'a>,
    pub translator: &'a TitleTranslator<'a>,
    pub destination: &'a dyn Destination,
    pub ledger: &'a Ledger<'a>,
    pub thumbnails: &'a dyn ThumbnailSource,
    pub sleeper: &'a dyn Sleeper,
    pub limits: RunLimits,
}

impl RunController<'_> {
    /// Loads the ledger, discovers candidates and relays them.
    pub fn run(&self, channel_url: &str, max_checks: usize) -> RunSummary {
        let (mut processed, mut cache) = self.ledger.load();
        info!(
            "Ledger holds {} processed ids and {} cached titles",
            processed.len(),
            cache.len()
        );
        if self.limits.skip_budget == 0 {
            info!("Skip budget is 0; nothing to do");
            return RunState::default().into_summary(StopReason::SkipBudgetExhausted);
        }
        let limits = DiscoveryLimits {
            wanted: self.limits.success_quota.saturating_add(self.limits.skip_budget),
            max_checks,
        };
        let candidates = discover(self.lister, self.sleeper, channel_url, &processed, limits);
        info!("Discovered {} candidate(s)", candidates.len());
        self.relay(candidates, &mut processed, &mut cache)
    }

    /// Drives the loop over an already discovered candidate list.
    pub fn relay(
        &self,
        candidates: Vec<CandidateItem>,
        processed: &mut ProcessedSet,
        cache: &mut TranslationCache,
    ) -> RunSummary {
        let mut state = RunState::default();
        let mut queue = candidates.into_iter().peekable();

        let stop = loop {
            if let Some(reason) = state.stop_reason(&self.limits) {
                break reason;
            }
            let Some(mut candidate) = queue.next() else {
                break StopReason::CandidatesExhausted;
            };
            if processed.contains(&candidate.id) {
                debug!("{} already processed; skipping", candidate.id);
                continue;
            }

            state.cursor += 1;
            info!("[{}] Processing {}", state.cursor, candidate.id);
            match self.process(&mut candidate, processed, cache) {
                ItemOutcome::Relayed => {
                    state.successes += 1;
                    state.processed.push(candidate.id);
                    info!(
                        "Successes: {}/{}",
                        state.successes, self.limits.success_quota
                    );
                }
                ItemOutcome::Skipped => {
                    state.skips += 1;
                    warn!(
                        "Skipping {} (skips: {}/{})",
                        candidate.id, state.skips, self.limits.skip_budget
                    );
                    state.skipped.push(candidate.id);
                }
            }

            if state.stop_reason(&self.limits).is_none() && queue.peek().is_some() {
                self.sleeper.sleep(jitter(POLITENESS_DELAY));
            }
        };

        info!("Stopping: {}", stop.describe());
        state.into_summary(stop)
    }

    fn process(
        &self,
        candidate: &mut CandidateItem,
        processed: &mut ProcessedSet,
        cache: &mut TranslationCache,
    ) -> ItemOutcome {
        match self.lister.describe(candidate) {
            Ok(details) => candidate.absorb(details),
            Err(err) => warn!("Metadata lookup failed for {}: {}", candidate.id, err),
        }

        let title = self
            .translator
            .translate(&candidate.id, &candidate.raw_title, cache);
        if title.cache_changed
            && let Err(err) = self.ledger.persist_translations(cache)
        {
            warn!("Could not save translations: {:#}", err);
        }
        info!("Display title: {}", title.text);

        let mut scoped = ScopedFiles::default();
        let thumbnail = self.fetch_thumbnail(candidate, &mut scoped);

        let stem = artifact_stem(&title.text, &candidate.id);
        let media = match self
            .engine
            .fetch(candidate, &stem, self.limits.retry_budget)
        {
            FetchOutcome::Success { media, .. } => media,
            FetchOutcome::Exhausted { attempts, last_error } => {
                warn!(
                    "Giving up on {} after {} attempt(s): {}",
                    candidate.id, attempts, last_error
                );
                return ItemOutcome::Skipped;
            }
        };
        scoped.track(&media);
        let artifact = LocalArtifact { media, thumbnail };

        let request = UploadRequest {
            id: &candidate.id,
            title: &title.text,
            source_url: &candidate.source_url,
            video: &artifact.media,
            thumbnail: artifact.thumbnail.as_deref(),
        };
        match self.destination.upload(&request) {
            Ok(receipt) => info!("Relayed {} to {}", candidate.id, receipt.location),
            Err(err) => {
                warn!("Upload of {} failed: {}", candidate.id, err);
                return ItemOutcome::Skipped;
            }
        }

        processed.insert(candidate.id.clone());
        if let Err(err) = self.ledger.persist_processed(processed) {
            error!("Could not save processed ids: {:#}", err);
        }
        ItemOutcome::Relayed
    }

    fn fetch_thumbnail(
        &self,
        candidate: &CandidateItem,
        scoped: &mut ScopedFiles,
    ) -> Option<PathBuf> {
        let url = candidate.thumbnail_url.as_deref()?;
        let dest = self.engine.work_dir().join(THUMBNAIL_FILE);
        scoped.track(&dest);
        if self.thumbnails.fetch(url, &dest) {
            info!("Saved thumbnail to {}", dest.display());
            Some(dest)
        } else {
            None
        }
    }
}
