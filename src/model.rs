//! Plain data passed between the relay stages.

use std::path::PathBuf;

/// One discoverable unit of source content.
///
/// Built fresh by discovery on every run. Only `id` ever outlives the run,
/// inside the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateItem {
    pub id: String,
    pub source_url: String,
    pub raw_title: String,
    pub thumbnail_url: Option<String>,
}

impl CandidateItem {
    pub fn new(id: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_url: source_url.into(),
            raw_title: String::new(),
            thumbnail_url: None,
        }
    }

    /// Fills the blanks with details from a richer lookup. Values already
    /// present are kept.
    pub fn absorb(&mut self, details: ItemDetails) {
        if self.raw_title.trim().is_empty()
            && let Some(title) = details.title
        {
            self.raw_title = title;
        }
        if self.thumbnail_url.is_none() {
            self.thumbnail_url = details.thumbnail_url;
        }
        if let Some(url) = details.page_url
            && !url.trim().is_empty()
        {
            self.source_url = url;
        }
    }
}

/// Extra fields a single-item metadata lookup can provide.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemDetails {
    pub title: Option<String>,
    pub thumbnail_url: Option<String>,
    pub page_url: Option<String>,
}

/// Media (and optional thumbnail) produced on disk for one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalArtifact {
    pub media: PathBuf,
    pub thumbnail: Option<PathBuf>,
}

/// Why the run loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    QuotaReached,
    SkipBudgetExhausted,
    CandidatesExhausted,
}

impl StopReason {
    pub fn describe(self) -> &'static str {
        match self {
            StopReason::QuotaReached => "success quota reached",
            StopReason::SkipBudgetExhausted => "skip budget exhausted",
            StopReason::CandidatesExhausted => "no more candidates",
        }
    }
}

/// Final report of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub successes: usize,
    pub skips: usize,
    pub processed: Vec<String>,
    pub skipped: Vec<String>,
    pub stop: StopReason,
}
