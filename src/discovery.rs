//! Finds channel items that have not been relayed yet.
//!
//! A cheap flat listing is tried first (with exponential backoff while the
//! source throttles us). When it yields nothing usable, entries are probed one
//! position at a time up to a configured limit.

use crate::model::{CandidateItem, ItemDetails};
use crate::pacing::{Sleeper, exponential_backoff};
use crate::ytdlp::Diagnosis;
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const FLAT_ATTEMPTS: u32 = 4;
const FLAT_INITIAL_DELAY: Duration = Duration::from_secs(4);
const PROBE_ATTEMPTS: u32 = 3;
const PROBE_INITIAL_DELAY: Duration = Duration::from_secs(3);
const MAX_BACKOFF: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ListingError {
    pub diagnosis: Diagnosis,
    pub message: String,
}

/// Source of channel entries.
pub trait ChannelLister {
    /// Every entry of the channel in its natural order, with minimal detail.
    fn list_flat(&self, channel_url: &str) -> Result<Vec<CandidateItem>, ListingError>;

    /// Entry at the 1-based `index`, or `None` once the channel has no more.
    fn probe(&self, channel_url: &str, index: usize)
    -> Result<Option<CandidateItem>, ListingError>;

    /// Full metadata for one item (title, thumbnail, canonical page).
    fn describe(&self, item: &CandidateItem) -> Result<ItemDetails, ListingError>;
}

/// Limits for one discovery pass.
#[derive(Debug, Clone, Copy)]
pub struct DiscoveryLimits {
    /// Probing stops once this many fresh candidates were collected.
    pub wanted: usize,
    /// Maximum number of per-item probes.
    pub max_checks: usize,
}

/// Produces the ordered, deduplicated list of items not yet in `processed`.
pub fn discover(
    lister: &dyn ChannelLister,
    sleeper: &dyn Sleeper,
    channel_url: &str,
    processed: &BTreeSet<String>,
    limits: DiscoveryLimits,
) -> Vec<CandidateItem> {
    info!("Attempting flat listing of {}", channel_url);
    let listed = flat_with_backoff(lister, sleeper, channel_url);
    let listed_count = listed.len();

    let mut seen = HashSet::new();
    let candidates: Vec<CandidateItem> = listed
        .into_iter()
        .filter(|item| {
            if processed.contains(&item.id) {
                info!("Skipping already-processed (flat): {}", item.id);
                return false;
            }
            seen.insert(item.id.clone())
        })
        .collect();

    if !candidates.is_empty() {
        info!(
            "Flat listing returned {} entries, {} not yet processed",
            listed_count,
            candidates.len()
        );
        return candidates;
    }

    info!(
        "Flat listing gave {} entries and none are new; probing up to {} items individually",
        listed_count, limits.max_checks
    );
    probe_sequentially(lister, sleeper, channel_url, processed, limits)
}

fn flat_with_backoff(
    lister: &dyn ChannelLister,
    sleeper: &dyn Sleeper,
    channel_url: &str,
) -> Vec<CandidateItem> {
    for attempt in 1..=FLAT_ATTEMPTS {
        match lister.list_flat(channel_url) {
            Ok(items) => return items,
            Err(err) if !err.diagnosis.is_retryable() => {
                warn!("Flat listing failed permanently: {}", err);
                return Vec::new();
            }
            Err(err) => {
                warn!(
                    "Flat listing failed (attempt {}/{}): {}",
                    attempt, FLAT_ATTEMPTS, err
                );
                if attempt < FLAT_ATTEMPTS {
                    sleeper.sleep(exponential_backoff(FLAT_INITIAL_DELAY, attempt, MAX_BACKOFF));
                }
            }
        }
    }
    Vec::new()
}

fn probe_sequentially(
    lister: &dyn ChannelLister,
    sleeper: &dyn Sleeper,
    channel_url: &str,
    processed: &BTreeSet<String>,
    limits: DiscoveryLimits,
) -> Vec<CandidateItem> {
    let mut candidates = Vec::new();
    let mut seen = HashSet::new();

    for index in 1..=limits.max_checks {
        if candidates.len() >= limits.wanted {
            break;
        }
        let item = match probe_with_backoff(lister, sleeper, channel_url, index) {
            ProbeOutcome::Found(item) => item,
            ProbeOutcome::EndOfChannel => {
                info!("Channel reports no item at position {}; stopping", index);
                break;
            }
            ProbeOutcome::Unavailable => continue,
        };
        if processed.contains(&item.id) || !seen.insert(item.id.clone()) {
            continue;
        }
        info!("Probe {} found candidate {}", index, item.id);
        candidates.push(item);
    }

    candidates
}

enum ProbeOutcome {
    Found(CandidateItem),
    EndOfChannel,
    Unavailable,
}

fn probe_with_backoff(
    lister: &dyn ChannelLister,
    sleeper: &dyn Sleeper,
    channel_url: &str,
    index: usize,
) -> ProbeOutcome {
    for attempt in 1..=PROBE_ATTEMPTS {
        match lister.probe(channel_url, index) {
            Ok(Some(item)) => return ProbeOutcome::Found(item),
            Ok(None) => return ProbeOutcome::EndOfChannel,
            Err(err) if !err.diagnosis.is_retryable() => {
                warn!("Probe {} failed permanently: {}", index, err);
                return ProbeOutcome::Unavailable;
            }
            Err(err) => {
                warn!(
                    "Probe {} failed (attempt {}/{}): {}",
                    index, attempt, PROBE_ATTEMPTS, err
                );
                if attempt < PROBE_ATTEMPTS {
                    sleeper.sleep(exponential_backoff(PROBE_INITIAL_DELAY, attempt, MAX_BACKOFF));
                }
            }
        }
    }
    ProbeOutcome::Unavailable
}


#[cfg(test)]
mod tests {
    use super::testing::{FakeLister, item, transient};
    use super::*;
    use crate::pacing::testing::RecordingSleeper;

    const LIMITS: DiscoveryLimits = DiscoveryLimits {
        wanted: 6,
        max_checks: 200,
    };

    fn ids(items: &[CandidateItem]) -> Vec<&str> {
        items.iter().map(|item| item.id.as_str()).collect()
    }

    #[test]
    fn flat_listing_filters_processed_and_dedupes_in_order() {
        let lister = FakeLister::default();
        lister
            .flat
            .borrow_mut()
            .push_back(Ok(vec![item("c"), item("b"), item("c"), item("a")]));
        let processed = BTreeSet::from(["b".to_string()]);
        let sleeper = RecordingSleeper::default();

        let found = discover(&lister, &sleeper, "https://ch", &processed, LIMITS);
        assert_eq!(ids(&found), vec!["c", "a"]);
        assert!(lister.probe_calls.borrow().is_empty());
    }

    #[test]
    fn flat_listing_backs_off_exponentially_while_throttled() {
        let lister = FakeLister::default();
        lister.flat.borrow_mut().extend([
            Err(transient()),
            Err(transient()),
            Ok(vec![item("x")]),
        ]);
        let sleeper = RecordingSleeper::default();

        let found = discover(&lister, &sleeper, "https://ch", &BTreeSet::new(), LIMITS);
        assert_eq!(ids(&found), vec!["x"]);
        assert_eq!(
            *sleeper.calls.borrow(),
            vec![Duration::from_secs(4), Duration::from_secs(8)]
        );
    }

    #[test]
    fn flat_listing_gives_up_after_bounded_attempts_then_probes() {
        let lister = FakeLister {
            probe_table: vec![Ok(Some(item("p1"))), Ok(Some(item("p2")))],
            ..FakeLister::default()
        };
        lister
            .flat
            .borrow_mut()
            .extend((0..10).map(|_| Err(transient())));
        let sleeper = RecordingSleeper::default();

        let found = discover(&lister, &sleeper, "https://ch", &BTreeSet::new(), LIMITS);
        assert_eq!(lister.flat_calls.get(), FLAT_ATTEMPTS as usize);
        assert_eq!(ids(&found), vec!["p1", "p2"]);
        assert_eq!(*lister.probe_calls.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn fatal_flat_failure_is_not_retried() {
        let lister = FakeLister::default();
        lister.flat.borrow_mut().push_back(Err(ListingError {
            diagnosis: Diagnosis::Fatal,
            message: "Unsupported URL".into(),
        }));
        let sleeper = RecordingSleeper::default();
        let found = discover(&lister, &sleeper, "https://ch", &BTreeSet::new(), LIMITS);
        assert!(found.is_empty());
        assert_eq!(lister.flat_calls.get(), 1);
        assert!(sleeper.calls.borrow().is_empty());
    }

    #[test]
    fn fully_processed_listing_falls_back_to_probing() {
        // A truncated listing shows only the newest page; older items are
        // still reachable by position.
        let lister = FakeLister {
            probe_table: vec![Ok(Some(item("a"))), Ok(Some(item("older")))],
            ..FakeLister::default()
        };
        lister.flat.borrow_mut().push_back(Ok(vec![item("a")]));
        let processed = BTreeSet::from(["a".to_string()]);
        let sleeper = RecordingSleeper::default();
        let found = discover(&lister, &sleeper, "https://ch", &processed, LIMITS);
        assert_eq!(ids(&found), vec!["older"]);
        assert_eq!(*lister.probe_calls.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn probing_skips_processed_and_stops_when_enough() {
        let lister = FakeLister {
            probe_table: vec![
                Ok(Some(item("done"))),
                Ok(Some(item("n1"))),
                Ok(Some(item("n2"))),
                Ok(Some(item("n3"))),
            ],
            ..FakeLister::default()
        };
        let processed = BTreeSet::from(["done".to_string()]);
        let sleeper = RecordingSleeper::default();
        let limits = DiscoveryLimits {
            wanted: 2,
            max_checks: 200,
        };
        let found = discover(&lister, &sleeper, "https://ch", &processed, limits);
        assert_eq!(ids(&found), vec!["n1", "n2"]);
        assert_eq!(*lister.probe_calls.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn probing_respects_max_checks_and_retries_transient_errors() {
        let lister = FakeLister {
            probe_table: vec![Err(transient()), Ok(Some(item("n2"))), Ok(Some(item("n3")))],
            ..FakeLister::default()
        };
        let sleeper = RecordingSleeper::default();
        let limits = DiscoveryLimits {
            wanted: 10,
            max_checks: 2,
        };
        let found = discover(&lister, &sleeper, "https://ch", &BTreeSet::new(), limits);
        assert_eq!(ids(&found), vec!["n2"]);
        // Position 1 is retried PROBE_ATTEMPTS times before moving on.
        assert_eq!(*lister.probe_calls.borrow(), vec![1, 1, 1, 2]);
    }
}
