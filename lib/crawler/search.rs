use thiserror::Error;

use super::backoff::pause;
use super::types::CrawlTimings;
use crate::classifier::{FormatFault, Outcome, OutcomeClassifier};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SearchError {
    #[error("no valid instance in [{min}, {max}]")]
    NoValidId { min: i64, max: i64 },

    #[error("unexpected {outcome} while probing {instance_id}")]
    Unexpected {
        instance_id: i64,
        outcome: &'static str,
    },
}

/// Bounds of one narrowing pass. `found` is set once any probe resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GapSearchRange {
    min: i64,
    max: i64,
    found: bool,
}

enum Probe {
    Resolvable,
    Missing,
}

/// Probes one id, waiting out transient upstream trouble.
async fn probe(
    classifier: &dyn OutcomeClassifier,
    instance_id: i64,
    timings: &CrawlTimings,
) -> Result<Probe, SearchError> {
    loop {
        match classifier.fetch(instance_id, 0).await {
            Outcome::Success(_) | Outcome::NonRaid(_) => return Ok(Probe::Resolvable),
            Outcome::NotFound => return Ok(Probe::Missing),
            Outcome::SystemDisabled => pause(timings.search_system_disabled_delay).await,
            Outcome::ExternalError
            | Outcome::RateLimited
            | Outcome::BadFormat(FormatFault::Decoding) => {
                pause(timings.search_transient_delay).await
            }
            other @ (Outcome::InsufficientPrivileges
            | Outcome::BadFormat(FormatFault::Malformed)) => {
                return Err(SearchError::Unexpected {
                    instance_id,
                    outcome: other.name(),
                })
            }
        }
    }
}

fn midpoint(min: i64, max: i64) -> i64 {
    min + (max - min) / 2
}

/// One binary-search pass over `[range.min, range.max)`.
///
/// A resolvable probe pulls `max` down to it. A miss moves right once something
/// has resolved (the hole lies left of the boundary) and left otherwise (the
/// probe may be past the live head). Assumes ids stay resolvable past the boundary.
async fn narrow(
    classifier: &dyn OutcomeClassifier,
    range: &mut GapSearchRange,
    timings: &CrawlTimings,
) -> Result<(), SearchError> {
    while range.min < range.max {
        let mid = midpoint(range.min, range.max);
        match probe(classifier, mid, timings).await? {
            Probe::Resolvable => {
                range.found = true;
                range.max = mid;
            }
            Probe::Missing if range.found => range.min = mid + 1,
            Probe::Missing => range.max = mid,
        }
    }
    Ok(())
}

/// Finds the first resolvable id in `[min, max]`.
///
/// Runs narrowing passes. A pass that resolves nothing has only looked left of
/// its first midpoint, so the next pass covers the right half. The upper bound
/// itself is probed last.
pub async fn search_block_start(
    classifier: &dyn OutcomeClassifier,
    min: i64,
    max: i64,
    timings: &CrawlTimings,
) -> Result<i64, SearchError> {
    let mut lo = min;
    while lo < max {
        let first_mid = midpoint(lo, max);
        let mut range = GapSearchRange {
            min: lo,
            max,
            found: false,
        };
        narrow(classifier, &mut range, timings).await?;
        if range.found {
            return Ok(range.max);
        }
        tracing::debug!(
            event = "gap_search_pass_empty",
            min = lo,
            first_mid,
            max,
            "no resolvable id left of midpoint, searching right half"
        );
        lo = first_mid + 1;
    }

    if lo == max && matches!(probe(classifier, max, timings).await?, Probe::Resolvable) {
        return Ok(max);
    }
    Err(SearchError::NoValidId { min, max })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use futures::future::BoxFuture;

    use super::{search_block_start, SearchError};
    use crate::classifier::{Outcome, OutcomeClassifier};
    use crate::crawler::test_support::sample_report;
    use crate::crawler::types::CrawlTimings;

    /// Ids below `boundary` are missing; `boundary` and above resolve.
    struct Boundary {
        boundary: i64,
        head: Option<i64>,
        transient_every: u32,
        calls: AtomicU32,
    }

    impl Boundary {
        fn at(boundary: i64) -> Self {
            Self {
                boundary,
                head: None,
                transient_every: 0,
                calls: AtomicU32::new(0),
            }
        }
    }

    impl OutcomeClassifier for Boundary {
        fn fetch<'a>(&'a self, instance_id: i64, _: u32) -> BoxFuture<'a, Outcome> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if self.transient_every > 0 && call % self.transient_every == 0 {
                    return Outcome::RateLimited;
                }
                let past_head = self.head.is_some_and(|head| instance_id > head);
                if instance_id < self.boundary || past_head {
                    Outcome::NotFound
                } else {
                    Outcome::Success(sample_report(instance_id))
                }
            })
        }
    }

    #[tokio::test]
    async fn finds_exact_boundary_anywhere_in_range() {
        let timings = CrawlTimings::immediate();
        for boundary in [1, 2, 17, 500, 4_999, 5_000, 9_998, 9_999, 10_000] {
            let classifier = Boundary::at(boundary);
            let found = search_block_start(&classifier, 0, 10_000, &timings)
                .await
                .unwrap_or_else(|err| panic!("boundary {boundary}: {err}"));
            assert_eq!(found, boundary);
        }
    }

    #[tokio::test]
    async fn finds_boundary_in_a_realistic_span() {
        let timings = CrawlTimings::immediate();
        let start = 14_000_000_000;
        let classifier = Boundary::at(start + 3_999_123);

        let found = search_block_start(&classifier, start, start + 5_000_000, &timings)
            .await
            .expect("boundary should be found");
        assert_eq!(found, start + 3_999_123);
    }

    #[tokio::test]
    async fn transient_outcomes_retry_without_moving_bounds() {
        let timings = CrawlTimings::immediate();
        let mut classifier = Boundary::at(700);
        classifier.transient_every = 3;

        let found = search_block_start(&classifier, 0, 1_000, &timings)
            .await
            .expect("boundary should be found");
        assert_eq!(found, 700);
    }

    #[tokio::test]
    async fn stops_short_of_unwritten_ids_past_the_head() {
        let timings = CrawlTimings::immediate();
        let mut classifier = Boundary::at(100);
        classifier.head = Some(400);

        let found = search_block_start(&classifier, 0, 1_000, &timings)
            .await
            .expect("boundary should be found");
        assert_eq!(found, 100);
    }

    #[tokio::test]
    async fn empty_range_is_an_error() {
        let timings = CrawlTimings::immediate();
        let classifier = Boundary::at(i64::MAX);

        let err = search_block_start(&classifier, 0, 1_000, &timings)
            .await
            .expect_err("nothing resolves");
        assert_eq!(err, SearchError::NoValidId { min: 0, max: 1_000 });
    }

    #[tokio::test]
    async fn unexpected_outcome_aborts() {
        struct Private;
        impl OutcomeClassifier for Private {
            fn fetch<'a>(&'a self, _: i64, _: u32) -> BoxFuture<'a, Outcome> {
                Box::pin(async { Outcome::InsufficientPrivileges })
            }
        }

        let err = search_block_start(&Private, 0, 10, &CrawlTimings::immediate())
            .await
            .expect_err("must abort");
        assert!(matches!(err, SearchError::Unexpected { instance_id: 5, .. }));
    }
}
