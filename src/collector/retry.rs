//! Fetch-with-retry state machine.
//!
//! ```text
//! Attempting ──ok──────────────▶ Succeeded
//!     │ err
//!     ├─ RetryAfter(d) ─▶ Backoff ──d elapsed──▶ Attempting
//!     └─ GiveUp ───────▶ GivenUp
//! ```
//!
//! The stop signal cancels the machine while it waits on the network or in
//! backoff. Transitions are decided by [`BackoffPolicy`] alone.

use std::time::Duration;

use tokio::time::Instant;

use crate::collector::backoff::{BackoffPolicy, DEFAULT_MAX_RETRY_AFTER, RetryDecision};
use crate::collector::signal::StopSignal;
use crate::collector::{FetchError, LocationPage, LocationSource};
use crate::storage::Cursor;

/// States of a single fetch operation. `attempt` is 1-based.
#[derive(Debug)]
pub enum RetryState {
    Attempting { attempt: u32 },
    Backoff { attempt: u32, delay: Duration },
    Succeeded { attempts: u32, page: LocationPage },
    GivenUp { attempts: u32, error: FetchError },
    Cancelled { attempts: u32 },
}

impl RetryState {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded { .. } | Self::GivenUp { .. } | Self::Cancelled { .. }
        )
    }
}

/// Terminal outcome of [`fetch_with_retry`].
#[derive(Debug)]
pub enum FetchOutcome {
    Succeeded { attempts: u32, page: LocationPage },
    GivenUp { attempts: u32, error: FetchError },
    Cancelled { attempts: u32 },
}

impl FetchOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts, .. }
            | Self::GivenUp { attempts, .. }
            | Self::Cancelled { attempts } => *attempts,
        }
    }
}

/// Fetch from `source`, retrying per `policy` until success, give-up or stop.
pub async fn fetch_with_retry<S>(
    source: &S,
    cursor: Option<&Cursor>,
    policy: &BackoffPolicy,
    stop: &mut StopSignal,
) -> FetchOutcome
where
    S: LocationSource + ?Sized,
{
    let mut state = RetryState::Attempting { attempt: 1 };
    while !state.is_terminal() {
        state = step(state, source, cursor, policy, stop).await;
    }

    match state {
        RetryState::Succeeded { attempts, page } => FetchOutcome::Succeeded { attempts, page },
        RetryState::GivenUp { attempts, error } => FetchOutcome::GivenUp { attempts, error },
        RetryState::Cancelled { attempts }
        | RetryState::Attempting { attempt: attempts }
        | RetryState::Backoff {
            attempt: attempts, ..
        } => FetchOutcome::Cancelled { attempts },
    }
}

async fn step<S>(
    state: RetryState,
    source: &S,
    cursor: Option<&Cursor>,
    policy: &BackoffPolicy,
    stop: &mut StopSignal,
) -> RetryState
where
    S: LocationSource + ?Sized,
{
    match state {
        RetryState::Attempting { attempt } => {
            let result = tokio::select! {
                biased;
                () = stop.stopped() => {
                    tracing::info!(source = source.name(), attempt, "Fetch cancelled by stop signal");
                    return RetryState::Cancelled { attempts: attempt };
                }
                result = source.fetch_locations(cursor) => result,
            };

            match result {
                Ok(page) => {
                    tracing::debug!(
                        source = source.name(),
                        attempt,
                        records = page.records.len(),
                        rejected = page.rejected.len(),
                        "Fetch succeeded"
                    );
                    RetryState::Succeeded {
                        attempts: attempt,
                        page,
                    }
                }
                Err(error) => match policy.next_delay(attempt, error.kind()) {
                    RetryDecision::RetryAfter(delay) => {
                        tracing::warn!(
                            source = source.name(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Fetch failed, backing off"
                        );
                        RetryState::Backoff { attempt, delay }
                    }
                    RetryDecision::GiveUp => {
                        tracing::error!(
                            source = source.name(),
                            attempt,
                            fatal = error.is_fatal(),
                            error = %error,
                            "Fetch failed, giving up"
                        );
                        RetryState::GivenUp {
                            attempts: attempt,
                            error,
                        }
                    }
                },
            }
        }
        RetryState::Backoff { attempt, delay } => {
            let now = Instant::now();
            let deadline = now
                .checked_add(delay)
                .unwrap_or_else(|| now + policy.max_retry_after().min(DEFAULT_MAX_RETRY_AFTER));
            if stop.sleep_until(deadline).await {
                RetryState::Attempting {
                    attempt: attempt + 1,
                }
            } else {
                tracing::info!(source = source.name(), attempt, "Backoff cancelled by stop signal");
                RetryState::Cancelled { attempts: attempt }
            }
        }
        terminal => terminal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::signal::stop_channel;
    use crate::collector::testing::{ScriptedSource, sample_records};

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(2), 5)
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_three_transient_failures() {
        let source = ScriptedSource::new(vec![
            Err(FetchError::transient("timeout")),
            Err(FetchError::transient("503")),
            Err(FetchError::transient("connection reset")),
            Ok(LocationPage::new(sample_records())),
        ]);
        let (_handle, mut stop) = stop_channel();

        let outcome = fetch_with_retry(&source, None, &fast_policy(), &mut stop).await;
        match outcome {
            FetchOutcome::Succeeded { attempts, page } => {
                assert_eq!(attempts, 4);
                assert_eq!(page.records, sample_records());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(source.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let source = ScriptedSource::new(vec![Err(FetchError::fatal("revoked credentials"))]);
        let (_handle, mut stop) = stop_channel();

        let outcome = fetch_with_retry(&source, None, &fast_policy(), &mut stop).await;
        assert!(matches!(
            outcome,
            FetchOutcome::GivenUp { attempts: 1, ref error } if error.is_fatal()
        ));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_retry_cap() {
        let source = ScriptedSource::new(
            (0..10).map(|_| Err(FetchError::transient("503"))).collect(),
        );
        let (_handle, mut stop) = stop_channel();

        let outcome = fetch_with_retry(&source, None, &fast_policy(), &mut stop).await;
        assert!(matches!(outcome, FetchOutcome::GivenUp { attempts: 6, .. }));
        assert_eq!(source.calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_waits_for_retry_after() {
        let source = ScriptedSource::new(vec![
            Err(FetchError::rate_limited("429", Some(Duration::from_secs(30)))),
            Ok(LocationPage::default()),
        ]);
        let (_handle, mut stop) = stop_channel();
        let start = Instant::now();

        let outcome = fetch_with_retry(&source, None, &fast_policy(), &mut stop).await;
        assert!(matches!(outcome, FetchOutcome::Succeeded { attempts: 2, .. }));
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_retry_after_is_capped() {
        let source = ScriptedSource::new(vec![
            Err(FetchError::rate_limited("429", Some(Duration::from_secs(u64::MAX)))),
            Ok(LocationPage::new(sample_records())),
        ]);
        let policy = fast_policy().with_max_retry_after(Duration::from_secs(90));
        let (_handle, mut stop) = stop_channel();
        let start = Instant::now();

        let outcome = fetch_with_retry(&source, None, &policy, &mut stop).await;
        assert!(matches!(outcome, FetchOutcome::Succeeded { attempts: 2, .. }));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(90), "{waited:?}");
        assert!(waited < Duration::from_secs(91), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_backoff_cancels() {
        let source = ScriptedSource::new(vec![
            Err(FetchError::rate_limited("429", Some(Duration::from_secs(600)))),
            Ok(LocationPage::new(sample_records())),
        ]);
        let (handle, mut stop) = stop_channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            handle.stop();
        });

        let outcome = fetch_with_retry(&source, None, &fast_policy(), &mut stop).await;
        assert!(matches!(outcome, FetchOutcome::Cancelled { attempts: 1 }));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_stop_before_first_attempt() {
        let source = ScriptedSource::new(vec![Ok(LocationPage::new(sample_records()))]);
        let (handle, mut stop) = stop_channel();
        handle.stop();

        let outcome = fetch_with_retry(&source, None, &fast_policy(), &mut stop).await;
        assert!(matches!(outcome, FetchOutcome::Cancelled { attempts: 1 }));
        assert_eq!(source.calls(), 0);
    }
}
