use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::{thread_rng, Rng};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::feed::{CheckOutcome, FeedChecker};

/// Periodically asks the [`FeedChecker`] to check the feed. The checker's own throttle decides
/// whether a check actually fetches anything.
pub struct Poller {
    checker: Arc<FeedChecker>,
    poll_interval: Duration,
    max_initial_sleep: Duration,
    wake_up: Arc<Notify>,
}

impl Poller {
    pub fn new(
        checker: Arc<FeedChecker>,
        poll_interval: Duration,
        max_initial_sleep: Duration,
        wake_up: Arc<Notify>,
    ) -> Self {
        Self {
            checker,
            poll_interval,
            max_initial_sleep,
            wake_up,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        async move {
            let initial_sleep = if self.max_initial_sleep.is_zero() {
                Duration::ZERO
            } else {
                thread_rng().gen_range(Duration::ZERO..self.max_initial_sleep)
            };

            debug!("Scheduling the first check in {}s", initial_sleep.as_secs());
            let mut next_poll = pin!(time::sleep(initial_sleep));
            let mut wake_up = pin!(self.wake_up.notified());

            loop {
                select! {
                    _ = cancel.cancelled() => {
                        debug!("Received a cancellation signal; exiting");
                        break;
                    }

                    _ = &mut wake_up => {
                        wake_up.set(self.wake_up.notified());

                        let preempted_by = next_poll
                            .deadline()
                            .saturating_duration_since(Instant::now())
                            .as_secs();
                        info!(
                            "Received a check request \
                                (preempted the next scheduled check by {preempted_by}s)"
                        );
                    }

                    _ = &mut next_poll => {}
                }

                poll_once(&self.checker).await;

                debug!(
                    "Scheduling the next check in {}s",
                    self.poll_interval.as_secs()
                );
                next_poll
                    .as_mut()
                    .reset(Instant::now() + self.poll_interval);
            }

            Ok(())
        }
        .instrument(info_span!("poller"))
        .await
    }
}

/// Runs one throttled check, logging its outcome.
pub async fn poll_once(checker: &FeedChecker) -> Option<CheckOutcome> {
    match checker.check_for_updates().await {
        Ok(outcome) => {
            match outcome {
                CheckOutcome::Throttled { next_check_in } => {
                    debug!("The feed is not due for a check for another {next_check_in}s")
                }

                CheckOutcome::NoEntries => info!("Checked the feed: no entries"),
                CheckOutcome::Ingested { received, stored } => {
                    debug!(received, stored, "Checked the feed")
                }

                CheckOutcome::FetchFailed | CheckOutcome::ParseFailed => {
                    info!("Checked the feed: nothing could be read ({outcome:?})")
                }
            }

            Some(outcome)
        }

        Err(e) => {
            error!(
                "Encountered a failure while checking `{}`: {e:#}",
                checker.feed_url()
            );

            None
        }
    }
}
