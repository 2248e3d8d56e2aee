mod entry;
mod parser;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use time::OffsetDateTime;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::NotificationConfig;
use crate::storage::Storage;

pub use self::entry::*;
pub use self::parser::parse_feed;

/// Flag holding the unix time of the last completed check.
pub const LAST_CHECK_FLAG: &str = "admin_notifications_lastcheck";

const FETCH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(thiserror::Error, Debug)]
pub enum FeedError {
    #[error("could not fetch the feed")]
    Fetch(#[source] reqwest::Error),

    #[error("the feed server responded with {0}")]
    Status(reqwest::StatusCode),

    #[error("could not parse the feed: {0}")]
    Parse(String),
}

/// What a call to [`FeedChecker::check_for_updates`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The previous check is too recent; nothing was fetched.
    Throttled { next_check_in: i64 },

    /// The feed was fetched but had no items.
    NoEntries,

    /// `received` items were handed to the inbox, which stored `stored` of them.
    Ingested { received: usize, stored: usize },

    FetchFailed,
    ParseFailed,
}

/// Polls the admin notification feed and feeds its items into the notification inbox.
pub struct FeedChecker {
    cfg: NotificationConfig,
    storage: Arc<Storage>,
    http_client: reqwest::Client,
    feed_url: OnceLock<String>,
}

impl FeedChecker {
    pub fn new(cfg: NotificationConfig, storage: Arc<Storage>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .context("could not create an HTTP client")?;

        Ok(Self {
            cfg,
            storage,
            http_client,
            feed_url: OnceLock::new(),
        })
    }

    /// The feed url. Computed on first use and kept for the lifetime of the checker.
    pub fn feed_url(&self) -> &str {
        self.feed_url.get_or_init(|| {
            let scheme = if self.cfg.use_https {
                "https://"
            } else {
                "http://"
            };

            format!("{scheme}{}", self.cfg.feed_url)
        })
    }

    /// Minimum number of seconds between two checks.
    pub fn frequency(&self) -> i64 {
        self.cfg.frequency.saturating_mul(3600)
    }

    pub async fn last_check(&self) -> Result<Option<i64>> {
        let mut tx = self.storage.begin().await?;
        let last_check = tx.load_flag(LAST_CHECK_FLAG).await?;
        tx.commit().await?;

        Ok(last_check)
    }

    async fn set_last_check(&self, observed: Option<i64>) -> Result<()> {
        let now = OffsetDateTime::now_utc().unix_timestamp();

        let mut tx = self.storage.begin().await?;
        let uncontended = tx.save_flag(LAST_CHECK_FLAG, observed, now).await?;
        tx.commit().await?;

        if !uncontended {
            // nothing prevents two checkers from passing the throttle at once.
            warn!("Another feed check completed concurrently with this one");
        }

        Ok(())
    }

    /// Fetches the feed unless the last check happened less than [`Self::frequency`] seconds
    /// ago, and ingests its items oldest first.
    ///
    /// Fetch and parse failures are part of the outcome, not errors. Once past the throttle,
    /// the last check time is advanced whatever the outcome, so a feed outage cannot cause
    /// checks to happen more often than configured.
    #[instrument(level = "DEBUG", skip(self), fields(feed_url = %self.feed_url()))]
    pub async fn check_for_updates(&self) -> Result<CheckOutcome> {
        let last_check = self
            .last_check()
            .await
            .context("could not load the last check time")?;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let next_check = last_check.unwrap_or(0).saturating_add(self.frequency());

        if next_check > now {
            trace!(last_check, "The feed was checked recently, skipping");

            return Ok(CheckOutcome::Throttled {
                next_check_in: next_check - now,
            });
        }

        let outcome = match self.fetch_entries().await {
            Ok(entries) if entries.is_empty() => {
                debug!("The feed has no entries");

                Ok(CheckOutcome::NoEntries)
            }

            Ok(mut entries) => {
                entries.reverse();
                self.ingest(entries).await
            }

            Err(e @ FeedError::Parse(_)) => {
                warn!("{:#}", anyhow::Error::from(e));

                Ok(CheckOutcome::ParseFailed)
            }

            Err(e) => {
                warn!("{:#}", anyhow::Error::from(e));

                Ok(CheckOutcome::FetchFailed)
            }
        };

        self.set_last_check(last_check)
            .await
            .context("could not save the last check time")?;

        outcome
    }

    async fn fetch_entries(&self) -> Result<Vec<FeedEntry>, FeedError> {
        let response = self
            .http_client
            .get(self.feed_url())
            .send()
            .await
            .map_err(FeedError::Fetch)?;

        let status = response.status();

        if !status.is_success() {
            return Err(FeedError::Status(status));
        }

        let body = response.text().await.map_err(FeedError::Fetch)?;

        parse_feed(&body)
    }

    async fn ingest(&self, entries: Vec<FeedEntry>) -> Result<CheckOutcome> {
        let received = entries.len();

        let mut tx = self.storage.begin().await?;
        let stored = tx
            .ingest_notifications(&entries)
            .await
            .context("could not store notifications to the DB")?;
        tx.commit().await?;

        info!("Received {received} notifications, {stored} of them new");

        Ok(CheckOutcome::Ingested { received, stored })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;

    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<rss version="2.0">
  <channel>
    <title>Admin notifications</title>
    <item>
      <title>Newest</title>
      <link>https://example.com/n/3</link>
      <severity>1</severity>
      <description>third</description>
      <pubDate>Fri, 07 Jun 2024 12:00:00 +0200</pubDate>
    </item>
    <item>
      <title>Middle</title>
      <link>https://example.com/n/2</link>
      <severity> 3 </severity>
      <description>second</description>
      <pubDate>Thu, 06 Jun 2024 12:00:00 +0000</pubDate>
    </item>
    <item>
      <title>Oldest</title>
      <link>https://example.com/n/1</link>
      <severity>notice</severity>
      <description>first</description>
      <pubDate>Wed, 05 Jun 2024 12:00:00 +0000</pubDate>
    </item>
  </channel>
</rss>
"#;

    #[derive(Clone)]
    struct FeedServer {
        status: StatusCode,
        body: &'static str,
        hits: Arc<AtomicUsize>,
    }

    async fn feed_handler(State(server): State<FeedServer>) -> (StatusCode, &'static str) {
        server.hits.fetch_add(1, Ordering::SeqCst);

        (server.status, server.body)
    }

    /// Serves `body` and returns the scheme-less feed url along with a request counter.
    async fn spawn_feed_server(status: StatusCode, body: &'static str) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/feed.rss", get(feed_handler))
            .with_state(FeedServer {
                status,
                body,
                hits: hits.clone(),
            });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let address = listener.local_addr().expect("local addr should exist");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("server should run");
        });

        (format!("{address}/feed.rss"), hits)
    }

    async fn checker(feed_url: String, frequency: i64) -> (FeedChecker, Arc<Storage>) {
        let storage = Arc::new(Storage::in_memory().await.expect("storage must open"));
        let cfg = NotificationConfig {
            use_https: false,
            feed_url,
            frequency,
        };

        (
            FeedChecker::new(cfg, storage.clone()).expect("checker must build"),
            storage,
        )
    }

    async fn notification_count(storage: &Storage) -> usize {
        let mut tx = storage.begin().await.unwrap();
        let count = tx.get_notifications(100).await.unwrap().len();
        tx.commit().await.unwrap();

        count
    }

    fn assert_recent(timestamp: Option<i64>) {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let timestamp = timestamp.expect("the last check time must be set");

        assert!((now - 5..=now).contains(&timestamp), "{timestamp} is not recent");
    }

    #[tokio::test]
    async fn feed_url_is_memoized() {
        let (checker, _) = checker("feeds.example.com/notifications.rss".into(), 1).await;
        assert_eq!(checker.feed_url(), "http://feeds.example.com/notifications.rss");

        let storage = Arc::new(Storage::in_memory().await.unwrap());
        let https = FeedChecker::new(
            NotificationConfig {
                use_https: true,
                feed_url: "feeds.example.com/x".into(),
                frequency: 2,
            },
            storage,
        )
        .unwrap();
        assert_eq!(https.feed_url(), "https://feeds.example.com/x");
        assert!(std::ptr::eq(https.feed_url(), https.feed_url()));
        assert_eq!(https.frequency(), 7200);
    }

    #[tokio::test]
    async fn entries_are_ingested_oldest_first() {
        let (url, hits) = spawn_feed_server(StatusCode::OK, FEED).await;
        let (checker, storage) = checker(url, 1).await;

        let outcome = checker.check_for_updates().await.expect("check must succeed");
        assert_eq!(
            outcome,
            CheckOutcome::Ingested {
                received: 3,
                stored: 3
            }
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let mut tx = storage.begin().await.unwrap();
        let notifications = tx.get_notifications(10).await.unwrap();
        tx.commit().await.unwrap();

        let by_title = notifications
            .iter()
            .map(|n| (n.title.as_str(), n))
            .collect::<HashMap<_, _>>();
        assert!(by_title["Oldest"].notification_id < by_title["Middle"].notification_id);
        assert!(by_title["Middle"].notification_id < by_title["Newest"].notification_id);

        assert_eq!(by_title["Newest"].severity, 1);
        assert_eq!(by_title["Middle"].severity, 3);
        assert_eq!(by_title["Oldest"].severity, 0);
        assert_eq!(by_title["Newest"].date_added, "2024-06-07 10:00:00");
        assert_eq!(by_title["Oldest"].date_added, "2024-06-05 12:00:00");
        assert_eq!(by_title["Middle"].url, "https://example.com/n/2");

        assert_recent(checker.last_check().await.unwrap());
    }

    #[tokio::test]
    async fn checks_within_the_window_fetch_once() {
        let (url, hits) = spawn_feed_server(StatusCode::OK, FEED).await;
        let (checker, _) = checker(url, 1).await;

        checker.check_for_updates().await.unwrap();
        let second = checker.check_for_updates().await.unwrap();

        assert!(matches!(
            second,
            CheckOutcome::Throttled { next_check_in } if next_check_in > 3590
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_frequency_disables_throttling() {
        let (url, hits) = spawn_feed_server(StatusCode::OK, FEED).await;
        let (checker, storage) = checker(url, 0).await;

        checker.check_for_updates().await.unwrap();
        let second = checker.check_for_updates().await.unwrap();

        assert_eq!(
            second,
            CheckOutcome::Ingested {
                received: 3,
                stored: 0
            }
        );
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(notification_count(&storage).await, 3);
    }

    #[tokio::test]
    async fn malformed_feeds_are_not_ingested_but_advance_the_clock() {
        let (url, hits) = spawn_feed_server(StatusCode::OK, "<rss><channel>").await;
        let (checker, storage) = checker(url, 1).await;

        assert_eq!(
            checker.check_for_updates().await.unwrap(),
            CheckOutcome::ParseFailed
        );
        assert_eq!(notification_count(&storage).await, 0);
        assert_recent(checker.last_check().await.unwrap());

        assert!(matches!(
            checker.check_for_updates().await.unwrap(),
            CheckOutcome::Throttled { .. }
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transport_failures_advance_the_clock() {
        let address = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let (checker, storage) = checker(format!("{address}/feed.rss"), 1).await;

        assert_eq!(
            checker.check_for_updates().await.unwrap(),
            CheckOutcome::FetchFailed
        );
        assert_eq!(notification_count(&storage).await, 0);
        assert_recent(checker.last_check().await.unwrap());
    }

    #[tokio::test]
    async fn error_statuses_are_fetch_failures() {
        let (url, _) = spawn_feed_server(StatusCode::INTERNAL_SERVER_ERROR, FEED).await;
        let (checker, storage) = checker(url, 1).await;

        assert_eq!(
            checker.check_for_updates().await.unwrap(),
            CheckOutcome::FetchFailed
        );
        assert_eq!(notification_count(&storage).await, 0);
        assert_recent(checker.last_check().await.unwrap());
    }

    #[tokio::test]
    async fn empty_feeds_have_no_entries() {
        let (url, _) =
            spawn_feed_server(StatusCode::OK, "<rss><channel><title>t</title></channel></rss>")
                .await;
        let (checker, _) = checker(url, 1).await;

        assert_eq!(
            checker.check_for_updates().await.unwrap(),
            CheckOutcome::NoEntries
        );
        assert_recent(checker.last_check().await.unwrap());
    }

    #[tokio::test]
    async fn stale_last_check_lets_the_check_through() {
        let (url, hits) = spawn_feed_server(StatusCode::OK, FEED).await;
        let (checker, storage) = checker(url, 1).await;

        let two_hours_ago = OffsetDateTime::now_utc().unix_timestamp() - 7200;
        let mut tx = storage.begin().await.unwrap();
        tx.save_flag(LAST_CHECK_FLAG, None, two_hours_ago).await.unwrap();
        tx.commit().await.unwrap();

        checker.check_for_updates().await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_recent(checker.last_check().await.unwrap());
    }

    /// Stamps the last check time while serving, as a second checker finishing first would.
    async fn overtaking_feed_handler(
        State(storage): State<Arc<Storage>>,
    ) -> (StatusCode, &'static str) {
        let mut tx = storage.begin().await.unwrap();
        let observed = tx.load_flag(LAST_CHECK_FLAG).await.unwrap();
        tx.save_flag(LAST_CHECK_FLAG, observed, 1).await.unwrap();
        tx.commit().await.unwrap();

        (StatusCode::OK, FEED)
    }

    #[tokio::test]
    async fn checks_overtaken_by_another_one_still_complete() {
        let storage = Arc::new(Storage::in_memory().await.expect("storage must open"));
        let app = Router::new()
            .route("/feed.rss", get(overtaking_feed_handler))
            .with_state(storage.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let address = listener.local_addr().expect("local addr should exist");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("server should run");
        });

        let checker = FeedChecker::new(
            NotificationConfig {
                use_https: false,
                feed_url: format!("{address}/feed.rss"),
                frequency: 1,
            },
            storage.clone(),
        )
        .expect("checker must build");

        assert_eq!(
            checker.check_for_updates().await.unwrap(),
            CheckOutcome::Ingested {
                received: 3,
                stored: 3
            }
        );
        assert_eq!(notification_count(&storage).await, 3);
        assert_recent(checker.last_check().await.unwrap());
    }
}
