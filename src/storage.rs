pub mod entities;

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool, Transaction};
use time::OffsetDateTime;
use tracing::{debug, info, instrument, trace_span, Instrument};

use crate::feed::FeedEntry;
use crate::layout::LayoutUpdate;

#[cfg(test)]
use self::entities::LayoutLink;
use self::entities::{Notification, SeverityCount};

pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        let pool = SqlitePoolOptions::new()
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(db_path)
                    .foreign_keys(true)
                    .journal_mode(SqliteJournalMode::Delete)
                    .create_if_missing(true),
            )
            .await
            .with_context(|| anyhow!("could not open a SQLite database `{}`", db_path.display()))?;
        info!("Using an SQLite database `{}`", db_path.display());

        Self::from_pool(pool).await
    }

    /// Opens a private in-memory database. Every connection would see a different database, so
    /// the pool is kept at exactly one long-lived connection.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        use std::str::FromStr;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true))
            .await
            .context("could not open an in-memory SQLite database")?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!()
            .run(&pool)
            .await
            .with_context(|| anyhow!("could not prepare a database schema"))?;

        Ok(Self { pool })
    }

    pub async fn begin(&self) -> Result<Tx> {
        self.pool
            .begin()
            .await
            .context("could not begin a new DB transaction")
            .map(Tx)
    }

    /// Closes every connection. Transactions can no longer be started afterwards.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub struct Tx(Transaction<'static, Sqlite>);

impl Tx {
    pub async fn commit(self) -> Result<()> {
        self.0
            .commit()
            .await
            .context("could not commit a DB transaction")
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn load_flag(&mut self, flag_code: &str) -> Result<Option<i64>> {
        sqlx::query_scalar(
            "SELECT value
            FROM flags
            WHERE flag_code = ?1",
        )
        .bind(flag_code)
        .fetch_optional(self.0.as_mut())
        .await
        .with_context(|| anyhow!("could not load the flag `{flag_code}`"))
    }

    /// Stores `value` under `flag_code` unconditionally.
    ///
    /// Returns `false` if the value found just before the write differs from `observed`, meaning
    /// someone else has written the flag since the caller last read it.
    #[instrument(level = "TRACE", skip(self))]
    pub async fn save_flag(
        &mut self,
        flag_code: &str,
        observed: Option<i64>,
        value: i64,
    ) -> Result<bool> {
        let current = self.load_flag(flag_code).await?;

        sqlx::query(
            "INSERT
            INTO flags (flag_code, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (flag_code) DO UPDATE SET
              value = excluded.value,
              updated_at = excluded.updated_at",
        )
        .bind(flag_code)
        .bind(value)
        .bind(OffsetDateTime::now_utc())
        .execute(self.0.as_mut())
        .await
        .with_context(|| anyhow!("could not save the flag `{flag_code}`"))?;

        Ok(current == observed)
    }

    /// Adds the entries to the inbox in the given order, skipping those already known: by url, or
    /// by title for entries without a link. Returns the number of notifications actually stored.
    #[instrument(level = "TRACE", skip(self, entries), fields(entry_count = entries.len()))]
    pub async fn ingest_notifications(&mut self, entries: &[FeedEntry]) -> Result<usize> {
        let mut stored = 0;

        for (idx, entry) in entries.iter().enumerate() {
            let inserted = async {
                sqlx::query(
                    "INSERT OR IGNORE
                    INTO notifications (severity, date_added, title, description, url)
                    VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .bind(entry.severity)
                .bind(entry.date_added())
                .bind(&entry.title)
                .bind(&entry.description)
                .bind(&entry.url)
                .execute(self.0.as_mut())
                .await
                .context("could not insert a notification")
            }
            .instrument(trace_span!("insert_notification", %idx))
            .await?
            .rows_affected();

            if inserted == 0 {
                debug!(url = %entry.url, title = %entry.title, "Notification already known, skipping");
            }

            stored += inserted as usize;
        }

        Ok(stored)
    }

    /// Returns notifications that were not removed, newest first.
    #[instrument(level = "TRACE", skip(self))]
    pub async fn get_notifications(&mut self, count: usize) -> Result<Vec<Notification>> {
        sqlx::query_as(
            "SELECT
              notification_id,
              severity,
              date_added,
              title,
              description,
              url,
              is_read,
              is_remove
            FROM notifications
            WHERE is_remove = 0
            ORDER BY date_added DESC, notification_id DESC
            LIMIT ?1",
        )
        .bind(count as i64)
        .fetch_all(self.0.as_mut())
        .await
        .context("could not retrieve notifications")
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn mark_notification_read(&mut self, notification_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE notifications
            SET is_read = 1
            WHERE notification_id = ?1 AND is_remove = 0",
        )
        .bind(notification_id)
        .execute(self.0.as_mut())
        .await
        .context("could not mark a notification as read")?;

        Ok(result.rows_affected() > 0)
    }

    /// Hides a notification. The row is kept so that the feed cannot bring it back.
    #[instrument(level = "TRACE", skip(self))]
    pub async fn remove_notification(&mut self, notification_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE notifications
            SET is_remove = 1, is_read = 1
            WHERE notification_id = ?1 AND is_remove = 0",
        )
        .bind(notification_id)
        .execute(self.0.as_mut())
        .await
        .context("could not remove a notification")?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn get_unread_severity_counts(&mut self) -> Result<Vec<SeverityCount>> {
        sqlx::query_as(
            "SELECT severity, COUNT(*) AS count
            FROM notifications
            WHERE is_read = 0 AND is_remove = 0
            GROUP BY severity
            ORDER BY severity ASC",
        )
        .fetch_all(self.0.as_mut())
        .await
        .context("could not count unread notifications")
    }

    /// Creates the layout update if it has no id yet and updates it otherwise. Returns its id.
    #[instrument(level = "TRACE", skip(self, update), fields(handle = %update.handle))]
    pub async fn save_layout_update(&mut self, update: &LayoutUpdate) -> Result<i64> {
        let now = OffsetDateTime::now_utc();

        let id: i64 = match update.layout_update_id {
            None => sqlx::query_scalar(
                "INSERT
                INTO layout_updates (handle, xml, sort_order, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                RETURNING layout_update_id",
            )
            .bind(&update.handle)
            .bind(&update.xml)
            .bind(update.sort_order)
            .bind(now)
            .fetch_one(self.0.as_mut())
            .await
            .context("could not insert a layout update")?,

            Some(id) => sqlx::query_scalar(
                "UPDATE layout_updates
                SET handle = ?2, xml = ?3, sort_order = ?4, updated_at = ?5
                WHERE layout_update_id = ?1
                RETURNING layout_update_id",
            )
            .bind(id)
            .bind(&update.handle)
            .bind(&update.xml)
            .bind(update.sort_order)
            .bind(now)
            .fetch_optional(self.0.as_mut())
            .await
            .context("could not update a layout update")?
            .ok_or_else(|| anyhow!("layout update #{id} does not exist"))?,
        };

        Ok(id)
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn upsert_layout_link(
        &mut self,
        store_id: i64,
        theme_id: i64,
        layout_update_id: i64,
        is_temporary: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT
            INTO layout_links (store_id, theme_id, layout_update_id, is_temporary)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (store_id, theme_id, layout_update_id) DO UPDATE SET
              is_temporary = excluded.is_temporary",
        )
        .bind(store_id)
        .bind(theme_id)
        .bind(layout_update_id)
        .bind(is_temporary)
        .execute(self.0.as_mut())
        .await
        .context("could not save a layout link")?;

        Ok(())
    }

    #[cfg(test)]
    pub async fn get_layout_links(&mut self, layout_update_id: i64) -> Result<Vec<LayoutLink>> {
        sqlx::query_as(
            "SELECT layout_link_id, store_id, theme_id, layout_update_id, is_temporary
            FROM layout_links
            WHERE layout_update_id = ?1
            ORDER BY layout_link_id ASC",
        )
        .bind(layout_update_id)
        .fetch_all(self.0.as_mut())
        .await
        .context("could not retrieve layout links")
    }

    /// Returns the bodies of the layout updates linked to the handle for the theme and either the
    /// store or the default store (`0`), ordered by their sort order.
    ///
    /// Default-store and store-specific links are not deduplicated against each other.
    #[instrument(level = "TRACE", skip(self))]
    pub async fn fetch_updates_by_handle(
        &mut self,
        handle: &str,
        theme_id: i64,
        store_id: i64,
        include_temporary: bool,
    ) -> Result<Vec<String>> {
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT layout_update.xml
            FROM layout_updates AS layout_update
              INNER JOIN layout_links AS link
                ON (link.layout_update_id = layout_update.layout_update_id)
            WHERE link.store_id IN (0, ",
        );
        query
            .push_bind(store_id)
            .push(") AND link.theme_id = ")
            .push_bind(theme_id)
            .push(" AND layout_update.handle = ")
            .push_bind(handle);

        if !include_temporary {
            query.push(" AND link.is_temporary = 0");
        }

        query.push(" ORDER BY layout_update.sort_order ASC");

        query
            .build_query_scalar()
            .fetch_all(self.0.as_mut())
            .await
            .with_context(|| anyhow!("could not fetch layout updates for the handle `{handle}`"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(url: &str, title: &str) -> FeedEntry {
        FeedEntry {
            severity: 4,
            published_at: OffsetDateTime::UNIX_EPOCH,
            title: title.into(),
            description: String::new(),
            url: url.into(),
        }
    }

    #[tokio::test]
    async fn flag_save_reports_concurrent_writes() {
        let storage = Storage::in_memory().await.expect("storage must open");
        let mut tx = storage.begin().await.expect("tx must begin");

        assert_eq!(tx.load_flag("last_check").await.unwrap(), None);
        assert!(tx.save_flag("last_check", None, 100).await.unwrap());
        assert_eq!(tx.load_flag("last_check").await.unwrap(), Some(100));

        // someone else saw `None` too.
        assert!(!tx.save_flag("last_check", None, 200).await.unwrap());
        assert_eq!(tx.load_flag("last_check").await.unwrap(), Some(200));
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn ingestion_skips_known_urls() {
        let storage = Storage::in_memory().await.expect("storage must open");

        let mut tx = storage.begin().await.unwrap();
        let stored = tx
            .ingest_notifications(&[entry("https://a", "A"), entry("https://b", "B")])
            .await
            .unwrap();
        assert_eq!(stored, 2);

        let stored = tx
            .ingest_notifications(&[entry("https://b", "B again"), entry("https://c", "C")])
            .await
            .unwrap();
        assert_eq!(stored, 1);

        let titles = tx
            .get_notifications(10)
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.title)
            .collect::<Vec<_>>();
        tx.commit().await.unwrap();

        assert_eq!(titles, ["C", "B", "A"]);
    }

    #[tokio::test]
    async fn link_less_notifications_are_told_apart_by_title() {
        let storage = Storage::in_memory().await.expect("storage must open");

        let mut tx = storage.begin().await.unwrap();
        let stored = tx
            .ingest_notifications(&[entry("", "Maintenance"), entry("", "Price change")])
            .await
            .unwrap();
        assert_eq!(stored, 2);

        let stored = tx
            .ingest_notifications(&[entry("", "Maintenance"), entry("https://m", "Maintenance")])
            .await
            .unwrap();
        assert_eq!(stored, 1);

        let urls = tx
            .get_notifications(10)
            .await
            .unwrap()
            .into_iter()
            .map(|n| (n.title, n.url))
            .collect::<Vec<_>>();
        tx.commit().await.unwrap();

        assert_eq!(urls.len(), 3);
        assert!(urls.contains(&("Maintenance".into(), "https://m".into())));
    }

    #[tokio::test]
    async fn read_and_removed_notifications_leave_the_unread_counts() {
        let storage = Storage::in_memory().await.expect("storage must open");
        let mut critical = entry("https://critical", "Critical");
        critical.severity = 1;

        let mut tx = storage.begin().await.unwrap();
        tx.ingest_notifications(&[critical, entry("https://n1", "N1"), entry("https://n2", "N2")])
            .await
            .unwrap();
        let counts = tx.get_unread_severity_counts().await.unwrap();
        assert_eq!(
            counts,
            [
                SeverityCount { severity: 1, count: 1 },
                SeverityCount { severity: 4, count: 2 },
            ]
        );

        let ids = tx
            .get_notifications(10)
            .await
            .unwrap()
            .into_iter()
            .map(|n| (n.title, n.notification_id))
            .collect::<std::collections::HashMap<_, _>>();

        assert!(tx.mark_notification_read(ids["Critical"]).await.unwrap());
        assert!(tx.remove_notification(ids["N1"]).await.unwrap());
        assert!(!tx.remove_notification(ids["N1"]).await.unwrap());
        assert!(!tx.mark_notification_read(9999).await.unwrap());

        let counts = tx.get_unread_severity_counts().await.unwrap();
        assert_eq!(counts, [SeverityCount { severity: 4, count: 1 }]);

        let remaining = tx.get_notifications(10).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|n| n.title != "N1"));
    }
}
