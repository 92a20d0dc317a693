use anyhow::Result;
use chrono::{DateTime, Utc};

use super::schema::Database;
use super::types::{from_ts, opt_ts, to_ts, Feed, FeedRow, TIME_MAX_SECS};

const FEED_COLUMNS: &str = "url, title, link, hub, updated, date, checked, next_update, \
     last_viewed, subscribed, sub_requested, errors, average_secs";

/// Key of a feed whose next poll is due, as handed to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct DueFeed {
    pub url: String,
    pub next_update: DateTime<Utc>,
}

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    pub async fn get_feed(&self, url: &str) -> Result<Option<Feed>> {
        let row: Option<FeedRow> =
            sqlx::query_as(&format!("SELECT {FEED_COLUMNS} FROM feeds WHERE url = ?"))
                .bind(url)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(FeedRow::into_feed))
    }

    /// Insert or fully overwrite a feed record.
    pub async fn put_feed(&self, feed: &Feed) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_feed(&mut *conn, feed).await?;
        Ok(())
    }

    /// Insert a feed unless one with the same URL already exists.
    ///
    /// Returns `true` when the row was created.
    pub async fn insert_feed_if_absent(&self, feed: &Feed) -> Result<bool> {
        let result = sqlx::query(&format!(
            "INSERT OR IGNORE INTO feeds ({FEED_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&feed.url)
        .bind(&feed.title)
        .bind(&feed.link)
        .bind(&feed.hub)
        .bind(opt_ts(feed.updated))
        .bind(opt_ts(feed.date))
        .bind(opt_ts(feed.checked))
        .bind(to_ts(feed.next_update))
        .bind(opt_ts(feed.last_viewed))
        .bind(opt_ts(feed.subscribed))
        .bind(opt_ts(feed.sub_requested))
        .bind(i64::from(feed.errors))
        .bind(feed.average.num_seconds())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Page through feeds due at or before `now`, ordered by `(next_update, url)`.
    ///
    /// `after` is the last key of the previous page.
    pub async fn due_feeds(
        &self,
        now: DateTime<Utc>,
        after: Option<&DueFeed>,
        limit: usize,
    ) -> Result<Vec<DueFeed>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<(String, i64)> = match after {
            Some(key) => {
                sqlx::query_as(
                    "SELECT url, next_update FROM feeds \
                     WHERE next_update <= ? AND (next_update, url) > (?, ?) \
                     ORDER BY next_update, url LIMIT ?",
                )
                .bind(to_ts(now))
                .bind(to_ts(key.next_update))
                .bind(&key.url)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT url, next_update FROM feeds WHERE next_update <= ? \
                     ORDER BY next_update, url LIMIT ?",
                )
                .bind(to_ts(now))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows
            .into_iter()
            .map(|(url, next_update)| DueFeed {
                url,
                next_update: from_ts(next_update),
            })
            .collect())
    }

    /// URLs of feeds parked at the not-viewed sentinel, after `cursor` in URL order.
    pub async fn unviewed_feed_urls(&self, cursor: Option<&str>, limit: usize) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT url FROM feeds WHERE next_update = ? AND url > ? ORDER BY url LIMIT ?",
        )
        .bind(TIME_MAX_SECS)
        .bind(cursor.unwrap_or(""))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(url,)| url).collect())
    }

    /// Delete a feed. Stories and contents go with it through the foreign keys.
    pub async fn delete_feed(&self, url: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM feeds WHERE url = ?")
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Update the hub subscription expiry and pending-request time.
    pub async fn set_feed_subscription(
        &self,
        url: &str,
        subscribed: Option<DateTime<Utc>>,
        sub_requested: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result =
            sqlx::query("UPDATE feeds SET subscribed = ?, sub_requested = ? WHERE url = ?")
                .bind(opt_ts(subscribed))
                .bind(opt_ts(sub_requested))
                .bind(url)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Write only the poll-failure columns, leaving fields owned by
    /// concurrent push or view updates alone.
    pub async fn record_feed_error(
        &self,
        url: &str,
        errors: u32,
        next_update: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE feeds SET errors = ?, next_update = ? WHERE url = ?")
            .bind(i64::from(errors))
            .bind(to_ts(next_update))
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record that a reader opened the feed.
    pub async fn mark_viewed(&self, url: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE feeds SET last_viewed = ? WHERE url = ?")
            .bind(to_ts(now))
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Subscription columns are only written on insert; afterwards they belong to
/// [`Database::set_feed_subscription`], so a concurrent poll cannot roll back
/// a hub verification.
pub(crate) async fn upsert_feed(conn: &mut sqlx::SqliteConnection, feed: &Feed) -> Result<()> {
    sqlx::query(&format!(
        "INSERT INTO feeds ({FEED_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(url) DO UPDATE SET \
            title = excluded.title, link = excluded.link, hub = excluded.hub, \
            updated = excluded.updated, date = excluded.date, checked = excluded.checked, \
            next_update = excluded.next_update, last_viewed = excluded.last_viewed, \
            errors = excluded.errors, average_secs = excluded.average_secs"
    ))
    .bind(&feed.url)
    .bind(&feed.title)
    .bind(&feed.link)
    .bind(&feed.hub)
    .bind(opt_ts(feed.updated))
    .bind(opt_ts(feed.date))
    .bind(opt_ts(feed.checked))
    .bind(to_ts(feed.next_update))
    .bind(opt_ts(feed.last_viewed))
    .bind(opt_ts(feed.subscribed))
    .bind(opt_ts(feed.sub_requested))
    .bind(i64::from(feed.errors))
    .bind(feed.average.num_seconds())
    .execute(conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::time_max;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn feed(url: &str, next: i64) -> Feed {
        let mut f = Feed::new(url, at(1_700_000_000));
        f.next_update = at(next);
        f
    }

    #[tokio::test]
    async fn test_put_and_get_feed() {
        let db = test_db().await;
        let mut f = feed("https://a.example/rss", 1_700_000_100);
        f.title = "A".into();
        f.hub = "https://hub.example/".into();
        f.errors = 3;
        f.average = Duration::minutes(45);
        db.put_feed(&f).await.unwrap();

        assert_eq!(db.get_feed(&f.url).await.unwrap(), Some(f.clone()));

        f.title = "A2".into();
        db.put_feed(&f).await.unwrap();
        assert_eq!(db.get_feed(&f.url).await.unwrap().unwrap().title, "A2");
    }

    #[tokio::test]
    async fn test_put_keeps_subscription_columns() {
        let db = test_db().await;
        let mut f = feed("https://a.example/rss", 100);
        db.put_feed(&f).await.unwrap();
        db.set_feed_subscription(&f.url, Some(at(5_000)), Some(at(4_000)))
            .await
            .unwrap();

        // A stale copy written back does not undo the hub state
        f.title = "polled".into();
        db.put_feed(&f).await.unwrap();

        let stored = db.get_feed(&f.url).await.unwrap().unwrap();
        assert_eq!(stored.title, "polled");
        assert_eq!(stored.subscribed, Some(at(5_000)));
        assert_eq!(stored.sub_requested, Some(at(4_000)));
    }

    #[tokio::test]
    async fn test_get_missing_feed() {
        let db = test_db().await;
        assert_eq!(db.get_feed("https://missing.example/").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_insert_if_absent_keeps_existing() {
        let db = test_db().await;
        let mut f = feed("https://a.example/rss", 100);
        assert!(db.insert_feed_if_absent(&f).await.unwrap());
        f.title = "changed".into();
        assert!(!db.insert_feed_if_absent(&f).await.unwrap());
        assert_eq!(db.get_feed(&f.url).await.unwrap().unwrap().title, "");
    }

    #[tokio::test]
    async fn test_due_feeds_pages_in_key_order() {
        let db = test_db().await;
        for (url, next) in [("https://c/", 10), ("https://a/", 20), ("https://b/", 10), ("https://d/", 99)] {
            db.put_feed(&feed(url, next)).await.unwrap();
        }

        let first = db.due_feeds(at(50), None, 2).await.unwrap();
        let urls: Vec<_> = first.iter().map(|d| d.url.as_str()).collect();
        assert_eq!(urls, vec!["https://b/", "https://c/"]);

        let rest = db.due_feeds(at(50), first.last(), 10).await.unwrap();
        let urls: Vec<_> = rest.iter().map(|d| d.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a/"]);
    }

    #[tokio::test]
    async fn test_unviewed_feed_urls_after_cursor() {
        let db = test_db().await;
        for url in ["https://x/", "https://y/", "https://z/"] {
            let mut f = feed(url, 0);
            f.next_update = time_max();
            db.put_feed(&f).await.unwrap();
        }
        db.put_feed(&feed("https://active/", 0)).await.unwrap();

        assert_eq!(
            db.unviewed_feed_urls(None, 2).await.unwrap(),
            vec!["https://x/".to_string(), "https://y/".to_string()]
        );
        assert_eq!(
            db.unviewed_feed_urls(Some("https://y/"), 10).await.unwrap(),
            vec!["https://z/".to_string()]
        );
    }

    #[tokio::test]
    async fn test_mark_viewed_and_delete() {
        let db = test_db().await;
        let mut f = feed("https://a/", 0);
        f.last_viewed = None;
        db.put_feed(&f).await.unwrap();

        assert!(db.mark_viewed(&f.url, at(500)).await.unwrap());
        assert_eq!(db.get_feed(&f.url).await.unwrap().unwrap().last_viewed, Some(at(500)));

        assert!(db.delete_feed(&f.url).await.unwrap());
        assert!(!db.delete_feed(&f.url).await.unwrap());
        assert!(!db.mark_viewed(&f.url, at(600)).await.unwrap());
    }
}
