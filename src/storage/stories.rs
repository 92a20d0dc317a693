use std::collections::HashMap;

use anyhow::Result;
use sqlx::QueryBuilder;

use super::feeds::upsert_feed;
use super::schema::Database;
use super::types::{opt_ts, to_ts, Feed, Story, StoryContent, StoryRow, StoryWrite};

/// Keeps bound parameters well under SQLite's 999 limit (9 columns * 50 = 450).
const WRITE_BATCH_SIZE: usize = 50;

/// Maximum identifiers bound into one `IN (...)` list.
const LOOKUP_BATCH_SIZE: usize = 500;

const CONTENT_SLOT: i64 = 1;

impl Database {
    // ========================================================================
    // Story Operations
    // ========================================================================

    /// Targeted multi-get: stored stories of `feed_url` among `ids`, keyed by id.
    pub async fn get_stories(&self, feed_url: &str, ids: &[String]) -> Result<HashMap<String, Story>> {
        let mut found = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(LOOKUP_BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "SELECT feed_url, id, title, link, author, summary, published, updated, created \
                 FROM stories WHERE feed_url = ",
            );
            builder.push_bind(feed_url);
            builder.push(" AND id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(id);
            }
            separated.push_unseparated(")");

            let rows = builder.build_query_as::<StoryRow>().fetch_all(&self.pool).await?;
            for row in rows {
                let story = row.into_story();
                found.insert(story.id.clone(), story);
            }
        }
        Ok(found)
    }

    /// Write a feed together with its changed stories and their contents.
    ///
    /// Either everything commits or nothing does. An existing story keeps its
    /// stored `created` time.
    pub async fn commit_feed_update(&self, feed: &Feed, writes: &[StoryWrite]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        upsert_feed(&mut *tx, feed).await?;

        for chunk in writes.chunks(WRITE_BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT INTO stories \
                 (feed_url, id, title, link, author, summary, published, updated, created) ",
            );
            builder.push_values(chunk, |mut b, write| {
                let s = &write.story;
                b.push_bind(&s.feed_url)
                    .push_bind(&s.id)
                    .push_bind(&s.title)
                    .push_bind(&s.link)
                    .push_bind(&s.author)
                    .push_bind(&s.summary)
                    .push_bind(to_ts(s.published))
                    .push_bind(opt_ts(s.updated))
                    .push_bind(to_ts(s.created));
            });
            builder.push(
                " ON CONFLICT(feed_url, id) DO UPDATE SET \
                 title = excluded.title, link = excluded.link, author = excluded.author, \
                 summary = excluded.summary, published = excluded.published, \
                 updated = excluded.updated",
            );
            builder.build().execute(&mut *tx).await?;

            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT INTO story_contents (feed_url, story_id, slot, compressed, raw) ",
            );
            builder.push_values(chunk, |mut b, write| {
                let c = &write.content;
                b.push_bind(&c.feed_url)
                    .push_bind(&c.story_id)
                    .push_bind(CONTENT_SLOT)
                    .push_bind(c.compressed.as_deref())
                    .push_bind(c.raw.as_deref());
            });
            builder.push(
                " ON CONFLICT(feed_url, story_id, slot) DO UPDATE SET \
                 compressed = excluded.compressed, raw = excluded.raw",
            );
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Story ids of a feed after `after` in id order.
    pub async fn story_ids(&self, feed_url: &str, after: Option<&str>, limit: usize) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM stories WHERE feed_url = ? AND id > ? ORDER BY id LIMIT ?",
        )
        .bind(feed_url)
        .bind(after.unwrap_or(""))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Delete the given stories of a feed along with their contents.
    pub async fn delete_stories(&self, feed_url: &str, ids: &[String]) -> Result<u64> {
        let mut deleted = 0;
        for chunk in ids.chunks(LOOKUP_BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("DELETE FROM stories WHERE feed_url = ");
            builder.push_bind(feed_url);
            builder.push(" AND id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(id);
            }
            separated.push_unseparated(")");
            deleted += builder.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(deleted)
    }

    pub async fn count_stories(&self, feed_url: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM stories WHERE feed_url = ?")
            .bind(feed_url)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn get_story_content(&self, feed_url: &str, story_id: &str) -> Result<Option<StoryContent>> {
        let row: Option<(String, String, Option<Vec<u8>>, Option<String>)> = sqlx::query_as(
            "SELECT feed_url, story_id, compressed, raw FROM story_contents \
             WHERE feed_url = ? AND story_id = ? AND slot = ?",
        )
        .bind(feed_url)
        .bind(story_id)
        .bind(CONTENT_SLOT)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(feed_url, story_id, compressed, raw)| StoryContent {
            feed_url,
            story_id,
            compressed,
            raw,
        }))
    }
}
