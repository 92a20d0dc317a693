//! Sweeps that turn store scans into queued tasks, plus the retention purge
//! and the OPML import step.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::sync::mpsc;

use super::queue::{
    enqueue_named, import_task_name, retention_task_name, update_task, CursorPayload,
    FeedPayload, ImportPayload, Task, TaskError,
};
use crate::feed::{parse_opml, OpmlFeed};
use crate::storage::DueFeed;
use crate::subscriptions::Outline;
use crate::sync::Engine;

/// Rows fetched per due-feed page.
const SCAN_PAGE: usize = 200;

/// Queue a poll task for every due feed, up to the configured batch.
///
/// A paged store scan feeds a bounded channel; the sending side inserts
/// tasks in batches. The whole sweep runs under the scan budget. Returns the
/// number of tasks newly queued.
pub async fn update_feeds(engine: &Engine, now: DateTime<Utc>) -> Result<u64, TaskError> {
    let cfg = &engine.config.scheduler;
    let budget = cfg.scan_budget_secs;
    let batch_size = cfg.batch_size;
    let send_batch = cfg.send_batch_size.max(1);

    let (tx, mut rx) = mpsc::channel::<DueFeed>(send_batch * 2);

    let db = engine.db.clone();
    let producer = async move {
        let mut after: Option<DueFeed> = None;
        let mut scanned = 0usize;
        while scanned < batch_size {
            let limit = SCAN_PAGE.min(batch_size - scanned);
            let page = db.due_feeds(now, after.as_ref(), limit).await?;
            let full = page.len() == limit;
            for feed in page {
                after = Some(feed.clone());
                scanned += 1;
                if tx.send(feed).await.is_err() {
                    return Ok(scanned);
                }
            }
            if !full {
                break;
            }
        }
        Ok::<_, TaskError>(scanned)
    };

    let db = engine.db.clone();
    let sender = async move {
        let mut batch = Vec::with_capacity(send_batch);
        let mut queued = 0u64;
        while let Some(feed) = rx.recv().await {
            tracing::debug!(feed = %feed.url, next_update = %feed.next_update, "Queuing feed");
            batch.push(update_task(&feed, now)?);
            if batch.len() >= send_batch {
                queued += db.enqueue_tasks(&batch, now).await?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            queued += db.enqueue_tasks(&batch, now).await?;
        }
        Ok::<_, TaskError>(queued)
    };

    let sweep = async { tokio::try_join!(producer, sender) };
    let (scanned, queued) = tokio::time::timeout(StdDuration::from_secs(budget), sweep)
        .await
        .map_err(|_| TaskError::Deadline(budget))??;

    tracing::info!(scanned, queued, "Update sweep finished");
    Ok(queued)
}

/// Result of one retention sweep step.
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionSweep {
    pub queued: usize,
    /// Cursor the continuation resumes from, `None` once the scan completed
    pub continue_from: Option<String>,
}

/// Queue `delete-old-feed` for parked feeds after the payload's cursor, then
/// queue a continuation unless the scan reached the end.
///
/// A step without a sweep id starts a new sweep stamped with `now`.
/// Continuations are named by sweep and cursor, so a redelivered step does
/// not fork the chain.
pub async fn delete_old_feeds(
    engine: &Engine,
    step: &CursorPayload,
    now: DateTime<Utc>,
) -> Result<RetentionSweep, TaskError> {
    let cfg = &engine.config.scheduler;
    let budget = cfg.scan_budget_secs;
    let sweep = step
        .sweep
        .clone()
        .unwrap_or_else(|| now.format("%Y-%m-%dT%H-%M-%SZ").to_string());
    let scan = async {
        let mut cursor = step.cursor.clone();
        let mut scanned = 0usize;
        let mut tasks = Vec::new();
        let mut done = false;

        while scanned < cfg.retention_scan_limit && tasks.len() < cfg.retention_task_limit {
            let limit = SCAN_PAGE
                .min(cfg.retention_scan_limit - scanned)
                .min(cfg.retention_task_limit - tasks.len());
            let urls = engine.db.unviewed_feed_urls(cursor.as_deref(), limit).await?;
            scanned += urls.len();
            let exhausted = urls.len() < limit;

            for url in urls {
                tasks.push(Task::DeleteOldFeed(FeedPayload { feed: url.clone() }).to_new_task(None, now)?);
                cursor = Some(url);
            }
            if exhausted {
                done = true;
                break;
            }
        }
        Ok::<_, TaskError>((tasks, cursor, done))
    };

    let (tasks, cursor, done) = tokio::time::timeout(StdDuration::from_secs(budget), scan)
        .await
        .map_err(|_| TaskError::Deadline(budget))??;

    if !tasks.is_empty() {
        engine.db.enqueue_tasks(&tasks, now).await?;
        tracing::info!(feeds = tasks.len(), "Queued old feed deletions");
    }

    let continue_from = if done { None } else { cursor };
    match &continue_from {
        Some(cursor) => {
            let name = retention_task_name(&sweep, cursor);
            let next = Task::DeleteOldFeeds(CursorPayload {
                cursor: Some(cursor.clone()),
                sweep: Some(sweep),
            });
            enqueue_named(&engine.db, &next, name, now).await?;
        }
        None => tracing::info!("Retention sweep complete"),
    }

    Ok(RetentionSweep {
        queued: tasks.len(),
        continue_from,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum PurgeOutcome {
    Missing,
    /// Viewed within the retention window
    Kept,
    Deleted { stories: u64 },
}

/// Delete a feed nobody has opened within the retention window, stories first.
pub async fn delete_old_feed(
    engine: &Engine,
    url: &str,
    now: DateTime<Utc>,
) -> Result<PurgeOutcome, TaskError> {
    let Some(feed) = engine.db.get_feed(url).await? else {
        tracing::debug!(feed = %url, "Old feed already gone");
        return Ok(PurgeOutcome::Missing);
    };
    if feed.is_viewed(now, engine.config.schedule.retention()) {
        return Ok(PurgeOutcome::Kept);
    }

    let cfg = &engine.config.scheduler;
    let chunk_size = cfg.purge_chunk_size.max(1);

    let mut chunks = Vec::new();
    let mut after: Option<String> = None;
    loop {
        let ids = engine.db.story_ids(url, after.as_deref(), chunk_size).await?;
        let full = ids.len() == chunk_size;
        if let Some(last) = ids.last() {
            after = Some(last.clone());
            chunks.push(ids);
        }
        if !full {
            break;
        }
    }

    // All chunk deletions finish before the feed row goes
    let stories: u64 = stream::iter(chunks)
        .map(|ids| {
            let db = engine.db.clone();
            async move { db.delete_stories(url, &ids).await }
        })
        .buffer_unordered(cfg.purge_concurrency.max(1))
        .try_fold(0u64, |total, n| async move { Ok(total + n) })
        .await?;

    engine.db.delete_feed(url).await?;
    tracing::info!(feed = %url, stories, "Deleted old feed");
    Ok(PurgeOutcome::Deleted { stories })
}

/// Result of one import step.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportStep {
    pub added: usize,
    /// Skip offset of the queued continuation, if any
    pub next_skip: Option<usize>,
}

/// Import the next batch of an OPML document for a user.
///
/// Feeds after `skip` are added concurrently, merged into the user's tree in
/// one transaction, and a continuation is queued while batches come back full.
/// Feeds that fail to add are logged and left out.
pub async fn import_opml(
    engine: &Engine,
    payload: &ImportPayload,
    now: DateTime<Utc>,
) -> Result<ImportStep, TaskError> {
    let limit = engine.config.scheduler.import_limit.max(1);
    let batch: Vec<OpmlFeed> = parse_opml(&payload.document)?
        .into_iter()
        .skip(payload.skip)
        .take(limit)
        .collect();
    let batch_len = batch.len();

    let added: Vec<Outline> = stream::iter(batch)
        .map(|feed| async move {
            let outline = Outline {
                title: feed.title,
                xml_url: feed.xml_url,
                html_url: feed.html_url.unwrap_or_default(),
                outline: Vec::new(),
            };
            match engine.add_feed(outline).await {
                Ok(outline) => {
                    tracing::debug!(user = %payload.user, feed = %outline.xml_url, "Imported feed");
                    Some(match feed.folder {
                        Some(label) => Outline::folder(label, vec![outline]),
                        None => outline,
                    })
                }
                Err(e) => {
                    tracing::warn!(user = %payload.user, error = %e, "OPML import error");
                    None
                }
            }
        })
        .buffered(limit)
        .filter_map(|o| async move { o })
        .collect()
        .await;

    let count = added.len();
    if !added.is_empty() {
        engine.merge_user_outlines(&payload.user, added).await?;
    }

    let next_skip = if batch_len == limit {
        let skip = payload.skip + limit;
        let next = ImportPayload {
            skip,
            ..payload.clone()
        };
        let name = import_task_name(&next);
        enqueue_named(&engine.db, &Task::ImportOpml(next), name, now).await?;
        Some(skip)
    } else {
        tracing::info!(user = %payload.user, "OPML import done");
        None
    };

    Ok(ImportStep {
        added: count,
        next_skip,
    })
}

/// Drop finished task names older than the deduplication window.
pub async fn purge_tasks(engine: &Engine, now: DateTime<Utc>) -> Result<u64, TaskError> {
    let window = Duration::hours(engine.config.worker.dedup_window_hours);
    let purged = engine.db.purge_finished_tasks(now - window).await?;
    if purged > 0 {
        tracing::info!(purged, "Purged finished tasks");
    }
    Ok(purged)
}
