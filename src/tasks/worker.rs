use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};

use super::fanout::{delete_old_feed, delete_old_feeds, import_opml};
use super::queue::{enqueue, FeedPayload, Task, TaskError};
use crate::hub::{self, needs_subscribe};
use crate::storage::ClaimedTask;
use crate::sync::Engine;

/// Longest wait between attempts of a failing task.
const MAX_RETRY_DELAY_SECS: i64 = 3600;

/// Delay before attempt `attempts + 1`: 10s, 20s, 40s, ... capped at an hour.
pub fn retry_delay(attempts: i64) -> Duration {
    let exp = attempts.clamp(1, 12) - 1;
    Duration::seconds((10 * (1i64 << exp)).min(MAX_RETRY_DELAY_SECS))
}

/// Leases tasks from the queue and runs them on a bounded pool.
#[derive(Clone)]
pub struct Worker {
    engine: Engine,
}

impl Worker {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Poll the queue forever.
    pub async fn run(self) {
        let idle = StdDuration::from_millis(self.engine.config.worker.poll_interval_ms);
        loop {
            match self.run_once().await {
                Ok(0) => tokio::time::sleep(idle).await,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Task claim failed");
                    tokio::time::sleep(idle).await;
                }
            }
        }
    }

    /// Claim one batch and run it to completion. Returns the batch size.
    pub async fn run_once(&self) -> anyhow::Result<usize> {
        let cfg = &self.engine.config.worker;
        let now = Utc::now();
        let claimed = self
            .engine
            .db
            .claim_tasks(now, Duration::seconds(cfg.lease_secs), cfg.concurrency)
            .await?;
        let count = claimed.len();

        stream::iter(claimed)
            .for_each_concurrent(cfg.concurrency.max(1), |task| self.execute(task))
            .await;
        Ok(count)
    }

    async fn execute(&self, task: ClaimedTask) {
        let result = match Task::decode(&task.endpoint, &task.payload) {
            Ok(decoded) => self.dispatch(decoded).await,
            Err(e) => Err(e),
        };

        let now = Utc::now();
        let recorded = match result {
            Ok(()) => self.engine.db.complete_task(&task.name, now).await,
            Err(e) => self.record_failure(&task, &e, now).await,
        };
        if let Err(e) = recorded {
            tracing::error!(task = %task.name, error = %e, "Failed to record task result");
        }
    }

    async fn record_failure(
        &self,
        task: &ClaimedTask,
        error: &TaskError,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let max_attempts = self.engine.config.worker.max_attempts;
        let message = error.to_string();

        if error.is_permanent() || task.attempts >= max_attempts {
            tracing::error!(
                task = %task.name,
                endpoint = %task.endpoint,
                attempts = task.attempts,
                error = %message,
                "Task failed permanently"
            );
            return self.engine.db.fail_task(&task.name, now, &message, None).await;
        }

        let retry_at = now + retry_delay(task.attempts);
        tracing::warn!(
            task = %task.name,
            endpoint = %task.endpoint,
            attempts = task.attempts,
            retry_at = %retry_at,
            error = %message,
            "Task failed, will retry"
        );
        self.engine
            .db
            .fail_task(&task.name, now, &message, Some(retry_at))
            .await
    }

    /// Run one decoded task.
    pub async fn dispatch(&self, task: Task) -> Result<(), TaskError> {
        let engine = &self.engine;
        let now = Utc::now();
        match task {
            Task::UpdateFeed(p) => {
                let outcome = engine.update_feed(&p.feed, p.last).await?;
                if let Some(feed) = outcome.feed() {
                    if needs_subscribe(feed, now, &engine.config) {
                        let sub = Task::SubscribeFeed(FeedPayload {
                            feed: feed.url.clone(),
                        });
                        enqueue(&engine.db, &sub, now).await?;
                    }
                }
            }
            Task::UpdateFeedLast(p) => {
                engine.mark_viewed(&p.feed).await?;
            }
            Task::SubscribeFeed(p) => {
                hub::subscribe(engine, &p.feed).await?;
            }
            Task::DeleteOldFeeds(p) => {
                delete_old_feeds(engine, &p, now).await?;
            }
            Task::DeleteOldFeed(p) => {
                delete_old_feed(engine, &p.feed, now).await?;
            }
            Task::ImportOpml(p) => {
                import_opml(engine, &p, now).await?;
            }
        }
        Ok(())
    }
}
