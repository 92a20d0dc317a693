use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{opt_from_ts, to_ts};

/// Lifecycle of a queued task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskState {
    fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "running" => TaskState::Running,
            "done" => TaskState::Done,
            "failed" => TaskState::Failed,
            _ => TaskState::Pending,
        }
    }
}

/// A task ready to be inserted. Tasks without a name get a random one and are
/// never deduplicated.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: Option<String>,
    pub endpoint: String,
    pub payload: String,
    pub run_at: DateTime<Utc>,
}

/// A task leased to a worker.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClaimedTask {
    pub name: String,
    pub endpoint: String,
    pub payload: String,
    pub attempts: i64,
}

/// Full view of a task row, for inspection.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub name: String,
    pub endpoint: String,
    pub payload: String,
    pub state: TaskState,
    pub attempts: i64,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

type TaskRecordRow = (String, String, String, String, i64, Option<i64>, Option<String>);

fn record_from_row(row: TaskRecordRow) -> TaskRecord {
    let (name, endpoint, payload, state, attempts, finished_at, last_error) = row;
    TaskRecord {
        name,
        endpoint,
        payload,
        state: TaskState::parse(&state),
        attempts,
        finished_at: opt_from_ts(finished_at),
        last_error,
    }
}

impl Database {
    // ========================================================================
    // Task Queue
    // ========================================================================

    /// Insert tasks, silently skipping names already present in the table.
    ///
    /// Returns the number of tasks actually added.
    pub async fn enqueue_tasks(&self, tasks: &[NewTask], now: DateTime<Utc>) -> Result<u64> {
        if tasks.is_empty() {
            return Ok(0);
        }

        const BATCH_SIZE: usize = 100;
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for chunk in tasks.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT OR IGNORE INTO tasks (name, endpoint, payload, state, run_at, created_at) ",
            );
            builder.push_values(chunk, |mut b, task| {
                let name = task
                    .name
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                b.push_bind(name)
                    .push_bind(&task.endpoint)
                    .push_bind(&task.payload)
                    .push_bind(TaskState::Pending.as_str())
                    .push_bind(to_ts(task.run_at))
                    .push_bind(to_ts(now));
            });
            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// Lease up to `limit` runnable tasks until `now + lease`.
    ///
    /// Running tasks whose lease has lapsed are handed out again, so delivery
    /// is at-least-once.
    pub async fn claim_tasks(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<ClaimedTask>> {
        let claimed = sqlx::query_as::<_, ClaimedTask>(
            "UPDATE tasks SET state = 'running', run_at = ?, attempts = attempts + 1 \
             WHERE name IN ( \
                SELECT name FROM tasks \
                WHERE state IN ('pending', 'running') AND run_at <= ? \
                ORDER BY run_at LIMIT ? \
             ) \
             RETURNING name, endpoint, payload, attempts",
        )
        .bind(to_ts(now + lease))
        .bind(to_ts(now))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(claimed)
    }

    pub async fn complete_task(&self, name: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE tasks SET state = 'done', finished_at = ?, last_error = NULL WHERE name = ?")
            .bind(to_ts(now))
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a failed attempt. With `retry_at` the task runs again then;
    /// without it the task is failed for good.
    pub async fn fail_task(
        &self,
        name: &str,
        now: DateTime<Utc>,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        match retry_at {
            Some(at) => {
                sqlx::query("UPDATE tasks SET state = 'pending', run_at = ?, last_error = ? WHERE name = ?")
                    .bind(to_ts(at))
                    .bind(error)
                    .bind(name)
                    .execute(&self.pool)
                    .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE tasks SET state = 'failed', finished_at = ?, last_error = ? WHERE name = ?",
                )
                .bind(to_ts(now))
                .bind(error)
                .bind(name)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Forget finished tasks older than `before`, making their names reusable.
    pub async fn purge_finished_tasks(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM tasks WHERE state IN ('done', 'failed') AND finished_at < ?",
        )
        .bind(to_ts(before))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_task(&self, name: &str) -> Result<Option<TaskRecord>> {
        let row: Option<TaskRecordRow> = sqlx::query_as(
            "SELECT name, endpoint, payload, state, attempts, finished_at, last_error \
             FROM tasks WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(record_from_row))
    }

    /// Tasks for `endpoint` that have not finished, oldest first.
    pub async fn open_tasks(&self, endpoint: &str) -> Result<Vec<TaskRecord>> {
        let rows: Vec<TaskRecordRow> = sqlx::query_as(
            "SELECT name, endpoint, payload, state, attempts, finished_at, last_error \
             FROM tasks WHERE endpoint = ? AND state IN ('pending', 'running') \
             ORDER BY created_at, name",
        )
        .bind(endpoint)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(record_from_row).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn task(name: Option<&str>, run_at: i64) -> NewTask {
        NewTask {
            name: name.map(str::to_owned),
            endpoint: "update-feed".into(),
            payload: "{}".into(),
            run_at: at(run_at),
        }
    }

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_dedups_by_name() {
        let db = test_db().await;
        let added = db
            .enqueue_tasks(&[task(Some("t1"), 0), task(Some("t1"), 0), task(Some("t2"), 0)], at(0))
            .await
            .unwrap();
        assert_eq!(added, 2);

        db.claim_tasks(at(0), Duration::seconds(60), 10).await.unwrap();
        db.complete_task("t1", at(1)).await.unwrap();
        // Finished names still block re-insertion until purged
        assert_eq!(db.enqueue_tasks(&[task(Some("t1"), 5)], at(5)).await.unwrap(), 0);

        assert_eq!(db.purge_finished_tasks(at(2)).await.unwrap(), 1);
        assert_eq!(db.enqueue_tasks(&[task(Some("t1"), 5)], at(5)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unnamed_tasks_never_collide() {
        let db = test_db().await;
        let added = db.enqueue_tasks(&[task(None, 0), task(None, 0)], at(0)).await.unwrap();
        assert_eq!(added, 2);
    }

    #[tokio::test]
    async fn test_claim_respects_run_at_and_lease() {
        let db = test_db().await;
        db.enqueue_tasks(&[task(Some("now"), 10), task(Some("later"), 100)], at(0))
            .await
            .unwrap();

        let claimed = db.claim_tasks(at(10), Duration::seconds(30), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].name, "now");
        assert_eq!(claimed[0].attempts, 1);

        // Still leased
        assert!(db.claim_tasks(at(20), Duration::seconds(30), 10).await.unwrap().is_empty());

        // Lease lapsed: redelivered
        let again = db.claim_tasks(at(41), Duration::seconds(30), 10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_fail_with_retry_then_permanent() {
        let db = test_db().await;
        db.enqueue_tasks(&[task(Some("t"), 0)], at(0)).await.unwrap();
        db.claim_tasks(at(0), Duration::seconds(30), 1).await.unwrap();

        db.fail_task("t", at(1), "boom", Some(at(50))).await.unwrap();
        let rec = db.get_task("t").await.unwrap().unwrap();
        assert_eq!(rec.state, TaskState::Pending);
        assert_eq!(rec.last_error.as_deref(), Some("boom"));
        assert!(db.claim_tasks(at(49), Duration::seconds(30), 1).await.unwrap().is_empty());

        db.claim_tasks(at(50), Duration::seconds(30), 1).await.unwrap();
        db.fail_task("t", at(51), "gone", None).await.unwrap();
        let rec = db.get_task("t").await.unwrap().unwrap();
        assert_eq!(rec.state, TaskState::Failed);
        assert_eq!(rec.finished_at, Some(at(51)));
        assert!(db.open_tasks("update-feed").await.unwrap().is_empty());
    }
}
