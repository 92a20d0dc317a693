use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::feed::OpmlError;
use crate::hub::HubError;
use crate::storage::{Database, DueFeed, NewTask};
use crate::sync::SyncError;
use crate::util::task_name_escape;

pub const UPDATE_FEED: &str = "update-feed";
pub const UPDATE_FEED_LAST: &str = "update-feed-last";
pub const SUBSCRIBE_FEED: &str = "subscribe-feed";
pub const DELETE_OLD_FEEDS: &str = "delete-old-feeds";
pub const DELETE_OLD_FEED: &str = "delete-old-feed";
pub const IMPORT_OPML: &str = "import-opml";

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Unknown task endpoint: {0}")]
    UnknownEndpoint(String),
    #[error("Invalid task payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("Deadline exceeded after {0}s")]
    Deadline(u64),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Hub(#[from] HubError),
    #[error(transparent)]
    Opml(#[from] OpmlError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl TaskError {
    /// Returns true if retrying the task cannot help.
    pub fn is_permanent(&self) -> bool {
        match self {
            TaskError::UnknownEndpoint(_)
            | TaskError::Payload(_)
            | TaskError::Opml(_)
            | TaskError::Sync(SyncError::FeedNotFound(_))
            | TaskError::Hub(HubError::BadToken)
            | TaskError::Hub(HubError::Sync(SyncError::FeedNotFound(_))) => true,
            TaskError::Deadline(_)
            | TaskError::Sync(_)
            | TaskError::Hub(_)
            | TaskError::Store(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedPayload {
    pub feed: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateFeedPayload {
    pub feed: String,
    #[serde(default)]
    pub last: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CursorPayload {
    #[serde(default)]
    pub cursor: Option<String>,
    /// Start time of the sweep this step belongs to
    #[serde(default)]
    pub sweep: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportPayload {
    pub user: String,
    pub document: String,
    #[serde(default)]
    pub skip: usize,
}

/// A unit of queued work, one variant per endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    UpdateFeed(UpdateFeedPayload),
    UpdateFeedLast(FeedPayload),
    SubscribeFeed(FeedPayload),
    DeleteOldFeeds(CursorPayload),
    DeleteOldFeed(FeedPayload),
    ImportOpml(ImportPayload),
}

impl Task {
    pub fn endpoint(&self) -> &'static str {
        match self {
            Task::UpdateFeed(_) => UPDATE_FEED,
            Task::UpdateFeedLast(_) => UPDATE_FEED_LAST,
            Task::SubscribeFeed(_) => SUBSCRIBE_FEED,
            Task::DeleteOldFeeds(_) => DELETE_OLD_FEEDS,
            Task::DeleteOldFeed(_) => DELETE_OLD_FEED,
            Task::ImportOpml(_) => IMPORT_OPML,
        }
    }

    fn payload(&self) -> serde_json::Result<String> {
        match self {
            Task::UpdateFeed(p) => serde_json::to_string(p),
            Task::UpdateFeedLast(p) | Task::SubscribeFeed(p) | Task::DeleteOldFeed(p) => {
                serde_json::to_string(p)
            }
            Task::DeleteOldFeeds(p) => serde_json::to_string(p),
            Task::ImportOpml(p) => serde_json::to_string(p),
        }
    }

    pub fn decode(endpoint: &str, payload: &str) -> Result<Self, TaskError> {
        Ok(match endpoint {
            UPDATE_FEED => Task::UpdateFeed(serde_json::from_str(payload)?),
            UPDATE_FEED_LAST => Task::UpdateFeedLast(serde_json::from_str(payload)?),
            SUBSCRIBE_FEED => Task::SubscribeFeed(serde_json::from_str(payload)?),
            DELETE_OLD_FEEDS => Task::DeleteOldFeeds(serde_json::from_str(payload)?),
            DELETE_OLD_FEED => Task::DeleteOldFeed(serde_json::from_str(payload)?),
            IMPORT_OPML => Task::ImportOpml(serde_json::from_str(payload)?),
            other => return Err(TaskError::UnknownEndpoint(other.to_owned())),
        })
    }

    /// Queue row for this task. Unnamed tasks are never deduplicated.
    pub fn to_new_task(
        &self,
        name: Option<String>,
        run_at: DateTime<Utc>,
    ) -> Result<NewTask, TaskError> {
        Ok(NewTask {
            name,
            endpoint: self.endpoint().to_owned(),
            payload: self.payload()?,
            run_at,
        })
    }
}

/// Name of the poll task for a due feed.
///
/// The next-due time is part of the name, so a feed is queued at most once
/// per scheduled poll however many sweeps see it.
pub fn update_task_name(feed: &DueFeed) -> String {
    format!(
        "{}_{}",
        feed.next_update.format("%Y-%m-%dT%H-%M-%SZ"),
        task_name_escape(&feed.url)
    )
}

pub fn update_task(feed: &DueFeed, now: DateTime<Utc>) -> Result<NewTask, TaskError> {
    Task::UpdateFeed(UpdateFeedPayload {
        feed: feed.url.clone(),
        last: false,
    })
    .to_new_task(Some(update_task_name(feed)), now)
}

/// Name of a retention sweep continuation. Redelivering the step that
/// queued it yields the same name.
pub fn retention_task_name(sweep: &str, cursor: &str) -> String {
    format!("{DELETE_OLD_FEEDS}_{sweep}_{}", task_name_escape(cursor))
}

/// Name of an import continuation, keyed by user, document and offset.
pub fn import_task_name(payload: &ImportPayload) -> String {
    let digest = Sha256::digest(payload.document.as_bytes());
    let short: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{IMPORT_OPML}_{}_{short}_{}",
        task_name_escape(&payload.user),
        payload.skip
    )
}

/// Queue one named task to run at `now`. Returns false if the name was taken.
pub async fn enqueue_named(
    db: &Database,
    task: &Task,
    name: String,
    now: DateTime<Utc>,
) -> Result<bool, TaskError> {
    let queued = db.enqueue_tasks(&[task.to_new_task(Some(name), now)?], now).await?;
    if queued == 0 {
        tracing::debug!(endpoint = task.endpoint(), "Task already queued");
    }
    Ok(queued > 0)
}

/// Queue one unnamed task to run at `now`.
pub async fn enqueue(db: &Database, task: &Task, now: DateTime<Utc>) -> Result<(), TaskError> {
    db.enqueue_tasks(&[task.to_new_task(None, now)?], now).await?;
    tracing::debug!(endpoint = task.endpoint(), "Task queued");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_update_task_name_format() {
        let feed = DueFeed {
            url: "http://a.b/c?d=1".into(),
            next_update: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
        };
        assert_eq!(update_task_name(&feed), "2024-01-02T03-04-05Z_http_3A_2F_2Fa_2Eb_2Fc_3Fd_3D1");
    }

    #[test]
    fn test_decode_known_and_unknown() {
        let task = Task::decode(UPDATE_FEED, r#"{"feed":"https://f/"}"#).unwrap();
        assert_eq!(
            task,
            Task::UpdateFeed(UpdateFeedPayload {
                feed: "https://f/".into(),
                last: false
            })
        );

        let task = Task::decode(DELETE_OLD_FEEDS, "{}").unwrap();
        assert_eq!(task, Task::DeleteOldFeeds(CursorPayload::default()));

        let err = Task::decode("reindex", "{}").unwrap_err();
        assert!(err.is_permanent());
        let err = Task::decode(SUBSCRIBE_FEED, "not json").unwrap_err();
        assert!(matches!(err, TaskError::Payload(_)));
    }

    #[test]
    fn test_new_task_carries_endpoint_and_payload() {
        let now = Utc::now();
        let task = Task::ImportOpml(ImportPayload {
            user: "u".into(),
            document: "<opml/>".into(),
            skip: 10,
        });
        let row = task.to_new_task(None, now).unwrap();
        assert_eq!(row.endpoint, IMPORT_OPML);
        assert_eq!(Task::decode(&row.endpoint, &row.payload).unwrap(), task);
    }

    #[test]
    fn test_continuation_names_are_stable() {
        assert_eq!(
            retention_task_name("2024-01-02T03-04-05Z", "http://a.b/"),
            "delete-old-feeds_2024-01-02T03-04-05Z_http_3A_2F_2Fa_2Eb_2F"
        );

        let payload = ImportPayload {
            user: "u@x".into(),
            document: "<opml/>".into(),
            skip: 10,
        };
        let name = import_task_name(&payload);
        assert!(name.starts_with("import-opml_u_40x_"));
        assert!(name.ends_with("_10"));
        assert_eq!(name, import_task_name(&payload.clone()));

        let other = ImportPayload {
            document: "<opml></opml>".into(),
            ..payload.clone()
        };
        assert_ne!(name, import_task_name(&other));
    }

    #[test]
    fn test_error_classification() {
        assert!(TaskError::Sync(SyncError::FeedNotFound("x".into())).is_permanent());
        assert!(!TaskError::Deadline(60).is_permanent());
        assert!(!TaskError::Store(anyhow::anyhow!("locked")).is_permanent());
    }
}
