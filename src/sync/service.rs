use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::reconcile::{is_already_current, reconcile, Decision, Flags};
use super::schedule::{backoff_delay, SchedulePolicy};
use crate::config::Config;
use crate::feed::{fetch_feed, FetchError, ParsedFeed};
use crate::storage::{time_max, Database, Feed};
use crate::subscriptions::{merge_stored, Outline};
use crate::util::normalize_feed_url;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Reconciling or updating a feed that is not stored
    #[error("Feed not found: {0}")]
    FeedNotFound(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Result of one update-feed run.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The feed's next poll is still in the future
    NotDue,
    Updated { feed: Feed, written: usize },
    /// The poll failed and the feed was rescheduled through backoff
    Failed { feed: Feed, error: String },
}

impl UpdateOutcome {
    pub fn feed(&self) -> Option<&Feed> {
        match self {
            UpdateOutcome::NotDue => None,
            UpdateOutcome::Updated { feed, .. } | UpdateOutcome::Failed { feed, .. } => Some(feed),
        }
    }
}

/// Shared handles for every unit of sync work.
#[derive(Clone)]
pub struct Engine {
    pub db: Database,
    pub client: reqwest::Client,
    pub config: Arc<Config>,
    policy: SchedulePolicy,
}

impl Engine {
    pub fn new(db: Database, client: reqwest::Client, config: Config) -> Self {
        let policy = SchedulePolicy::from(&config.schedule);
        Self {
            db,
            client,
            config: Arc::new(config),
            policy,
        }
    }

    pub fn policy(&self) -> &SchedulePolicy {
        &self.policy
    }

    /// Poll one stored feed.
    ///
    /// Runs only when the feed is due, unless `last` (a reader just opened
    /// it). Fetch and parse failures are absorbed into the feed's backoff;
    /// store failures propagate so the task is retried.
    pub async fn update_feed(&self, url: &str, last: bool) -> Result<UpdateOutcome, SyncError> {
        let now = Utc::now();
        let feed = self
            .db
            .get_feed(url)
            .await?
            .ok_or_else(|| SyncError::FeedNotFound(url.to_owned()))?;

        if !last && now < feed.next_update {
            tracing::debug!(feed = %url, next_update = %feed.next_update, "Feed already updated");
            return Ok(UpdateOutcome::NotDue);
        }

        let parsed = match fetch_feed(&self.client, &self.config.fetch, &feed.url).await {
            Ok(parsed) => parsed,
            Err(e) => {
                let error = e.to_string();
                let feed = self.feed_error(&feed.url, &error, now).await?;
                return Ok(UpdateOutcome::Failed { feed, error });
            }
        };

        let flags = Flags {
            mark_viewed: last,
            ..Flags::default()
        };
        let decision = self.reconcile_and_commit(&feed.url, parsed, flags, now).await?;
        Ok(UpdateOutcome::Updated {
            written: decision.story_writes().len(),
            feed: decision.feed().clone(),
        })
    }

    /// Reconcile a parsed document against the stored feed `url` and commit
    /// the resulting write-set in one transaction.
    pub async fn reconcile_and_commit(
        &self,
        url: &str,
        parsed: ParsedFeed,
        flags: Flags,
        now: DateTime<Utc>,
    ) -> Result<Decision, SyncError> {
        let previous = self
            .db
            .get_feed(url)
            .await?
            .ok_or_else(|| SyncError::FeedNotFound(url.to_owned()))?;

        let prior = if is_already_current(&previous, &parsed, flags) {
            Default::default()
        } else {
            let ids: Vec<String> = parsed.stories.iter().map(|s| s.story.id.clone()).collect();
            self.db.get_stories(url, &ids).await?
        };

        let decision = reconcile(&previous, parsed, &prior, flags, &self.policy, now);
        self.db
            .commit_feed_update(decision.feed(), decision.story_writes())
            .await?;

        match &decision {
            Decision::AlreadyCurrent { feed } => {
                tracing::info!(feed = %url, next_update = %feed.next_update, "Feed already current");
            }
            Decision::Write { feed, stories } => {
                tracing::info!(
                    feed = %url,
                    written = stories.len(),
                    from_push = flags.from_push,
                    next_update = %feed.next_update,
                    "Feed updated"
                );
            }
        }
        Ok(decision)
    }

    /// Record a failed poll: bump the error count and back off.
    ///
    /// The row is read again after the fetch, and only the error columns are
    /// written, so a push or view that landed meanwhile is kept.
    pub async fn feed_error(
        &self,
        url: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Feed, SyncError> {
        let mut feed = self
            .db
            .get_feed(url)
            .await?
            .ok_or_else(|| SyncError::FeedNotFound(url.to_owned()))?;
        let previous = feed.errors;
        feed.errors = previous.saturating_add(1);
        feed.next_update = now + backoff_delay(previous, self.policy.backoff_cap_hours);
        self.db
            .record_feed_error(&feed.url, feed.errors, feed.next_update)
            .await?;

        tracing::warn!(
            feed = %feed.url,
            errors = feed.errors,
            next_update = %feed.next_update,
            error = %error,
            "Feed poll failed, backing off"
        );
        Ok(feed)
    }

    /// Make sure the feed behind `outline` exists, fetching it when unknown.
    ///
    /// Returns the outline completed with the canonical feed URL, the site
    /// link and a title fallback.
    pub async fn add_feed(&self, mut outline: Outline) -> Result<Outline, SyncError> {
        let url = normalize_feed_url(&outline.xml_url)
            .map_err(FetchError::from)?
            .to_string();
        tracing::info!(feed = %url, "Adding feed");

        let (title, link) = match self.db.get_feed(&url).await? {
            Some(feed) => (feed.title, feed.link),
            None => {
                let now = Utc::now();
                let mut parsed = fetch_feed(&self.client, &self.config.fetch, &url).await?;
                let (title, link) = (parsed.title.clone(), parsed.link.clone());

                let mut feed = Feed::new(url.clone(), now);
                feed.title = parsed.title.clone();
                feed.link = parsed.link.clone();
                feed.hub = parsed.hub.clone();
                self.db.insert_feed_if_absent(&feed).await?;

                // Initial stories are dated by their own publish time
                for story in &mut parsed.stories {
                    story.story.created = story.story.published;
                }
                self.reconcile_and_commit(&url, parsed, Flags::default(), now)
                    .await?;
                (title, link)
            }
        };

        outline.xml_url = url;
        outline.html_url = link;
        if outline.title.is_empty() {
            outline.title = title;
        }
        Ok(outline)
    }

    /// Subscribe `user_id` to a feed, optionally inside a folder.
    ///
    /// Returns whether the user's tree changed.
    pub async fn subscribe_user(
        &self,
        user_id: &str,
        raw_url: &str,
        folder: Option<&str>,
    ) -> Result<bool, SyncError> {
        let leaf = self.add_feed(Outline::feed(raw_url)).await?;
        let incoming = match folder.filter(|f| !f.is_empty()) {
            Some(title) => Outline::folder(title, vec![leaf]),
            None => leaf,
        };
        self.merge_user_outlines(user_id, vec![incoming]).await
    }

    /// Merge outlines into the user's stored tree in one transaction.
    pub async fn merge_user_outlines(
        &self,
        user_id: &str,
        incoming: Vec<Outline>,
    ) -> Result<bool, SyncError> {
        let changed = self
            .db
            .update_user_opml(user_id, |stored| {
                merge_stored(stored, incoming).map_err(anyhow::Error::from)
            })
            .await?;
        if changed {
            tracing::info!(user = %user_id, "Subscription tree updated");
        }
        Ok(changed)
    }

    /// A reader opened the feed. A parked feed becomes due immediately.
    pub async fn mark_viewed(&self, url: &str) -> Result<bool, SyncError> {
        let now = Utc::now();
        let Some(mut feed) = self.db.get_feed(url).await? else {
            return Ok(false);
        };
        if feed.next_update != time_max() {
            return Ok(self.db.mark_viewed(url, now).await?);
        }
        feed.last_viewed = Some(now);
        feed.next_update = now;
        self.db.put_feed(&feed).await?;
        Ok(true)
    }
}
