use chrono::{DateTime, Duration, TimeZone, Utc};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

// ============================================================================
// Timestamps
// ============================================================================

/// Next-due sentinel for feeds nobody is reading (3000-01-01T00:00:00Z).
pub const TIME_MAX_SECS: i64 = 32_503_680_000;

pub fn time_max() -> DateTime<Utc> {
    from_ts(TIME_MAX_SECS)
}

/// Timestamps are persisted as whole unix seconds.
pub(crate) fn to_ts(t: DateTime<Utc>) -> i64 {
    t.timestamp()
}

pub(crate) fn from_ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn opt_ts(t: Option<DateTime<Utc>>) -> Option<i64> {
    t.map(to_ts)
}

pub(crate) fn opt_from_ts(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.map(from_ts)
}

// ============================================================================
// Helper Types
// ============================================================================

/// Internal row type for feed queries
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedRow {
    pub url: String,
    pub title: String,
    pub link: String,
    pub hub: String,
    pub updated: Option<i64>,
    pub date: Option<i64>,
    pub checked: Option<i64>,
    pub next_update: i64,
    pub last_viewed: Option<i64>,
    pub subscribed: Option<i64>,
    pub sub_requested: Option<i64>,
    pub errors: i64,
    pub average_secs: i64,
}

impl FeedRow {
    pub(crate) fn into_feed(self) -> Feed {
        Feed {
            url: self.url,
            title: self.title,
            link: self.link,
            hub: self.hub,
            updated: opt_from_ts(self.updated),
            date: opt_from_ts(self.date),
            checked: opt_from_ts(self.checked),
            next_update: from_ts(self.next_update),
            last_viewed: opt_from_ts(self.last_viewed),
            subscribed: opt_from_ts(self.subscribed),
            sub_requested: opt_from_ts(self.sub_requested),
            errors: u32::try_from(self.errors).unwrap_or(0),
            average: Duration::seconds(self.average_secs),
        }
    }
}

/// Internal row type for story queries
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct StoryRow {
    pub feed_url: String,
    pub id: String,
    pub title: String,
    pub link: String,
    pub author: String,
    pub summary: String,
    pub published: i64,
    pub updated: Option<i64>,
    pub created: i64,
}

impl StoryRow {
    pub(crate) fn into_story(self) -> Story {
        Story {
            feed_url: self.feed_url,
            id: self.id,
            title: self.title,
            link: self.link,
            author: self.author,
            summary: self.summary,
            published: from_ts(self.published),
            updated: opt_from_ts(self.updated),
            created: from_ts(self.created),
        }
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// A feed tracked by the engine, keyed by its canonical URL.
#[derive(Debug, Clone, PartialEq)]
pub struct Feed {
    pub url: String,
    pub title: String,
    /// Site link declared by the document
    pub link: String,
    /// Push hub URL, empty when the feed declares none
    pub hub: String,
    /// Last update time claimed by the feed document
    pub updated: Option<DateTime<Utc>>,
    /// When this service last wrote new or changed stories
    pub date: Option<DateTime<Utc>>,
    pub checked: Option<DateTime<Utc>>,
    pub next_update: DateTime<Utc>,
    pub last_viewed: Option<DateTime<Utc>>,
    /// Hub subscription expiry
    pub subscribed: Option<DateTime<Utc>>,
    /// When the hub last accepted a subscription request pending verification
    pub sub_requested: Option<DateTime<Utc>>,
    /// Consecutive poll failures
    pub errors: u32,
    /// Moving estimate of the interval between story arrivals
    pub average: Duration,
}

impl Feed {
    /// A feed that has never been fetched, due immediately.
    pub fn new(url: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            url: url.into(),
            title: String::new(),
            link: String::new(),
            hub: String::new(),
            updated: None,
            date: None,
            checked: None,
            next_update: now,
            last_viewed: Some(now),
            subscribed: None,
            sub_requested: None,
            errors: 0,
            average: Duration::zero(),
        }
    }

    /// Whether any reader opened this feed within `window` of `now`.
    pub fn is_viewed(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.last_viewed.is_some_and(|viewed| now - viewed <= window)
    }
}

/// A story owned by a feed, keyed by `(feed_url, id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Story {
    pub feed_url: String,
    /// Per-feed identity derived from the source's own identifiers
    pub id: String,
    pub title: String,
    pub link: String,
    pub author: String,
    pub summary: String,
    pub published: DateTime<Utc>,
    /// Content update time claimed by the source
    pub updated: Option<DateTime<Utc>>,
    /// First time this service saw the story. Never changes once stored.
    pub created: DateTime<Utc>,
}

/// Story body stored next to its story in slot 1.
///
/// Exactly one of `compressed` and `raw` is populated.
#[derive(Debug, Clone, PartialEq)]
pub struct StoryContent {
    pub feed_url: String,
    pub story_id: String,
    pub compressed: Option<Vec<u8>>,
    pub raw: Option<String>,
}

/// One story plus its content, written together.
#[derive(Debug, Clone, PartialEq)]
pub struct StoryWrite {
    pub story: Story,
    pub content: StoryContent,
}
