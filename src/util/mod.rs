//! Utility functions shared by the fetch, hub and task layers.
//!
//! - **Feed URLs**: normalization to a canonical feed identity and fetch policy
//!   checks (blocked hosts, SSRF guard)
//! - **Task names**: reversible escaping of feed identities into the restricted
//!   task-name alphabet
//!
//! # Examples
//!
//! ```
//! use feedsync::util::{normalize_feed_url, task_name_escape, task_name_unescape};
//!
//! let url = normalize_feed_url("example.com/rss#top").unwrap();
//! assert_eq!(url.as_str(), "http://example.com/rss");
//!
//! let escaped = task_name_escape("http://a.b/c");
//! assert_eq!(task_name_unescape(&escaped).as_deref(), Some("http://a.b/c"));
//! ```

mod feed_url;
mod task_name;

pub use feed_url::{check_fetch_allowed, normalize_feed_url, FeedUrlError};
pub use task_name::{task_name_escape, task_name_unescape};
