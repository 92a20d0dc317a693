//! Getting feed documents into the engine.
//!
//! - [`fetcher`] retrieves a URL under the host policy, size cap and timeout,
//!   following at most one autodiscovery link
//! - [`parser`] turns document bytes into a [`ParsedFeed`] using `feed-rs`
//! - [`opml`] extracts subscriptions from an OPML import
//!
//! # Example
//!
//! ```ignore
//! let client = build_client(&config.fetch)?;
//! let parsed = fetch_feed(&client, &config.fetch, "example.com/rss").await?;
//! println!("{} stories", parsed.stories.len());
//! ```

mod discovery;
mod fetcher;
mod opml;
mod parser;

pub use fetcher::{build_client, fetch, fetch_feed, FetchError, Fetched};
pub use opml::{parse_opml, OpmlError, OpmlFeed};
pub use parser::{parse, ParseError, ParsedFeed, ParsedStory};
pub(crate) use parser::parse_at;
