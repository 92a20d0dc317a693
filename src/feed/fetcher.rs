use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use url::Url;

use super::discovery::{find_feed_link_in_html, looks_like_html};
use super::parser::{parse, ParseError, ParsedFeed};
use crate::config::FetchConfig;
use crate::util::{check_fetch_allowed, normalize_feed_url, FeedUrlError};

/// Errors that can occur while retrieving a feed.
///
/// Every variant is a failed poll for the feed in question; none of them
/// aborts the surrounding unit of work.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The URL is malformed or not fetchable under the current policy
    #[error(transparent)]
    Url(#[from] FeedUrlError),
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// Any response other than 200 OK
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Request timed out")]
    Timeout,
    /// Response body exceeded the configured size cap
    #[error("Response larger than {0} bytes")]
    ResponseTooLarge(usize),
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Raw result of one HTTP retrieval.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub url: Url,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Redirect hops followed before giving up.
const MAX_REDIRECTS: usize = 10;

/// Build the shared HTTP client used for feed fetches and hub requests.
///
/// Every redirect hop is checked against the same host policy as the
/// original request.
pub fn build_client(config: &FetchConfig) -> reqwest::Result<reqwest::Client> {
    let blocked_hosts = config.blocked_hosts.clone();
    let allow_private = config.allow_private_hosts;
    let policy = reqwest::redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        match check_fetch_allowed(attempt.url(), &blocked_hosts, allow_private) {
            Ok(()) => attempt.follow(),
            Err(e) => attempt.error(e),
        }
    });

    reqwest::Client::builder()
        .user_agent(config.user_agent.as_str())
        .redirect(policy)
        .build()
}

/// Retrieve `url` once, enforcing the host policy, timeout and size cap.
///
/// Anything but 200 is a failure. There are no inline retries: a failed
/// fetch is rescheduled through the feed's backoff.
pub async fn fetch(
    client: &reqwest::Client,
    config: &FetchConfig,
    url: &Url,
) -> Result<Fetched, FetchError> {
    check_fetch_allowed(url, &config.blocked_hosts, config.allow_private_hosts)?;

    let timeout = Duration::from_secs(config.timeout_secs);
    tokio::time::timeout(timeout, fetch_inner(client, url, config.max_body_bytes))
        .await
        .map_err(|_| FetchError::Timeout)?
}

async fn fetch_inner(
    client: &reqwest::Client,
    url: &Url,
    limit: usize,
) -> Result<Fetched, FetchError> {
    let response = client.get(url.as_str()).send().await?;

    if response.status() != reqwest::StatusCode::OK {
        return Err(FetchError::HttpStatus(response.status().as_u16()));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_owned();

    let bytes = read_limited_bytes(response, limit).await?;

    Ok(Fetched {
        url: url.clone(),
        content_type,
        bytes,
    })
}

/// Fetch and parse the feed known as `orig_url`.
///
/// When the first response is an HTML page advertising a feed, the
/// advertised URL is fetched once instead. Stories are always attributed to
/// `orig_url`.
pub async fn fetch_feed(
    client: &reqwest::Client,
    config: &FetchConfig,
    orig_url: &str,
) -> Result<ParsedFeed, FetchError> {
    let orig = normalize_feed_url(orig_url)?;
    let mut fetched = fetch(client, config, &orig).await?;

    if looks_like_html(&fetched.content_type, &fetched.bytes) {
        let html = String::from_utf8_lossy(&fetched.bytes);
        let discovered = find_feed_link_in_html(&html, orig.as_str())
            .and_then(|link| normalize_feed_url(&link).ok());

        if let Some(discovered) = discovered.filter(|d| *d != orig) {
            tracing::debug!(feed = %orig, discovered = %discovered, "Following feed autodiscovery link");
            fetched = fetch(client, config, &discovered).await?;
        }
    }

    Ok(parse(
        &fetched.content_type,
        orig.as_str(),
        fetched.url.as_str(),
        &fetched.bytes,
    )?)
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
