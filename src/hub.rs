//! Push-hub subscriptions: the per-feed subscription state machine, the
//! subscribe request, and the callback's verify/push handling.
//!
//! The callback URL identifies the feed with `feed=<token>`, where the token
//! is the URL-safe base64 of the feed URL.

use std::time::Duration as StdDuration;

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use url::Url;

use crate::config::{Config, HubConfig};
use crate::feed::parse;
use crate::storage::Feed;
use crate::sync::{Engine, Flags, SyncError};

/// Verification mode the callback accepts.
const MODE_SUBSCRIBE: &str = "subscribe";

/// Longest lease taken from a hub; larger values are clamped.
const MAX_LEASE_SECS: i64 = 365 * 24 * 3600;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("Invalid feed token")]
    BadToken,
    #[error("Hub request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Hub request timed out")]
    Timeout,
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Where a feed stands with its hub, derived from the stored record alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Nobody reads the feed; it is neither polled nor subscribed
    NotViewed,
    Unsubscribed,
    /// The hub accepted a request and has not verified it yet
    PendingVerification,
    Subscribed,
    /// Verified, but the lease runs out soon
    Expiring,
}

impl SubscriptionState {
    pub fn of(feed: &Feed, now: DateTime<Utc>, hub: &HubConfig, not_viewed_after: Duration) -> Self {
        if !feed.is_viewed(now, not_viewed_after) {
            return SubscriptionState::NotViewed;
        }

        let expiry = feed.subscribed;
        if expiry.is_some_and(|e| e > now + Duration::hours(hub.renew_before_hours)) {
            return SubscriptionState::Subscribed;
        }
        if feed
            .sub_requested
            .is_some_and(|r| r <= now && now - r < Duration::minutes(hub.pending_minutes))
        {
            return SubscriptionState::PendingVerification;
        }
        if expiry.is_some_and(|e| e > now) {
            return SubscriptionState::Expiring;
        }
        SubscriptionState::Unsubscribed
    }

    /// Whether a subscribe request should go out in this state.
    pub fn wants_subscribe(self) -> bool {
        matches!(self, SubscriptionState::Unsubscribed | SubscriptionState::Expiring)
    }
}

/// Whether `feed` should get a `subscribe-feed` task right now.
pub fn needs_subscribe(feed: &Feed, now: DateTime<Utc>, config: &Config) -> bool {
    !feed.hub.is_empty()
        && !config.server.callback_base.is_empty()
        && SubscriptionState::of(feed, now, &config.hub, config.schedule.not_viewed_after())
            .wants_subscribe()
}

pub fn feed_token(feed_url: &str) -> String {
    URL_SAFE.encode(feed_url)
}

/// Decodes a `feed=` token, padded or not.
pub fn decode_feed_token(token: &str) -> Result<String, HubError> {
    let bytes = URL_SAFE
        .decode(token)
        .or_else(|_| URL_SAFE_NO_PAD.decode(token))
        .map_err(|_| HubError::BadToken)?;
    String::from_utf8(bytes).map_err(|_| HubError::BadToken)
}

pub fn callback_url(callback_base: &str, feed_url: &str) -> String {
    let mut url = format!("{}/push", callback_base.trim_end_matches('/'));
    url.push_str("?feed=");
    url.push_str(&feed_token(feed_url));
    url
}

fn topic(feed_url: &str) -> String {
    match Url::parse(feed_url) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => feed_url.split('#').next().unwrap_or(feed_url).to_owned(),
    }
}

/// What a subscribe attempt did.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscribeOutcome {
    /// Nothing to do in this state, or no hub / callback configured
    Skipped(SubscriptionState),
    /// The hub answered 204; verification will follow
    Requested,
    /// Any other status; the next attempt is pushed out
    Rejected(u16),
    /// The request never completed
    Failed(String),
}

/// Ask the feed's hub to push updates to our callback.
pub async fn subscribe(engine: &Engine, feed_url: &str) -> Result<SubscribeOutcome, HubError> {
    let now = Utc::now();
    let config = &engine.config;
    let feed = engine
        .db
        .get_feed(feed_url)
        .await
        .map_err(SyncError::from)?
        .ok_or_else(|| SyncError::FeedNotFound(feed_url.to_owned()))?;

    let state = SubscriptionState::of(&feed, now, &config.hub, config.schedule.not_viewed_after());
    if feed.hub.is_empty() || config.server.callback_base.is_empty() || !state.wants_subscribe() {
        tracing::debug!(feed = %feed.url, ?state, "Skipping hub subscription");
        return Ok(SubscribeOutcome::Skipped(state));
    }

    let body = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("hub.callback", &callback_url(&config.server.callback_base, &feed.url))
        .append_pair("hub.mode", MODE_SUBSCRIBE)
        .append_pair("hub.verify", "sync")
        .append_pair("hub.topic", &topic(&feed.url))
        .finish();

    let request = engine
        .client
        .post(feed.hub.as_str())
        .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(body)
        .send();

    let timeout = StdDuration::from_secs(config.hub.timeout_secs);
    let response = match tokio::time::timeout(timeout, request).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            tracing::warn!(feed = %feed.url, hub = %feed.hub, error = %e, "Hub subscribe request failed");
            return Ok(SubscribeOutcome::Failed(HubError::Network(e).to_string()));
        }
        Err(_) => {
            tracing::warn!(feed = %feed.url, hub = %feed.hub, "Hub subscribe request timed out");
            return Ok(SubscribeOutcome::Failed(HubError::Timeout.to_string()));
        }
    };

    let status = response.status();
    if status == reqwest::StatusCode::NO_CONTENT {
        engine
            .db
            .set_feed_subscription(&feed.url, feed.subscribed, Some(now))
            .await
            .map_err(SyncError::from)?;
        tracing::info!(feed = %feed.url, hub = %feed.hub, "Hub subscription requested");
        return Ok(SubscribeOutcome::Requested);
    }

    // Push the next attempt out so a misbehaving hub is not hammered
    let expiry = now + Duration::hours(config.hub.failure_backoff_hours);
    engine
        .db
        .set_feed_subscription(&feed.url, Some(expiry), feed.sub_requested)
        .await
        .map_err(SyncError::from)?;

    if status == reqwest::StatusCode::CONFLICT {
        tracing::debug!(feed = %feed.url, hub = %feed.hub, "Hub reported subscription conflict");
    } else {
        tracing::warn!(feed = %feed.url, hub = %feed.hub, status = status.as_u16(), "Unexpected hub response");
    }
    Ok(SubscribeOutcome::Rejected(status.as_u16()))
}

/// Parameters of a hub verification request.
#[derive(Debug, Clone, Default)]
pub struct Verification {
    pub mode: String,
    pub topic: String,
    pub challenge: String,
    pub lease_seconds: Option<String>,
}

/// Handle a verification GET. Returns the challenge to echo, or `None` to
/// reject it.
pub async fn verify(
    engine: &Engine,
    token: &str,
    params: &Verification,
) -> Result<Option<String>, HubError> {
    let now = Utc::now();
    let feed_url = decode_feed_token(token)?;
    let Some(feed) = engine.db.get_feed(&feed_url).await.map_err(SyncError::from)? else {
        tracing::debug!(feed = %feed_url, "Verification for unknown feed");
        return Ok(None);
    };

    let viewed = feed.is_viewed(now, engine.config.schedule.not_viewed_after());
    if !viewed || params.mode != MODE_SUBSCRIBE || params.topic != feed.url {
        tracing::info!(
            feed = %feed.url,
            mode = %params.mode,
            topic = %params.topic,
            viewed,
            "Rejecting hub verification"
        );
        return Ok(None);
    }

    let lease = params
        .lease_seconds
        .as_deref()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .filter(|&secs| secs > 0)
        .unwrap_or(engine.config.hub.default_lease_secs)
        .clamp(1, MAX_LEASE_SECS);
    let expiry = now + Duration::seconds(lease);

    engine
        .db
        .set_feed_subscription(&feed.url, Some(expiry), None)
        .await
        .map_err(SyncError::from)?;
    tracing::info!(feed = %feed.url, lease_secs = lease, "Hub subscription verified");

    Ok(Some(params.challenge.clone()))
}

/// What happened to a pushed document.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// Unknown or unread feed; nothing was touched
    Rejected,
    /// The body did not parse
    Dropped,
    Accepted { written: usize },
}

/// Reconcile a document delivered by the hub.
pub async fn handle_push(
    engine: &Engine,
    token: &str,
    content_type: &str,
    body: &[u8],
) -> Result<PushOutcome, HubError> {
    let now = Utc::now();
    let feed_url = decode_feed_token(token)?;
    let Some(feed) = engine.db.get_feed(&feed_url).await.map_err(SyncError::from)? else {
        return Ok(PushOutcome::Rejected);
    };
    if !feed.is_viewed(now, engine.config.schedule.not_viewed_after()) {
        tracing::debug!(feed = %feed.url, "Ignoring push for unread feed");
        return Ok(PushOutcome::Rejected);
    }

    let parsed = match parse(content_type, &feed.url, &feed.url, body) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!(feed = %feed.url, error = %e, "Dropping malformed push");
            return Ok(PushOutcome::Dropped);
        }
    };

    let flags = Flags {
        from_push: true,
        ..Flags::default()
    };
    let decision = engine.reconcile_and_commit(&feed.url, parsed, flags, now).await?;
    Ok(PushOutcome::Accepted {
        written: decision.story_writes().len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use chrono::TimeZone;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn state(feed: &Feed, now: DateTime<Utc>) -> SubscriptionState {
        SubscriptionState::of(feed, now, &HubConfig::default(), Duration::days(7))
    }

    #[test]
    fn test_state_derivation() {
        let now = t0();
        let mut feed = Feed::new("https://f.example/", now);
        assert_eq!(state(&feed, now), SubscriptionState::Unsubscribed);

        feed.sub_requested = Some(now - Duration::minutes(10));
        assert_eq!(state(&feed, now), SubscriptionState::PendingVerification);
        feed.sub_requested = Some(now - Duration::minutes(90));
        assert_eq!(state(&feed, now), SubscriptionState::Unsubscribed);

        feed.subscribed = Some(now + Duration::days(3));
        assert_eq!(state(&feed, now), SubscriptionState::Subscribed);
        feed.subscribed = Some(now + Duration::hours(2));
        assert_eq!(state(&feed, now), SubscriptionState::Expiring);
        feed.subscribed = Some(now - Duration::hours(2));
        assert_eq!(state(&feed, now), SubscriptionState::Unsubscribed);

        feed.last_viewed = Some(now - Duration::days(10));
        feed.subscribed = Some(now + Duration::days(3));
        assert_eq!(state(&feed, now), SubscriptionState::NotViewed);
    }

    #[test]
    fn test_token_roundtrip_and_callback() {
        let url = "https://example.com/feed?x=1&y=2";
        let cb = callback_url("https://cb.example/", url);
        assert!(cb.starts_with("https://cb.example/push?feed="));
        let (_, token) = cb.split_once("?feed=").unwrap();
        assert_eq!(decode_feed_token(token).unwrap(), url);
        assert_eq!(decode_feed_token(token.trim_end_matches('=')).unwrap(), url);
        assert!(matches!(decode_feed_token("%%%"), Err(HubError::BadToken)));
    }

    #[test]
    fn test_topic_strips_fragment() {
        assert_eq!(topic("https://a.example/feed#x"), "https://a.example/feed");
    }

    async fn engine_with_hub(hub: &str) -> (Engine, String) {
        let mut config = Config::default();
        config.fetch.allow_private_hosts = true;
        config.server.callback_base = "https://cb.example".into();
        let db = Database::open(":memory:").await.unwrap();
        let engine = Engine::new(db, reqwest::Client::new(), config);

        let mut feed = Feed::new("https://feed.example/rss", Utc::now());
        feed.hub = hub.to_owned();
        engine.db.put_feed(&feed).await.unwrap();
        (engine, feed.url)
    }

    async fn hub_returning(status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hub"))
            .and(body_string_contains("hub.mode=subscribe"))
            .and(body_string_contains("hub.verify=sync"))
            .respond_with(ResponseTemplate::new(status))
            .expect(1)
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_subscribe_204_marks_pending() {
        let server = hub_returning(204).await;
        let (engine, url) = engine_with_hub(&format!("{}/hub", server.uri())).await;

        assert_eq!(subscribe(&engine, &url).await.unwrap(), SubscribeOutcome::Requested);
        let feed = engine.db.get_feed(&url).await.unwrap().unwrap();
        assert!(feed.sub_requested.is_some());
        assert_eq!(
            state(&feed, Utc::now()),
            SubscriptionState::PendingVerification
        );

        // Pending feeds are left alone
        assert!(matches!(
            subscribe(&engine, &url).await.unwrap(),
            SubscribeOutcome::Skipped(SubscriptionState::PendingVerification)
        ));
    }

    #[tokio::test]
    async fn test_subscribe_conflict_pushes_expiry_out() {
        let server = hub_returning(409).await;
        let (engine, url) = engine_with_hub(&format!("{}/hub", server.uri())).await;

        assert_eq!(subscribe(&engine, &url).await.unwrap(), SubscribeOutcome::Rejected(409));
        let feed = engine.db.get_feed(&url).await.unwrap().unwrap();
        let expiry = feed.subscribed.unwrap();
        assert!(expiry > Utc::now() + Duration::hours(47));
    }

    #[tokio::test]
    async fn test_subscribe_server_error_treated_like_conflict() {
        let server = hub_returning(500).await;
        let (engine, url) = engine_with_hub(&format!("{}/hub", server.uri())).await;
        assert_eq!(subscribe(&engine, &url).await.unwrap(), SubscribeOutcome::Rejected(500));
        assert!(engine.db.get_feed(&url).await.unwrap().unwrap().subscribed.is_some());
    }

    #[tokio::test]
    async fn test_subscribe_without_hub_is_skipped() {
        let (engine, url) = engine_with_hub("").await;
        assert!(matches!(
            subscribe(&engine, &url).await.unwrap(),
            SubscribeOutcome::Skipped(_)
        ));
    }

    #[tokio::test]
    async fn test_verify_accepts_matching_topic() {
        let (engine, url) = engine_with_hub("https://hub.example/").await;
        let params = Verification {
            mode: "subscribe".into(),
            topic: url.clone(),
            challenge: "abc".into(),
            lease_seconds: Some("3600".into()),
        };

        let reply = verify(&engine, &feed_token(&url), &params).await.unwrap();
        assert_eq!(reply.as_deref(), Some("abc"));
        let feed = engine.db.get_feed(&url).await.unwrap().unwrap();
        let expiry = feed.subscribed.unwrap();
        assert!(expiry > Utc::now() + Duration::minutes(59));
        assert!(expiry <= Utc::now() + Duration::hours(1));
    }

    #[tokio::test]
    async fn test_verify_rejects_mismatches() {
        let (engine, url) = engine_with_hub("https://hub.example/").await;
        let good = Verification {
            mode: "subscribe".into(),
            topic: url.clone(),
            challenge: "abc".into(),
            lease_seconds: None,
        };

        let wrong_mode = Verification {
            mode: "unsubscribe".into(),
            ..good.clone()
        };
        assert_eq!(verify(&engine, &feed_token(&url), &wrong_mode).await.unwrap(), None);

        let wrong_topic = Verification {
            topic: format!("{url}#x"),
            ..good.clone()
        };
        assert_eq!(verify(&engine, &feed_token(&url), &wrong_topic).await.unwrap(), None);

        let unknown = feed_token("https://unknown.example/");
        assert_eq!(verify(&engine, &unknown, &good).await.unwrap(), None);
        assert_eq!(engine.db.get_feed(&url).await.unwrap().unwrap().subscribed, None);

        // Missing lease falls back to the default
        assert!(verify(&engine, &feed_token(&url), &good).await.unwrap().is_some());
        let expiry = engine.db.get_feed(&url).await.unwrap().unwrap().subscribed.unwrap();
        assert!(expiry > Utc::now() + Duration::days(4));
    }

    #[tokio::test]
    async fn test_verify_clamps_huge_lease() {
        let (engine, url) = engine_with_hub("https://hub.example/").await;
        let params = Verification {
            mode: "subscribe".into(),
            topic: url.clone(),
            challenge: "abc".into(),
            lease_seconds: Some("1000000000000000".into()),
        };

        let reply = verify(&engine, &feed_token(&url), &params).await.unwrap();
        assert_eq!(reply.as_deref(), Some("abc"));
        let expiry = engine.db.get_feed(&url).await.unwrap().unwrap().subscribed.unwrap();
        assert!(expiry <= Utc::now() + Duration::seconds(MAX_LEASE_SECS));
        assert!(expiry > Utc::now() + Duration::days(364));
    }

    const PUSHED: &str = r#"<?xml version="1.0"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Pushed</title>
  <id>urn:pushed</id>
  <updated>2024-03-01T10:00:00Z</updated>
  <entry><id>urn:e1</id><title>E1</title><updated>2024-03-01T10:00:00Z</updated></entry>
</feed>"#;

    #[tokio::test]
    async fn test_push_reconciles_for_viewed_feed() {
        let (engine, url) = engine_with_hub("https://hub.example/").await;
        let outcome = handle_push(&engine, &feed_token(&url), "application/atom+xml", PUSHED.as_bytes())
            .await
            .unwrap();
        assert_eq!(outcome, PushOutcome::Accepted { written: 1 });

        let feed = engine.db.get_feed(&url).await.unwrap().unwrap();
        assert_eq!(feed.title, "Pushed");
        assert!(feed.next_update <= Utc::now() + Duration::hours(6));
    }

    #[tokio::test]
    async fn test_push_for_unread_feed_mutates_nothing() {
        let (engine, url) = engine_with_hub("https://hub.example/").await;
        let mut feed = engine.db.get_feed(&url).await.unwrap().unwrap();
        feed.last_viewed = Some(Utc::now() - Duration::days(30));
        engine.db.put_feed(&feed).await.unwrap();
        let feed = engine.db.get_feed(&url).await.unwrap().unwrap();

        let outcome = handle_push(&engine, &feed_token(&url), "application/atom+xml", PUSHED.as_bytes())
            .await
            .unwrap();
        assert_eq!(outcome, PushOutcome::Rejected);
        assert_eq!(engine.db.get_feed(&url).await.unwrap().unwrap(), feed);
        assert_eq!(engine.db.count_stories(&url).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_push_dropped() {
        let (engine, url) = engine_with_hub("https://hub.example/").await;
        let before = engine.db.get_feed(&url).await.unwrap().unwrap();
        let outcome = handle_push(&engine, &feed_token(&url), "text/xml", b"not a feed")
            .await
            .unwrap();
        assert_eq!(outcome, PushOutcome::Dropped);
        assert_eq!(engine.db.get_feed(&url).await.unwrap().unwrap(), before);
    }
}
