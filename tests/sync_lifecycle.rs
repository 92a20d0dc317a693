//! End-to-end reconciliation: fetch a document over HTTP, reconcile it into
//! an in-memory store, then fetch a revised document and check that only the
//! changed and new stories are written.

use std::collections::HashSet;

use chrono::{DateTime, Duration, TimeZone, Utc};
use feedsync::config::Config;
use feedsync::feed::fetch_feed;
use feedsync::storage::{Database, Feed};
use feedsync::sync::{unpack_content, Engine, Flags, UpdateOutcome};
use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

fn entry(id: &str, updated: &str, body: &str) -> String {
    format!(
        r#"<entry><id>urn:{id}</id><title>{id}</title><link href="https://site.example/{id}"/>
           <published>2024-01-01T00:00:00Z</published><updated>{updated}</updated>
           <content type="html">{body}</content></entry>"#
    )
}

fn atom(updated: &str, entries: &[String]) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Lifecycle</title><id>urn:lifecycle</id>
  <link rel="alternate" href="https://site.example/"/>
  <updated>{updated}</updated>
  {}
</feed>"#,
        entries.join("\n")
    )
}

async fn serve_document(server: &MockServer, body: String) {
    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/atom"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(body)
                .insert_header("Content-Type", "application/atom+xml"),
        )
        .mount(server)
        .await;
}

async fn engine() -> Engine {
    let mut config = Config::default();
    config.database_path = ":memory:".into();
    config.fetch.allow_private_hosts = true;
    let db = Database::open(&config.database_path).await.unwrap();
    Engine::new(db, reqwest::Client::new(), config)
}

fn ids(ids: &[&str]) -> HashSet<String> {
    ids.iter().map(|id| format!("urn:{id}")).collect()
}

#[tokio::test]
async fn test_only_changed_and_new_stories_are_written() {
    let server = MockServer::start().await;
    let engine = engine().await;
    let url = format!("{}/atom", server.uri());
    let v1 = "2024-01-01T10:00:00Z";

    serve_document(
        &server,
        atom(v1, &[entry("A", v1, "a"), entry("B", v1, "b"), entry("C", v1, "c")]),
    )
    .await;

    engine
        .db
        .insert_feed_if_absent(&Feed::new(url.clone(), t0()))
        .await
        .unwrap();
    let parsed = fetch_feed(&engine.client, &engine.config.fetch, &url).await.unwrap();
    let first = engine
        .reconcile_and_commit(&url, parsed, Flags::default(), t0())
        .await
        .unwrap();

    let written: HashSet<String> = first.story_writes().iter().map(|w| w.story.id.clone()).collect();
    assert_eq!(written, ids(&["A", "B", "C"]));
    assert_eq!(first.feed().next_update, t0() + Duration::hours(3));
    assert_eq!(engine.db.count_stories(&url).await.unwrap(), 3);
    for id in ["urn:A", "urn:B", "urn:C"] {
        let content = engine.db.get_story_content(&url, id).await.unwrap().unwrap();
        assert!(!unpack_content(&content).unwrap().is_empty());
    }

    let stored = engine.db.get_stories(&url, &["urn:C".to_string()]).await.unwrap();
    let c_created = stored["urn:C"].created;

    // One hour later: C edited, D published
    let v2 = "2024-01-01T11:00:00Z";
    serve_document(
        &server,
        atom(
            v2,
            &[
                entry("A", v1, "a"),
                entry("B", v1, "b"),
                entry("C", v2, "c, revised"),
                entry("D", v2, "d"),
            ],
        ),
    )
    .await;

    let later = t0() + Duration::hours(1);
    let parsed = fetch_feed(&engine.client, &engine.config.fetch, &url).await.unwrap();
    let second = engine
        .reconcile_and_commit(&url, parsed, Flags::default(), later)
        .await
        .unwrap();

    let written: HashSet<String> = second.story_writes().iter().map(|w| w.story.id.clone()).collect();
    assert_eq!(written, ids(&["C", "D"]));
    assert!(second.feed().next_update > later);
    assert_eq!(engine.db.count_stories(&url).await.unwrap(), 4);

    let stored = engine.db.get_stories(&url, &["urn:C".to_string()]).await.unwrap();
    assert_eq!(stored["urn:C"].created, c_created);
    let content = engine.db.get_story_content(&url, "urn:C").await.unwrap().unwrap();
    assert_eq!(unpack_content(&content).unwrap(), "c, revised");
}

#[tokio::test]
async fn test_unchanged_feed_update_skips_story_diff() {
    let server = MockServer::start().await;
    let engine = engine().await;
    let url = format!("{}/atom", server.uri());
    let v1 = "2024-01-01T10:00:00Z";

    serve_document(&server, atom(v1, &[entry("A", v1, "a")])).await;
    engine.add_feed(feedsync::subscriptions::Outline::feed(&url)).await.unwrap();

    // A new entry without a bump of the feed's own update time is not seen
    serve_document(&server, atom(v1, &[entry("A", v1, "a"), entry("B", v1, "b")])).await;
    let outcome = engine.update_feed(&url, true).await.unwrap();
    assert!(matches!(outcome, UpdateOutcome::Updated { written: 0, .. }));
    assert_eq!(engine.db.count_stories(&url).await.unwrap(), 1);
}

#[tokio::test]
async fn test_add_feed_dates_initial_stories_by_publish_time() {
    let server = MockServer::start().await;
    let engine = engine().await;
    let url = format!("{}/atom", server.uri());
    let v1 = "2024-01-01T10:00:00Z";
    serve_document(&server, atom(v1, &[entry("A", v1, "a")])).await;

    let outline = engine.add_feed(feedsync::subscriptions::Outline::feed(&url)).await.unwrap();
    assert_eq!(outline.title, "Lifecycle");
    assert_eq!(outline.html_url, "https://site.example/");

    let stored = engine.db.get_stories(&url, &["urn:A".to_string()]).await.unwrap();
    let published = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    assert_eq!(stored["urn:A"].published, published);
    assert_eq!(stored["urn:A"].created, published);
}

#[tokio::test]
async fn test_repeated_failures_back_off_then_recover() {
    let server = MockServer::start().await;
    let engine = engine().await;
    let url = format!("{}/atom", server.uri());
    engine.db.put_feed(&Feed::new(url.clone(), Utc::now())).await.unwrap();

    Mock::given(method("GET"))
        .and(path("/atom"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    for expected in 1..=3u32 {
        let outcome = engine.update_feed(&url, true).await.unwrap();
        assert!(matches!(outcome, UpdateOutcome::Failed { .. }));
        let feed = engine.db.get_feed(&url).await.unwrap().unwrap();
        assert_eq!(feed.errors, expected);
    }

    let v1 = "2024-01-01T10:00:00Z";
    serve_document(&server, atom(v1, &[entry("A", v1, "a")])).await;
    let outcome = engine.update_feed(&url, true).await.unwrap();
    let feed = outcome.feed().unwrap();
    assert_eq!(feed.errors, 0);
    assert!(feed.next_update > Utc::now());
}
