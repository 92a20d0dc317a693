use axum::{extract::DefaultBodyLimit, routing::get, Router};
use tower_http::trace::TraceLayer;

use super::push::{push, verify};
use crate::sync::Engine;

/// Router for the hub callback endpoint.
pub fn create_router(engine: Engine) -> Router {
    let body_limit = engine.config.fetch.max_body_bytes;
    Router::new()
        .route("/push", get(verify).post(push))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

/// Bind the configured listen address and serve until the task is dropped.
pub async fn serve(engine: Engine) -> anyhow::Result<()> {
    let listen = engine.config.server.listen.clone();
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(listen = %listen, "Hub callback listening");
    axum::serve(listener, create_router(engine)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::hub::feed_token;
    use crate::storage::{Database, Feed};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{Duration, Utc};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const FEED: &str = "https://feed.example/rss";

    async fn engine() -> Engine {
        let db = Database::open(":memory:").await.unwrap();
        db.put_feed(&Feed::new(FEED, Utc::now())).await.unwrap();
        Engine::new(db, reqwest::Client::new(), Config::default())
    }

    fn verify_uri(token: &str, mode: &str, topic: &str) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("feed", token)
            .append_pair("hub.mode", mode)
            .append_pair("hub.topic", topic)
            .append_pair("hub.challenge", "xyz")
            .append_pair("hub.lease_seconds", "600")
            .finish();
        format!("/push?{query}")
    }

    #[tokio::test]
    async fn test_verify_echoes_challenge() {
        let engine = engine().await;
        let app = create_router(engine.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .uri(verify_uri(&feed_token(FEED), "subscribe", FEED))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"xyz");
        let feed = engine.db.get_feed(FEED).await.unwrap().unwrap();
        assert!(feed.subscribed.unwrap() > Utc::now() + Duration::minutes(9));
    }

    #[tokio::test]
    async fn test_verify_rejects_wrong_topic() {
        let app = create_router(engine().await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri(verify_uri(&feed_token(FEED), "subscribe", "https://other/"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_token_is_not_found() {
        let app = create_router(engine().await);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/push?feed=%25%25")
                    .body(Body::from("<rss/>"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_push_accepts_document() {
        let engine = engine().await;
        let app = create_router(engine.clone());
        let doc = r#"<rss version="2.0"><channel><title>T</title>
            <item><guid>g1</guid><title>One</title></item></channel></rss>"#;

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/push?feed={}", feed_token(FEED)))
                    .header("Content-Type", "application/rss+xml")
                    .body(Body::from(doc))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(engine.db.count_stories(FEED).await.unwrap(), 1);
    }
}
