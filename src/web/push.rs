//! Hub callback handlers for `/push`.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::hub::{self, HubError, PushOutcome, Verification};
use crate::sync::Engine;

/// Query string of both callback methods. Only `feed` is present on pushes.
#[derive(Debug, Deserialize)]
pub struct PushQuery {
    pub feed: String,
    #[serde(rename = "hub.mode", default)]
    pub mode: String,
    #[serde(rename = "hub.topic", default)]
    pub topic: String,
    #[serde(rename = "hub.challenge", default)]
    pub challenge: String,
    #[serde(rename = "hub.lease_seconds", default)]
    pub lease_seconds: Option<String>,
}

fn error_response(error: HubError) -> Response {
    match error {
        HubError::BadToken => StatusCode::NOT_FOUND.into_response(),
        e => {
            tracing::error!(error = %e, "Hub callback failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// GET /push - subscription verification. Echoes the challenge on success.
pub async fn verify(State(engine): State<Engine>, Query(query): Query<PushQuery>) -> Response {
    let params = Verification {
        mode: query.mode,
        topic: query.topic,
        challenge: query.challenge,
        lease_seconds: query.lease_seconds,
    };
    match hub::verify(&engine, &query.feed, &params).await {
        Ok(Some(challenge)) => (StatusCode::OK, challenge).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /push - content delivery.
pub async fn push(
    State(engine): State<Engine>,
    Query(query): Query<PushQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    match hub::handle_push(&engine, &query.feed, content_type, &body).await {
        Ok(PushOutcome::Rejected) => StatusCode::NOT_FOUND.into_response(),
        // Malformed bodies are acknowledged so the hub does not redeliver them
        Ok(PushOutcome::Dropped) | Ok(PushOutcome::Accepted { .. }) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}
