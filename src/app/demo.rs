//! Demo application served by the shipped binary.
//!
//! Exposes the same routes under both execution models:
//! - `GET /` → `ok`
//! - `GET /health` → `{"status":"OK"}`
//! - `POST /webhook` → ticket event intake
//! - `GET /delay/{ms}` → sleeps, then `delayed {ms}ms`
//! - `GET /fail` → handler failure

use std::time::Duration;

use axum::extract::Path;
use axum::http::{header, Method, Request, Response, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{json, Value};

use crate::app::{Application, BlockingHandler, HandlerError};
use crate::config::ExecutionModel;

/// Longest sleep `/delay/{ms}` will honour.
pub const MAX_DELAY_MS: u64 = 60_000;

/// Build the demo application for the given execution model.
pub fn application(model: ExecutionModel) -> Application {
    match model {
        ExecutionModel::AsyncEventLoop => Application::from_router(router()),
        ExecutionModel::Sync => Application::from_blocking(DemoBlocking),
    }
}

/// The async flavour, as an axum router.
pub fn router() -> Router {
    Router::new()
        .route("/", get(|| async { "ok" }))
        .route("/health", get(|| async { Json(health()) }))
        .route("/webhook", post(|body: Bytes| async move { Json(webhook_reply(&body)) }))
        .route(
            "/delay/{ms}",
            get(|Path(ms): Path<String>| async move {
                match parse_delay(&ms) {
                    Some(delay) => {
                        tokio::time::sleep(delay).await;
                        (StatusCode::OK, format!("delayed {}ms", delay.as_millis()))
                    }
                    None => (StatusCode::BAD_REQUEST, "invalid delay".to_string()),
                }
            }),
        )
        .route("/fail", get(fail_async))
}

async fn fail_async() -> &'static str {
    panic!("requested failure")
}

fn health() -> Value {
    json!({ "status": "OK" })
}

/// Reply to a webhook delivery.
///
/// Picks the first `add`/`update` event on a `Ticket`. Malformed payloads
/// still get a 200 with an `error` field, matching what webhook senders expect.
pub fn webhook_reply(body: &[u8]) -> Value {
    let events: Vec<Value> = match serde_json::from_slice(body) {
        Ok(Value::Array(events)) => events,
        Ok(_) => return json!({ "error": "expected a JSON array of events" }),
        Err(e) => return json!({ "error": e.to_string() }),
    };

    for event in &events {
        let kind = event.get("event").and_then(Value::as_str);
        let itemtype = event.get("itemtype").and_then(Value::as_str);
        if matches!(kind, Some("add") | Some("update")) && itemtype == Some("Ticket") {
            return match ticket_id(event.get("items_id")) {
                Some(id) => {
                    tracing::info!(ticket_id = id, "Ticket event accepted");
                    json!({ "message": format!("Processing ticket {}", id) })
                }
                None => json!({ "error": "items_id is not an integer" }),
            };
        }
    }

    json!({ "message": "No relevant events found" })
}

fn ticket_id(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse the `{ms}` path segment, capped at [`MAX_DELAY_MS`].
pub fn parse_delay(raw: &str) -> Option<Duration> {
    raw.parse::<u64>()
        .ok()
        .map(|ms| Duration::from_millis(ms.min(MAX_DELAY_MS)))
}

/// The sync flavour: same routes, blocking on the worker's thread pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct DemoBlocking;

impl BlockingHandler for DemoBlocking {
    fn call(&self, req: Request<Bytes>) -> Result<Response<Bytes>, HandlerError> {
        let path = req.uri().path();
        match (req.method(), path) {
            (&Method::GET, "/") => text(StatusCode::OK, "ok".into()),
            (&Method::GET, "/health") => json_response(&health()),
            (&Method::POST, "/webhook") => json_response(&webhook_reply(req.body())),
            (&Method::GET, "/fail") => Err(HandlerError::failed("requested failure")),
            (&Method::GET, p) if p.starts_with("/delay/") => match parse_delay(&p["/delay/".len()..]) {
                Some(delay) => {
                    std::thread::sleep(delay);
                    text(StatusCode::OK, format!("delayed {}ms", delay.as_millis()))
                }
                None => text(StatusCode::BAD_REQUEST, "invalid delay".into()),
            },
            _ => text(StatusCode::NOT_FOUND, String::new()),
        }
    }
}

fn text(status: StatusCode, body: String) -> Result<Response<Bytes>, HandlerError> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Bytes::from(body))
        .map_err(|e| HandlerError::failed(e.to_string()))
}

fn json_response(value: &Value) -> Result<Response<Bytes>, HandlerError> {
    let body = serde_json::to_vec(value).map_err(|e| HandlerError::failed(e.to_string()))?;
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Bytes::from(body))
        .map_err(|e| HandlerError::failed(e.to_string()))
}
