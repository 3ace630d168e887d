//! Request preparation.
//!
//! # Responsibilities
//! - Assign a request ID (UUID v4) when the client did not send one
//! - Buffer the body under the configured size limit
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing
//! - Declared `Content-Length` over the limit is rejected before reading

use axum::http::header::{HeaderName, HeaderValue, CONTENT_LENGTH};
use axum::http::Request;
use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;
use thiserror::Error;
use uuid::Uuid;

/// Header carrying the request ID.
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// A request ID, taken from the client or freshly generated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Return the request's ID, inserting a generated one if it has none.
pub fn ensure_request_id<B>(req: &mut Request<B>) -> RequestId {
    if let Some(existing) = req
        .headers()
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return RequestId(existing.to_string());
    }

    let id = RequestId::generate();
    if let Ok(value) = HeaderValue::from_str(id.as_str()) {
        req.headers_mut().insert(X_REQUEST_ID, value);
    }
    id
}

/// The request body could not be buffered.
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("failed to read request body: {0}")]
    Read(String),
}

/// Declared body length, if any.
pub fn content_length<B>(req: &Request<B>) -> Option<u64> {
    req.headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Buffer a body, failing once it grows past `limit` bytes.
pub async fn collect_body<B>(body: B, limit: usize) -> Result<Bytes, BodyError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(BodyError::TooLarge { limit }),
        Err(e) => Err(BodyError::Read(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;

    #[test]
    fn keeps_client_request_id() {
        let mut req = Request::builder()
            .header("x-request-id", "abc-123")
            .body(())
            .unwrap();
        assert_eq!(ensure_request_id(&mut req).as_str(), "abc-123");
    }

    #[test]
    fn generates_missing_request_id() {
        let mut req = Request::builder().body(()).unwrap();
        let id = ensure_request_id(&mut req);
        assert_eq!(id.as_str().len(), 36);
        assert_eq!(req.headers().get(&X_REQUEST_ID).unwrap(), id.as_str());
    }

    #[tokio::test]
    async fn body_within_limit() {
        let body = Full::new(Bytes::from_static(b"hello"));
        assert_eq!(collect_body(body, 5).await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn body_over_limit() {
        let body = Full::new(Bytes::from_static(b"hello world"));
        assert!(matches!(
            collect_body(body, 5).await,
            Err(BodyError::TooLarge { limit: 5 })
        ));
    }

    #[test]
    fn reads_content_length() {
        let req = Request::builder().header("content-length", "42").body(()).unwrap();
        assert_eq!(content_length(&req), Some(42));
    }
}
