//! Response finalization and error responses.
//!
//! # Design Decisions
//! - Every response echoes the request ID
//! - Error responses carry `Connection: close`; the connection is not reused
//!   after a failure, the worker is

use axum::http::header::{HeaderValue, CONNECTION, CONTENT_TYPE};
use axum::http::{Response, StatusCode};
use bytes::Bytes;
use http_body_util::Full;

use crate::app::HandlerError;
use crate::http::request::{RequestId, X_REQUEST_ID};

/// Map a handler failure to the status sent to the client.
pub fn handler_error_status(err: &HandlerError) -> StatusCode {
    match err {
        HandlerError::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        HandlerError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        HandlerError::Failed(_) | HandlerError::Panicked(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// A small plain-text error response that closes the connection.
pub fn error_response(status: StatusCode, request_id: &RequestId) -> Response<Full<Bytes>> {
    let reason = status.canonical_reason().unwrap_or("Error");
    let mut response = Response::new(Full::new(Bytes::from(format!("{} {}\n", status.as_u16(), reason))));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    set_request_id(headers, request_id);

    response
}

/// Turn a handler response into the wire response.
pub fn finalize(response: Response<Bytes>, request_id: &RequestId) -> Response<Full<Bytes>> {
    let (mut parts, body) = response.into_parts();
    set_request_id(&mut parts.headers, request_id);
    Response::from_parts(parts, Full::new(body))
}

fn set_request_id(headers: &mut axum::http::HeaderMap, request_id: &RequestId) {
    if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
        headers.insert(X_REQUEST_ID, value);
    }
}
