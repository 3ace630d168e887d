//! Handler invocation under the configured execution model.
//!
//! # Responsibilities
//! - Run async handlers on the event loop, blocking handlers on the pool
//! - Bound every invocation by the request timeout
//! - Turn handler panics into [`HandlerError::Panicked`]

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{Request, Response};
use bytes::Bytes;
use futures_util::FutureExt;
use tokio::sync::Semaphore;

use crate::app::{Application, HandlerError};

/// Invokes the application for one request at a time per call.
#[derive(Clone)]
pub struct Dispatcher {
    app: Application,
    blocking_slots: Arc<Semaphore>,
    request_timeout: Duration,
}

impl Dispatcher {
    /// `threads` bounds concurrent blocking invocations; it is ignored for async applications.
    pub fn new(app: Application, threads: usize, request_timeout: Duration) -> Self {
        Self {
            app,
            blocking_slots: Arc::new(Semaphore::new(threads.max(1))),
            request_timeout,
        }
    }

    /// Invoke the handler, bounded by the request timeout.
    pub async fn dispatch(&self, req: Request<Bytes>) -> Result<Response<Bytes>, HandlerError> {
        match tokio::time::timeout(self.request_timeout, self.invoke(req)).await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::TimedOut),
        }
    }

    async fn invoke(&self, req: Request<Bytes>) -> Result<Response<Bytes>, HandlerError> {
        match &self.app {
            Application::Async(handler) => {
                let handler = Arc::clone(handler);
                AssertUnwindSafe(async move { handler.call(req).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(payload))))
            }
            Application::Blocking(handler) => {
                let permit = Arc::clone(&self.blocking_slots)
                    .acquire_owned()
                    .await
                    .map_err(|_| HandlerError::Unavailable)?;
                let handler = Arc::clone(handler);

                let task = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    handler.call(req)
                });

                match task.await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => Err(HandlerError::Panicked(panic_message(e.into_panic()))),
                    Err(_) => Err(HandlerError::Unavailable),
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
