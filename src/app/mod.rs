//! Application handler boundary.
//!
//! # Data Flow
//! ```text
//! http/server.rs (buffered Request<Bytes>)
//!     → dispatch.rs (execution model, timeout, panic isolation)
//!     → Handler (async, on the worker event loop)
//!       or BlockingHandler (sync, on the bounded blocking pool)
//!     → Response<Bytes> or HandlerError
//! ```
//!
//! # Design Decisions
//! - The server never looks inside the application; it only sees these traits
//! - Any `axum::Router` is an async handler through [`RouterHandler`]
//! - Handler failures are values; the dispatcher turns panics into values too

pub mod demo;
pub mod dispatch;

use std::future::Future;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tower::ServiceExt;

pub use dispatch::Dispatcher;

use crate::config::ExecutionModel;

/// Largest response body accepted from a wrapped router.
const ROUTER_BODY_LIMIT: usize = 64 * 1024 * 1024;

/// A failed handler invocation.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler reported an error.
    #[error("handler failed: {0}")]
    Failed(String),

    /// The handler panicked; the worker survives.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The handler exceeded the request timeout.
    #[error("handler timed out")]
    TimedOut,

    /// The blocking pool is gone (worker shutting down).
    #[error("handler pool unavailable")]
    Unavailable,
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }
}

/// An async application handler, run cooperatively on the worker's event loop.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, req: Request<Bytes>) -> BoxFuture<'static, Result<Response<Bytes>, HandlerError>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request<Bytes>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Bytes>, HandlerError>> + Send + 'static,
{
    fn call(&self, req: Request<Bytes>) -> BoxFuture<'static, Result<Response<Bytes>, HandlerError>> {
        Box::pin((self)(req))
    }
}

/// A blocking application handler, run on the worker's bounded thread pool.
pub trait BlockingHandler: Send + Sync + 'static {
    fn call(&self, req: Request<Bytes>) -> Result<Response<Bytes>, HandlerError>;
}

/// The application a worker serves, tagged with its execution model.
#[derive(Clone)]
pub enum Application {
    Async(Arc<dyn Handler>),
    Blocking(Arc<dyn BlockingHandler>),
}

impl Application {
    pub fn from_async(handler: impl Handler) -> Self {
        Application::Async(Arc::new(handler))
    }

    pub fn from_blocking(handler: impl BlockingHandler) -> Self {
        Application::Blocking(Arc::new(handler))
    }

    /// Serve an axum router as an async handler.
    pub fn from_router(router: axum::Router) -> Self {
        Application::Async(Arc::new(RouterHandler::new(router)))
    }

    pub fn execution_model(&self) -> ExecutionModel {
        match self {
            Application::Async(_) => ExecutionModel::AsyncEventLoop,
            Application::Blocking(_) => ExecutionModel::Sync,
        }
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Application")
            .field(&self.execution_model())
            .finish()
    }
}

/// Adapts an `axum::Router` to the [`Handler`] trait.
#[derive(Clone)]
pub struct RouterHandler {
    router: axum::Router,
}

impl RouterHandler {
    pub fn new(router: axum::Router) -> Self {
        Self { router }
    }
}

impl Handler for RouterHandler {
    fn call(&self, req: Request<Bytes>) -> BoxFuture<'static, Result<Response<Bytes>, HandlerError>> {
        let router = self.router.clone();
        Box::pin(async move {
            let req = req.map(Body::from);
            let response = match router.oneshot(req).await {
                Ok(response) => response,
                Err(never) => match never {},
            };
            let (parts, body) = response.into_parts();
            let body = axum::body::to_bytes(body, ROUTER_BODY_LIMIT)
                .await
                .map_err(|e| HandlerError::failed(format!("reading router response body: {}", e)))?;
            Ok(Response::from_parts(parts, body))
        })
    }
}
