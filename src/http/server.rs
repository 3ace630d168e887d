//! Worker-side HTTP/1.1 server.
//!
//! # Responsibilities
//! - Accept connections on the inherited listener (bounded per worker)
//! - Serve HTTP/1.1 with keep-alive and pipelining
//! - Buffer request bodies, dispatch to the application, write responses
//! - Drain: stop accepting, let accepted connections finish, then close them
//!
//! # Design Decisions
//! - hyper's http1 connection handles one request at a time per connection,
//!   so pipelined responses go out in request order
//! - Errors from one connection never reach the accept loop
//! - On drain, an accepted connection keeps up to `keep_alive` to start its
//!   next request; it is closed once that response is written
//! - The drain is bounded locally; the supervisor holds the hard deadline

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{Request, Response, StatusCode};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::sync::Notify;

use crate::app::Dispatcher;
use crate::http::request::{collect_body, content_length, ensure_request_id, BodyError};
use crate::http::response::{error_response, finalize, handler_error_status};
use crate::lifecycle::shutdown::{DrainReason, Shutdown};
use crate::net::connection::ConnectionTracker;
use crate::net::Listener;

/// Tunables for one worker's HTTP server.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    /// Idle bound for keep-alive connections waiting on the next request.
    pub keep_alive: Duration,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
    /// Local bound on the drain.
    pub drain_timeout: Duration,
    /// Requests after which the worker retires itself (0 disables).
    pub max_requests: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(5),
            max_body_bytes: 2 * 1024 * 1024,
            drain_timeout: Duration::from_secs(30),
            max_requests: 0,
        }
    }
}

/// HTTP server for one worker.
#[derive(Clone)]
pub struct HttpServer {
    dispatcher: Dispatcher,
    tracker: ConnectionTracker,
    shutdown: Shutdown,
    settings: HttpSettings,
}

impl HttpServer {
    pub fn new(dispatcher: Dispatcher, shutdown: Shutdown, settings: HttpSettings) -> Self {
        Self {
            dispatcher,
            tracker: ConnectionTracker::new(),
            shutdown,
            settings,
        }
    }

    /// Counters shared with the heartbeat task.
    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Serve until a drain is triggered and the drain completes.
    pub async fn serve(&self, listener: Listener) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            max_connections = listener.max_connections(),
            "HTTP server starting"
        );

        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .keep_alive(true)
            .header_read_timeout(self.settings.keep_alive)
            .pipeline_flush(true);

        let mut drain = self.shutdown.subscribe();

        let reason = loop {
            tokio::select! {
                reason = drain.wait() => break reason,
                accepted = listener.accept() => {
                    let (stream, peer, permit) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            // EMFILE and friends; back off instead of spinning.
                            tracing::warn!(error = %e, "Accept failed");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            continue;
                        }
                    };

                    let guard = self.tracker.track();
                    let activity = Arc::new(ConnectionActivity::default());
                    let service = {
                        let server = self.clone();
                        let activity = Arc::clone(&activity);
                        service_fn(move |req: Request<Incoming>| {
                            let server = server.clone();
                            let activity = Arc::clone(&activity);
                            async move {
                                activity.begin();
                                let response = server.handle(req, peer).await;
                                activity.end();
                                Ok::<_, Infallible>(response)
                            }
                        })
                    };

                    let conn = builder.serve_connection(TokioIo::new(stream), service);
                    let mut conn_drain = self.shutdown.subscribe();
                    let linger = self.settings.keep_alive;
                    tokio::spawn(async move {
                        let mut conn = std::pin::pin!(conn);
                        let result = tokio::select! {
                            result = conn.as_mut() => result,
                            _ = conn_drain.wait() => {
                                match linger_after_drain(conn.as_mut(), &activity, linger).await {
                                    Some(result) => result,
                                    None => {
                                        conn.as_mut().graceful_shutdown();
                                        conn.await
                                    }
                                }
                            }
                        };
                        if let Err(e) = result {
                            tracing::debug!(connection_id = %guard.id(), peer_addr = %peer, error = %e, "Connection error");
                        }
                        drop(permit);
                        drop(guard);
                    });
                }
            }
        };

        // Stop accepting before waiting on connections.
        drop(listener);
        tracing::info!(
            reason = %reason,
            open_connections = self.tracker.active_count(),
            in_flight = self.tracker.in_flight(),
            "Draining"
        );

        match tokio::time::timeout(self.settings.drain_timeout, self.tracker.wait_idle()).await {
            Ok(()) => tracing::info!("All connections closed"),
            Err(_) => tracing::warn!(
                open_connections = self.tracker.active_count(),
                "Drain timed out with connections still open"
            ),
        }

        Ok(())
    }

    async fn handle(&self, mut req: Request<Incoming>, peer: SocketAddr) -> Response<Full<Bytes>> {
        let started = Instant::now();
        let request_id = ensure_request_id(&mut req);
        let (in_flight, ordinal) = self.tracker.begin_request();

        if self.settings.max_requests > 0
            && ordinal >= self.settings.max_requests
            && self.shutdown.trigger(DrainReason::MaxRequests)
        {
            tracing::info!(requests = ordinal, "Request quota reached, retiring worker");
        }

        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let declared_too_large = content_length(&req)
            .is_some_and(|len| len > self.settings.max_body_bytes as u64);

        let response = if declared_too_large {
            error_response(StatusCode::PAYLOAD_TOO_LARGE, &request_id)
        } else {
            let (parts, body) = req.into_parts();
            match collect_body(body, self.settings.max_body_bytes).await {
                Ok(body) => {
                    let req = Request::from_parts(parts, body);
                    match self.dispatcher.dispatch(req).await {
                        Ok(response) => finalize(response, &request_id),
                        Err(e) => {
                            tracing::error!(
                                request_id = %request_id,
                                method = %method,
                                path = %path,
                                error = %e,
                                "Handler failed"
                            );
                            error_response(handler_error_status(&e), &request_id)
                        }
                    }
                }
                Err(BodyError::TooLarge { .. }) => error_response(StatusCode::PAYLOAD_TOO_LARGE, &request_id),
                Err(e) => {
                    tracing::debug!(request_id = %request_id, error = %e, "Bad request body");
                    error_response(StatusCode::BAD_REQUEST, &request_id)
                }
            }
        };
        drop(in_flight);

        tracing::debug!(
            request_id = %request_id,
            peer_addr = %peer,
            method = %method,
            path = %path,
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request served"
        );

        response
    }
}

/// Per-connection request counts, so a draining connection knows whether a
/// request has started since the drain began.
#[derive(Debug, Default)]
struct ConnectionActivity {
    started: AtomicU64,
    finished: AtomicU64,
    changed: Notify,
}

impl ConnectionActivity {
    fn begin(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_one();
    }

    fn end(&self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    fn started(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }

    fn busy(&self) -> bool {
        self.started() > self.finished.load(Ordering::SeqCst)
    }
}

/// Keep serving a drained connection until it starts a request or `linger`
/// passes. Returns the connection's result if it ended on its own.
async fn linger_after_drain<F>(
    mut conn: std::pin::Pin<&mut F>,
    activity: &ConnectionActivity,
    linger: Duration,
) -> Option<F::Output>
where
    F: std::future::Future,
{
    let seen = activity.started();
    let window = tokio::time::sleep(linger);
    tokio::pin!(window);

    loop {
        if activity.busy() || activity.started() > seen {
            return None;
        }
        tokio::select! {
            result = conn.as_mut() => return Some(result),
            _ = &mut window => return None,
            _ = activity.changed.notified() => {}
        }
    }
}
