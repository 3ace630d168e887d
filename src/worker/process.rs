//! Worker process main loop.
//!
//! This module runs when the binary is invoked with the hidden `worker`
//! subcommand. It recovers the inherited listening socket, serves the
//! application and reports status to the supervisor on stdout.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::app::{Application, Dispatcher};
use crate::config::ExecutionModel;
use crate::http::HttpServer;
use crate::lifecycle::shutdown::{DrainReason, Shutdown};
use crate::lifecycle::signals;
use crate::net::{inherit_listener, Listener};
use crate::observability::logging;
use crate::worker::protocol::WorkerMessage;
use crate::worker::settings::WorkerSettings;
use crate::worker::WorkerError;

/// Serve `app` on `listener` until drained, reporting status to `status`.
///
/// Returns the number of requests taken. Runs in any Tokio runtime, which
/// makes it usable in-process as well as in a worker process.
pub async fn run_worker<W>(
    settings: &WorkerSettings,
    listener: TcpListener,
    app: Application,
    shutdown: Shutdown,
    status: W,
) -> Result<u64, WorkerError>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let dispatcher = Dispatcher::new(app, settings.threads, settings.request_timeout());
    let server = HttpServer::new(dispatcher, shutdown.clone(), settings.http_settings());
    let listener = Listener::new(listener, settings.max_connections);

    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_status(rx, status, shutdown.clone()));

    let _ = tx.send(WorkerMessage::Ready);
    tracing::info!(execution_model = %settings.execution_model, "Worker ready");

    let heartbeat = {
        let tx = tx.clone();
        let tracker = server.tracker().clone();
        let mut ticker = tokio::time::interval(settings.heartbeat_interval());
        tokio::spawn(async move {
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let beat = WorkerMessage::Heartbeat {
                    in_flight: tracker.in_flight(),
                    requests: tracker.requests_total(),
                };
                if tx.send(beat).is_err() {
                    break;
                }
            }
        })
    };

    let notifier = {
        let tx = tx.clone();
        let mut drain = shutdown.subscribe();
        tokio::spawn(async move {
            let reason = drain.wait().await;
            let _ = tx.send(WorkerMessage::Draining { reason });
        })
    };

    let served = server.serve(listener).await;

    heartbeat.abort();
    // The drain has been triggered by now, so the notifier has finished or is about to.
    let _ = notifier.await;

    let requests = server.tracker().requests_total();
    let _ = tx.send(WorkerMessage::Exiting { requests });
    drop(tx);
    let _ = writer.await;

    served?;
    tracing::info!(requests, "Worker exiting");
    Ok(requests)
}

/// Forward status messages to the supervisor until the channel closes.
///
/// A failed write means the supervisor is gone; the worker drains and exits.
async fn write_status<W>(mut rx: mpsc::UnboundedReceiver<WorkerMessage>, mut status: W, shutdown: Shutdown)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let line = match message.to_line() {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode status message");
                continue;
            }
        };

        let written = async {
            status.write_all(line.as_bytes()).await?;
            status.flush().await
        }
        .await;

        if let Err(e) = written {
            if shutdown.trigger(DrainReason::Orphaned) {
                tracing::warn!(error = %e, "Status channel broken, supervisor gone; draining");
            }
            break;
        }
    }
}

/// Entry point of a worker process.
///
/// `make_app` builds the application for the configured execution model.
pub fn run_worker_process<F>(make_app: F) -> Result<(), WorkerError>
where
    F: FnOnce(ExecutionModel) -> Application,
{
    let settings = WorkerSettings::from_env()?;
    logging::init_logging(&settings.log_level, settings.log_format);

    // One event loop thread; the blocking pool is only used by sync handlers.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .max_blocking_threads(settings.threads.max(1))
        .thread_name(format!("worker-{}", settings.worker_id))
        .build()?;

    let span = tracing::info_span!("worker", worker_id = settings.worker_id, slot = settings.slot);

    runtime.block_on(
        async move {
            let listener = inherit_listener()?;
            let shutdown = Shutdown::new();
            tokio::spawn(signals::forward_worker_signals(shutdown.clone()));

            let app = make_app(settings.execution_model);
            run_worker(&settings, listener, app, shutdown, tokio::io::stdout()).await?;
            Ok::<(), WorkerError>(())
        }
        .instrument(span),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use axum::http::{Request, Response};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn reports_ready_draining_exiting() {
        let mut config = ServerConfig::default();
        config.workers.heartbeat_interval_ms = 20;
        let settings = WorkerSettings::from_config(&config, 1, 0, 0);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let app = Application::from_async(|_req: Request<Bytes>| async move {
            Ok::<_, crate::app::HandlerError>(Response::new(Bytes::from_static(b"ok")))
        });
        let shutdown = Shutdown::new();
        let (client, server) = tokio::io::duplex(4096);

        let worker = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { run_worker(&settings, listener, app, shutdown, server).await })
        };

        let mut lines = BufReader::new(client).lines();
        let first = lines.next_line().await.unwrap().unwrap();
        assert_eq!(WorkerMessage::from_line(&first).unwrap(), WorkerMessage::Ready);

        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown.trigger(DrainReason::Signal);

        let mut seen = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            seen.push(WorkerMessage::from_line(&line).unwrap());
        }
        assert_eq!(worker.await.unwrap().unwrap(), 0);

        assert!(seen.iter().any(|m| matches!(m, WorkerMessage::Heartbeat { .. })));
        let tail: Vec<_> = seen
            .iter()
            .filter(|m| !matches!(m, WorkerMessage::Heartbeat { .. }))
            .cloned()
            .collect();
        assert_eq!(
            tail,
            vec![
                WorkerMessage::Draining {
                    reason: DrainReason::Signal
                },
                WorkerMessage::Exiting { requests: 0 },
            ]
        );
    }

    #[tokio::test]
    async fn broken_status_channel_drains_worker() {
        let settings = WorkerSettings::from_config(&ServerConfig::default(), 2, 1, 0);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let app = Application::from_async(|_req: Request<Bytes>| async move {
            Ok::<_, crate::app::HandlerError>(Response::new(Bytes::new()))
        });
        let shutdown = Shutdown::new();

        let (client, server) = tokio::io::duplex(64);
        drop(client);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run_worker(&settings, listener, app, shutdown.clone(), server),
        )
        .await
        .expect("orphaned worker should exit");
        assert!(result.is_ok());
        assert_eq!(shutdown.reason(), Some(DrainReason::Orphaned));
    }
}
