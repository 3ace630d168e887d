//! A single worker served in-process: HTTP behaviour without the supervisor.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::http::{Request, Response, StatusCode};
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use prefork_server::app::{Application, BlockingHandler, HandlerError};
use prefork_server::config::{ExecutionModel, ServerConfig};
use prefork_server::lifecycle::{DrainReason, Shutdown};
use prefork_server::worker::{run_worker, WorkerError, WorkerSettings};

mod common;

struct Worker {
    addr: SocketAddr,
    shutdown: Shutdown,
    task: JoinHandle<Result<u64, WorkerError>>,
}

impl Worker {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn finish(self) -> u64 {
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("worker never exited")
            .unwrap()
            .unwrap()
    }
}

async fn start_worker(config: &ServerConfig, max_requests: u64, app: Application) -> Worker {
    let settings = WorkerSettings::from_config(config, 1, 0, max_requests);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            run_worker(&settings, listener, app, shutdown, tokio::io::sink()).await
        })
    };
    Worker {
        addr,
        shutdown,
        task,
    }
}

/// Echoes the path; `/slow` takes 200ms, `/error` fails.
fn echo_app() -> Application {
    Application::from_async(|req: Request<Bytes>| async move {
        let path = req.uri().path().to_string();
        match path.as_str() {
            "/error" => Err(HandlerError::failed("database unavailable")),
            "/slow" => {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(Response::new(Bytes::from(path)))
            }
            _ => Ok(Response::new(Bytes::from(path))),
        }
    })
}

#[tokio::test]
async fn test_handler_error_is_500_with_connection_close() {
    let worker = start_worker(&ServerConfig::default(), 0, echo_app()).await;
    let client = common::client();

    let res = client.get(worker.url("/error")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(res.headers()["connection"], "close");

    let res = client.get(worker.url("/after")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "/after");

    worker.shutdown.trigger(DrainReason::Signal);
    assert_eq!(worker.finish().await, 2);
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let worker = start_worker(&ServerConfig::default(), 0, echo_app()).await;
    let client = common::client();

    let res = client
        .get(worker.url("/"))
        .header("x-request-id", "abc-123")
        .send()
        .await
        .unwrap();
    assert_eq!(res.headers()["x-request-id"], "abc-123");

    let res = client.get(worker.url("/")).send().await.unwrap();
    let generated = res.headers()["x-request-id"].to_str().unwrap().to_string();
    assert_eq!(generated.len(), 36);

    worker.shutdown.trigger(DrainReason::Signal);
    worker.finish().await;
}

#[tokio::test]
async fn test_pipelined_responses_keep_request_order() {
    let worker = start_worker(&ServerConfig::default(), 0, echo_app()).await;

    let pipelined = b"GET /slow HTTP/1.1\r\nHost: test\r\n\r\n\
                      GET /fast HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n";
    let response = common::raw_exchange(worker.addr, pipelined).await;

    let slow = response.find("/slow").expect("missing first response");
    let fast = response.find("/fast").expect("missing second response");
    assert!(slow < fast, "responses out of order: {response}");
    assert_eq!(response.matches("HTTP/1.1 200").count(), 2);

    worker.shutdown.trigger(DrainReason::Signal);
    worker.finish().await;
}

#[tokio::test]
async fn test_drain_finishes_in_flight_then_stops_accepting() {
    let worker = start_worker(&ServerConfig::default(), 0, echo_app()).await;
    let addr = worker.addr;

    let in_flight = {
        let url = worker.url("/slow");
        tokio::spawn(async move { common::client().get(url).send().await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    worker.shutdown.trigger(DrainReason::Signal);
    let res = in_flight.await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "/slow");

    assert_eq!(worker.finish().await, 1);
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_drain_serves_request_sent_after_drain_on_accepted_connection() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let worker = start_worker(&ServerConfig::default(), 0, echo_app()).await;
    let mut stream = tokio::net::TcpStream::connect(worker.addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    worker.shutdown.trigger(DrainReason::Signal);
    tokio::time::sleep(Duration::from_millis(50)).await;
    stream
        .write_all(b"GET /late HTTP/1.1\r\nHost: test\r\n\r\n")
        .await
        .unwrap();

    let mut buf = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .expect("connection not closed after its response")
        .unwrap();
    let response = String::from_utf8_lossy(&buf);
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response:?}");
    assert!(response.ends_with("/late"));

    assert_eq!(worker.finish().await, 1);
}

#[tokio::test]
async fn test_drain_closes_idle_connection_after_keep_alive() {
    use tokio::io::AsyncReadExt;

    let mut config = ServerConfig::default();
    config.workers.keep_alive_secs = 1;
    let worker = start_worker(&config, 0, echo_app()).await;
    let mut stream = tokio::net::TcpStream::connect(worker.addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    worker.shutdown.trigger(DrainReason::Signal);
    let mut buf = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .expect("idle connection never closed")
        .unwrap();
    // Not closed the moment the drain began.
    assert!(started.elapsed() >= Duration::from_millis(500));

    assert_eq!(worker.finish().await, 0);
}

#[tokio::test]
async fn test_drain_timeout_bounds_stuck_requests() {
    let mut config = ServerConfig::default();
    config.reload.drain_timeout_secs = 1;
    config.shutdown.graceful_timeout_secs = 1;
    let app = Application::from_async(|_req: Request<Bytes>| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<_, HandlerError>(Response::new(Bytes::new()))
    });
    let worker = start_worker(&config, 0, app).await;

    let stuck = {
        let url = worker.url("/");
        tokio::spawn(async move { common::client().get(url).send().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    worker.shutdown.trigger(DrainReason::Signal);
    worker.finish().await;
    assert!(started.elapsed() < Duration::from_secs(3));
    stuck.abort();
}

#[tokio::test]
async fn test_request_timeout_is_504() {
    let mut config = ServerConfig::default();
    config.workers.request_timeout_secs = 1;
    let app = Application::from_async(|_req: Request<Bytes>| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok::<_, HandlerError>(Response::new(Bytes::new()))
    });
    let worker = start_worker(&config, 0, app).await;

    let res = common::client().get(worker.url("/")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(res.headers()["connection"], "close");

    worker.shutdown.trigger(DrainReason::Signal);
    worker.finish().await;
}

struct Sleepy;

impl BlockingHandler for Sleepy {
    fn call(&self, _req: Request<Bytes>) -> Result<Response<Bytes>, HandlerError> {
        std::thread::sleep(Duration::from_millis(300));
        Ok(Response::new(Bytes::from_static(b"done")))
    }
}

#[tokio::test]
async fn test_blocking_handlers_do_not_stall_the_event_loop() {
    let mut config = ServerConfig::default();
    config.workers.execution_model = ExecutionModel::Sync;
    config.workers.threads = 4;
    let worker = start_worker(&config, 0, Application::from_blocking(Sleepy)).await;

    let client = common::client();
    let started = Instant::now();
    let requests: Vec<_> = (0..4)
        .map(|_| {
            let client = client.clone();
            let url = worker.url("/");
            tokio::spawn(async move { client.get(url).send().await.unwrap().text().await.unwrap() })
        })
        .collect();
    for request in requests {
        assert_eq!(request.await.unwrap(), "done");
    }
    // Four 300ms handlers on four threads run side by side.
    assert!(started.elapsed() < Duration::from_millis(1100));

    worker.shutdown.trigger(DrainReason::Signal);
    assert_eq!(worker.finish().await, 4);
}

#[tokio::test]
async fn test_max_requests_retires_worker() {
    let worker = start_worker(&ServerConfig::default(), 3, echo_app()).await;
    let client = common::client();

    for _ in 0..3 {
        let res = client.get(worker.url("/")).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    // No trigger from outside: the quota drains the worker.
    assert_eq!(worker.shutdown.reason(), Some(DrainReason::MaxRequests));
    assert_eq!(worker.finish().await, 3);
}

#[tokio::test]
async fn test_demo_webhook_over_http() {
    let app = prefork_server::app::demo::application(ExecutionModel::AsyncEventLoop);
    let worker = start_worker(&ServerConfig::default(), 0, app).await;

    let payload = serde_json::json!([
        { "event": "delete", "itemtype": "Ticket", "items_id": 1 },
        { "event": "update", "itemtype": "Ticket", "items_id": "42" }
    ]);
    let res = common::client()
        .post(worker.url("/webhook"))
        .json(&payload)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["message"], "Processing ticket 42");

    worker.shutdown.trigger(DrainReason::Signal);
    worker.finish().await;
}
