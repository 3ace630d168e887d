//! Startup, reload and shutdown behaviour of the whole pool.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use prefork_server::config::{ConfigError, ValidationError};
use prefork_server::supervisor::table::WorkerState;
use prefork_server::{ServerError, ShutdownMode, Supervisor};

mod common;
use common::Pool;

#[tokio::test]
async fn test_zero_workers_is_config_error() {
    let config = common::test_config(0);
    let err = Supervisor::start(config, common::worker_command())
        .await
        .err()
        .expect("zero workers must be rejected");
    match err {
        ServerError::Config(ConfigError::Validation(errors)) => {
            assert_eq!(errors, vec![ValidationError::NoWorkers]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_address_in_use_is_bind_error() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut config = common::test_config(2);
    config.listener.bind_address = taken.local_addr().unwrap().to_string();

    let err = Supervisor::start(config, common::worker_command())
        .await
        .err()
        .expect("bind must fail");
    assert!(matches!(err, ServerError::Bind(_)), "got {err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_brings_up_every_worker() {
    let pool = Pool::start(common::test_config(3)).await;
    let snapshot = pool.handle.snapshot();
    assert_eq!(snapshot.expected, 3);
    assert_eq!(snapshot.ready, 3);
    assert_eq!(snapshot.workers.len(), 3);

    let res = common::client().get(pool.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), 200);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body, serde_json::json!({ "status": "OK" }));

    pool.stop(ShutdownMode::Graceful).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rolling_reload_keeps_serving() {
    const WORKERS: usize = 3;
    let pool = Pool::start(common::test_config(WORKERS)).await;
    let old = pool.ready_pids();

    // Track the smallest ready count seen while the reload runs.
    let mut snapshots = pool.handle.subscribe();
    let watcher = tokio::spawn(async move {
        let mut min_ready = usize::MAX;
        while snapshots.changed().await.is_ok() {
            let s = snapshots.borrow_and_update().clone();
            if s.reloading {
                min_ready = min_ready.min(s.ready);
            } else if min_ready != usize::MAX {
                break;
            }
        }
        min_ready
    });

    let stop = Arc::new(AtomicBool::new(false));
    let served = Arc::new(AtomicU64::new(0));
    let traffic = {
        let stop = stop.clone();
        let served = served.clone();
        let url = pool.url("/");
        tokio::spawn(async move {
            let client = common::client();
            while !stop.load(Ordering::Relaxed) {
                let res = client.get(&url).send().await.expect("request failed during reload");
                assert_eq!(res.text().await.unwrap(), "ok");
                served.fetch_add(1, Ordering::Relaxed);
            }
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    pool.handle.reload().unwrap();

    let after = pool
        .wait_until(|s| {
            let pids = s.pids_in(WorkerState::Ready);
            !s.reloading && pids.len() == WORKERS && pids.iter().all(|p| !old.contains(p))
        })
        .await;
    assert_eq!(after.crash_looped_slots(), 0);

    let min_ready = tokio::time::timeout(Duration::from_secs(10), watcher)
        .await
        .expect("never observed the reload")
        .unwrap();
    assert!(min_ready >= WORKERS - 1, "only {min_ready} workers ready during reload");

    stop.store(true, Ordering::Relaxed);
    traffic.await.unwrap();
    assert!(served.load(Ordering::Relaxed) > 0);

    pool.stop(ShutdownMode::Graceful).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_graceful_shutdown_finishes_in_flight() {
    let pool = Pool::start(common::test_config(2)).await;
    let addr = pool.addr;

    let in_flight = {
        let url = pool.url("/delay/1000");
        tokio::spawn(async move { common::client().get(url).send().await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    pool.stop(ShutdownMode::Graceful).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    let res = in_flight.await.unwrap().expect("in-flight request was dropped");
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "delayed 1000ms");

    // Nobody holds the socket any more.
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_force_closes_after_grace() {
    let mut config = common::test_config(1);
    config.shutdown.graceful_timeout_secs = 1;
    config.reload.drain_timeout_secs = 1;
    let pool = Pool::start(config).await;

    let stuck = {
        let url = pool.url("/delay/10000");
        tokio::spawn(async move { common::client().get(url).send().await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    pool.stop(ShutdownMode::Graceful).await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "stopped after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "stopped after {elapsed:?}");

    assert!(stuck.await.unwrap().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_immediate_shutdown() {
    let pool = Pool::start(common::test_config(2)).await;
    let started = Instant::now();
    pool.stop(ShutdownMode::Immediate).await;
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_max_requests_recycles_worker() {
    let mut config = common::test_config(1);
    config.workers.max_requests = 5;
    let pool = Pool::start(config).await;
    let first = pool.ready_pids();

    let client = common::client();
    for _ in 0..5 {
        let res = client.get(pool.url("/")).send().await.unwrap();
        assert_eq!(res.status(), 200);
    }

    let snapshot = pool
        .wait_until(|s| {
            let pids = s.pids_in(WorkerState::Ready);
            pids.len() == 1 && pids != first
        })
        .await;
    // Retiring is not a crash.
    assert_eq!(snapshot.slots[0].consecutive_failures, 0);
    assert_eq!(snapshot.slots[0].restarts, 0);

    let res = client.get(pool.url("/")).send().await.unwrap();
    assert_eq!(res.text().await.unwrap(), "ok");

    pool.stop(ShutdownMode::Graceful).await;
}

fn binary() -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(env!("CARGO_BIN_EXE_prefork-server"));
    cmd.env_remove("PREFORK_CONFIG")
        .env("PREFORK_LOG_LEVEL", "warn")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .kill_on_drop(true);
    cmd
}

#[tokio::test]
async fn test_binary_exit_codes() {
    let status = binary().args(["--workers", "0"]).status().await.unwrap();
    assert_eq!(status.code(), Some(2));

    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let status = binary()
        .args(["--workers", "1", "--bind", &taken.local_addr().unwrap().to_string()])
        .status()
        .await
        .unwrap();
    assert_eq!(status.code(), Some(3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_binary_serves_and_stops_on_sigterm() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let bind = format!("127.0.0.1:{port}");

    let mut child = binary()
        .args(["--workers", "2", "--bind", &bind, "--graceful-timeout", "5"])
        .spawn()
        .unwrap();

    let client = common::client();
    let url = format!("http://{bind}/");
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        if let Ok(res) = client.get(&url).send().await {
            assert_eq!(res.text().await.unwrap(), "ok");
            break;
        }
        assert!(Instant::now() < deadline, "server never came up");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let pid = child.id().unwrap();
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).unwrap();
    let status = tokio::time::timeout(Duration::from_secs(15), child.wait())
        .await
        .expect("server ignored SIGTERM")
        .unwrap();
    assert_eq!(status.code(), Some(0));
}
