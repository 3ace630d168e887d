//! Shared utilities for integration and load testing.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use prefork_server::config::ServerConfig;
use prefork_server::supervisor::spawn::WorkerCommand;
use prefork_server::supervisor::table::{PoolSnapshot, WorkerState};
use prefork_server::{ShutdownMode, Supervisor, SupervisorHandle};

/// The real worker: this crate's binary in worker mode.
pub fn worker_command() -> WorkerCommand {
    WorkerCommand::new(env!("CARGO_BIN_EXE_prefork-server")).arg("worker")
}

/// A pool on an ephemeral port with test-friendly timeouts.
pub fn test_config(workers: usize) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.workers.count = workers;
    config.workers.heartbeat_interval_ms = 200;
    config.workers.timeout_secs = 10;
    config.startup.timeout_secs = 10;
    config.shutdown.graceful_timeout_secs = 5;
    config.reload.drain_timeout_secs = 5;
    config.restart.base_delay_ms = 50;
    config.restart.max_delay_ms = 500;
    config.observability.log_level = "warn".into();
    config
}

pub struct Pool {
    pub handle: SupervisorHandle,
    pub addr: SocketAddr,
    pub monitor: JoinHandle<()>,
}

impl Pool {
    pub async fn start(config: ServerConfig) -> Pool {
        Pool::start_with(config, worker_command()).await
    }

    pub async fn start_with(config: ServerConfig, command: WorkerCommand) -> Pool {
        let supervisor = Supervisor::start(config, command)
            .await
            .expect("pool failed to start");
        let handle = supervisor.handle();
        let addr = supervisor.local_addr();
        let monitor = tokio::spawn(supervisor.monitor());
        Pool {
            handle,
            addr,
            monitor,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ready_pids(&self) -> Vec<u32> {
        self.handle.snapshot().pids_in(WorkerState::Ready)
    }

    pub async fn wait_until<F>(&self, predicate: F) -> PoolSnapshot
    where
        F: FnMut(&PoolSnapshot) -> bool,
    {
        self.handle
            .wait_until(Duration::from_secs(15), predicate)
            .await
            .expect("pool never reached the expected state")
    }

    /// Shut down and wait for the control loop to finish.
    pub async fn stop(self, mode: ShutdownMode) {
        self.handle.shutdown(mode).unwrap();
        tokio::time::timeout(Duration::from_secs(15), self.monitor)
            .await
            .expect("shutdown timed out")
            .unwrap();
    }
}

/// A client that opens a fresh connection per request, so the kernel
/// spreads requests over workers.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// Write raw bytes and read until the server closes the connection.
pub async fn raw_exchange(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut buf = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut buf))
        .await
        .expect("server kept the connection open")
        .unwrap();
    String::from_utf8_lossy(&buf).into_owned()
}
