//! The shared listening endpoint and the per-worker bounded listener.
//!
//! # Responsibilities
//! - Bind the single listening socket once, in the supervisor
//! - Hand the socket to workers across `exec` (inherited file descriptor)
//! - Accept incoming TCP connections inside a worker
//! - Enforce max_connections limit via semaphore
//!
//! # Design Decisions
//! - The kernel distributes connections among workers blocked in `accept`
//! - The endpoint is never rebound; reloads reuse the same descriptor
//! - Workers find the descriptor through `PREFORK_LISTEN_FD`

use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{AcquireError, Semaphore};

use crate::config::ListenerConfig;

/// Environment variable carrying the inherited listening descriptor.
pub const LISTEN_FD_ENV: &str = "PREFORK_LISTEN_FD";

/// The endpoint could not be bound.
#[derive(Debug, Error)]
#[error("failed to bind {address}: {source}")]
pub struct BindError {
    pub address: String,
    #[source]
    pub source: std::io::Error,
}

/// Error type for worker-side listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The inherited descriptor is missing or unusable.
    #[error("no usable listening socket inherited: {0}")]
    Inherit(String),
    /// Socket operation failed.
    #[error("listener I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The connection limiter was closed.
    #[error("connection limiter closed")]
    Closed(#[from] AcquireError),
}

/// The one bound, listening socket of a supervisor lifetime.
///
/// Held as a std listener so it is not registered with any reactor; workers
/// register their inherited copies with their own runtimes.
#[derive(Debug)]
pub struct ListeningEndpoint {
    inner: std::net::TcpListener,
    local_addr: SocketAddr,
}

impl ListeningEndpoint {
    /// Bind and listen on the configured address.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(config: &ListenerConfig) -> Result<Self, BindError> {
        let address = config.bind_address.clone();
        let err = |source| BindError {
            address: address.clone(),
            source,
        };

        let addr = address
            .to_socket_addrs()
            .map_err(err)?
            .next()
            .ok_or_else(|| {
                err(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "address resolved to nothing",
                ))
            })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(err)?;
        socket.set_reuseaddr(true).map_err(err)?;
        socket.bind(addr).map_err(err)?;
        let listener = socket.listen(config.backlog).map_err(err)?;

        let inner = listener.into_std().map_err(err)?;
        let local_addr = inner.local_addr().map_err(err)?;

        tracing::info!(
            address = %local_addr,
            backlog = config.backlog,
            "Listener bound"
        );

        Ok(Self { inner, local_addr })
    }

    /// The address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Raw descriptor handed to workers.
    pub fn raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

/// Recover the listening socket passed down by the supervisor.
///
/// Must be called from within a Tokio runtime.
pub fn inherit_listener() -> Result<TcpListener, ListenerError> {
    let raw = std::env::var(LISTEN_FD_ENV)
        .map_err(|_| ListenerError::Inherit(format!("{} is not set", LISTEN_FD_ENV)))?;
    let fd: RawFd = raw
        .parse()
        .map_err(|_| ListenerError::Inherit(format!("{}={} is not a descriptor", LISTEN_FD_ENV, raw)))?;

    // SAFETY: the supervisor passes an open listening socket under this number
    // and nothing else in this process owns it.
    let std = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    std.local_addr()
        .map_err(|e| ListenerError::Inherit(format!("fd {} is not a socket: {}", fd, e)))?;
    std.set_nonblocking(true)?;

    Ok(TcpListener::from_std(std)?)
}

/// A bounded TCP listener that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// the worker stops accepting and leaves connections in the kernel backlog,
/// where a less loaded worker can pick them up.
pub struct Listener {
    inner: TcpListener,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    pub fn new(inner: TcpListener, max_connections: usize) -> Self {
        Self {
            inner,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        }
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// Returns the stream and a permit that must be held for the connection's lifetime.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        // Acquire permit first (backpressure)
        let permit = self.connection_limit.clone().acquire_owned().await?;

        let (stream, addr) = self.inner.accept().await?;

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(bind: &str) -> ListenerConfig {
        ListenerConfig {
            bind_address: bind.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn bind_resolves_ephemeral_port() {
        let endpoint = ListeningEndpoint::bind(&config("127.0.0.1:0")).unwrap();
        assert_ne!(endpoint.local_addr().port(), 0);
        assert!(endpoint.raw_fd() >= 0);
    }

    #[tokio::test]
    async fn second_bind_fails_while_first_is_held() {
        let first = ListeningEndpoint::bind(&config("127.0.0.1:0")).unwrap();
        let taken = first.local_addr().to_string();

        let err = ListeningEndpoint::bind(&config(&taken)).unwrap_err();
        assert_eq!(err.address, taken);
        assert_eq!(err.source.kind(), std::io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn accept_holds_a_connection_permit() {
        let listener = Listener::new(TcpListener::bind("127.0.0.1:0").await.unwrap(), 1);
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (_stream, _peer, permit) = listener.accept().await.unwrap();
        assert_eq!(listener.available_permits(), 0);
        drop(permit);
        assert_eq!(listener.available_permits(), 1);
        client.await.unwrap().unwrap();
    }
}
