//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection (accepted by a worker)
//!     → server.rs (hyper http1, keep-alive, pipelining, drain)
//!     → request.rs (request ID, bounded body)
//!     → app::Dispatcher (handler under the execution model)
//!     → response.rs (request ID echo, error responses)
//!     → Send to client
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{RequestId, X_REQUEST_ID};
pub use server::{HttpServer, HttpSettings};
