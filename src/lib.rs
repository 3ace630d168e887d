//! Pre-forking HTTP application server library

pub mod admin;
pub mod app;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod supervisor;
pub mod worker;

pub use config::schema::ServerConfig;
pub use error::ServerError;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use supervisor::{ShutdownMode, Supervisor, SupervisorHandle};
