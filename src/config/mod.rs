//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML) + PREFORK_* env + CLI flags
//!     → loader.rs (parse, deserialize, layer overrides)
//!     → validation.rs (semantic checks, every error collected)
//!     → ServerConfig (validated, immutable)
//!     → owned by the supervisor, projected into WorkerSettings per worker
//!
//! On file change:
//!     watcher.rs detects change in reload.watch_paths
//!     → debounced
//!     → supervisor rolling reload
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; a reload restarts workers, not config
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load, load_config, ConfigError, ConfigOverrides};
pub use schema::{ExecutionModel, ListenerConfig, PartialStartupPolicy, ServerConfig};
pub use validation::{validate_config, ValidationError};
