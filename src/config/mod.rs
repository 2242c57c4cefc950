//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → credential table swapped atomically
//! ```
//!
//! # Design Decisions
//! - Only the credential table is hot-swapped; other sections need a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AuthConfig, CredentialConfig, ListenerConfig, LogFormat, ObservabilityConfig, ServerConfig,
    WebSocketConfig,
};
pub use validation::{validate_config, ValidationError};
pub use watcher::ConfigWatcher;
