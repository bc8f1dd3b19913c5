//! Bootstrap configuration subsystem.
//!
//! # Data Flow
//! ```text
//! bootstrap file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ControlPlaneConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//!
//! seed file (TOML)
//!     → loader.rs → seed.rs definitions
//!     → created through the service's validated write path
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → diff against running config, log sections needing restart
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod seed;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, load_seed, BootstrapError};
pub use schema::{
    BusConfig, CacheConfig, CircuitBreakerConfig, ControlPlaneConfig, EnvironmentConfig,
    EnvironmentsConfig, FlagsConfig, LogFormat, ObservabilityConfig, RateLimitConfig, SeedConfig,
    StoreConfig,
};
pub use seed::{SeedFile, SeedOverride};
pub use validation::{validate_config, ValidationError};
pub use watcher::{ConfigWatcher, ReloadState, RestartRequired};
