//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validate config → Wire collaborators → Build subsystems
//!     → Subscribe to invalidations → Apply seed
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Notify tasks → Drain with deadline → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!     SIGHUP → Re-read bootstrap file, report sections needing restart
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then service, then the engines on top
//! - Shutdown has timeout: forced abort after deadline

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use signals::SignalEvent;
pub use startup::{ControlPlane, ControlPlaneBuilder, SeedReport};
