//! Distributed configuration control plane library

pub mod audit;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod flags;
pub mod history;
pub mod lifecycle;
pub mod model;
pub mod observability;
pub mod ratelimit;
pub mod resilience;
pub mod service;
pub mod store;
pub mod templates;
pub mod validator;

pub use config::ControlPlaneConfig;
pub use error::{ControlPlaneError, ControlPlaneResult};
pub use flags::{FlagEvaluation, FlagEvaluator};
pub use history::RollbackEngine;
pub use lifecycle::{ControlPlane, Shutdown};
pub use ratelimit::{RateLimitDecision, RateLimiter};
pub use service::ConfigurationService;
pub use templates::TemplateEngine;
