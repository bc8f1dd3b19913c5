//! Data model shared by every subsystem.
//!
//! # Lifecycle
//! ```text
//! administrative create
//!     → validated write path (service)
//!     → versioned update(s), each with a ChangeRecord
//!     → soft-disable (is_active = false), never hard delete
//! ```

pub mod entry;
pub mod flag;
pub mod history;
pub mod rate_limit;
pub mod template;
pub mod value;

pub use entry::{
    ConfigurationEntry, ConflictRule, Dependency, EnvironmentOverride, ValidationRule,
    ValueCondition,
};
pub use flag::{
    Attribute, Condition, FeatureFlag, FlagPatch, Operator, Schedule, SubjectContext,
    TargetingRule,
};
pub use history::{ChangeContext, ChangeKind, ChangeRecord, EntityType, HistoryKey};
pub use rate_limit::{
    Exemptions, RateLimitRule, RateLimitScope, RateLimitSubject, ViolationAction,
};
pub use template::{ConfigurationTemplate, TemplateUsage};
pub use value::{ConfigValue, DataType};
