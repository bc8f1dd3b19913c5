//! Two-tier caching and invalidation.
//!
//! # Data Flow
//! ```text
//! read:  L1 (local.rs) → L2 (distributed.rs) → store → fill L2, fill L1
//! write: store → bus.rs publish → every instance drops its L1 entry
//!                → writer deletes the affected L2 keys
//! ```
//!
//! # Design Decisions
//! - L1 holds values converted to their declared type; L2 holds the same
//!   resolution serialized as JSON so any instance can decode it
//! - The read path never touches the bus

pub mod bus;
pub mod distributed;
pub mod local;

use serde::{Deserialize, Serialize};

pub use bus::{
    BroadcastBus, BusError, BusEvent, InvalidationBus, InvalidationHandler, InvalidationMessage,
    Subscription,
};
pub use distributed::{
    CacheError, CacheResult, DistributedCache, MemoryDistributedCache, WindowRequest, WindowState,
};
pub use local::LocalCache;

/// Identity of one resolved configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub key: String,
    pub environment: String,
}

impl CacheKey {
    pub fn new(key: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            environment: environment.into(),
        }
    }

    /// Key used in the shared L2 namespace.
    pub fn l2_key(&self) -> String {
        format!("config:{}:{}", self.environment, self.key)
    }
}

/// L2 key of a flag definition.
pub fn flag_l2_key(flag_key: &str) -> String {
    format!("flag:{flag_key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_key_layout() {
        let key = CacheKey::new("checkout.maxRetries", "staging");
        assert_eq!(key.l2_key(), "config:staging:checkout.maxRetries");
        assert_eq!(flag_l2_key("newCheckoutFlow"), "flag:newCheckoutFlow");
    }
}
