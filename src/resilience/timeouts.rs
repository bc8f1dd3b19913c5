//! Timeout enforcement.
//!
//! Every store, L2 and bus call carries a deadline. A timed-out store call
//! surfaces as `StoreUnavailable`; cache and bus callers treat a timeout
//! like any other outage of that tier.

use std::future::Future;
use std::time::Duration;

use crate::cache::{BusError, CacheError};
use crate::store::StoreError;

/// Bound a store call.
pub async fn store_call<T, F>(deadline: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(deadline, call)
        .await
        .unwrap_or(Err(StoreError::Timeout(deadline)))
}

/// Bound an L2 call.
pub async fn cache_call<T, F>(deadline: Duration, call: F) -> Result<T, CacheError>
where
    F: Future<Output = Result<T, CacheError>>,
{
    tokio::time::timeout(deadline, call)
        .await
        .unwrap_or(Err(CacheError::Timeout(deadline)))
}

/// Bound a publish.
pub async fn bus_call<F>(deadline: Duration, topic: &str, call: F) -> Result<(), BusError>
where
    F: Future<Output = Result<(), BusError>>,
{
    tokio::time::timeout(deadline, call)
        .await
        .unwrap_or_else(|_| Err(BusError::Timeout(topic.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_call_times_out() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, StoreError>(1)
        };
        let result = store_call(Duration::from_millis(20), slow).await;
        assert_eq!(result, Err(StoreError::Timeout(Duration::from_millis(20))));
    }

    #[tokio::test]
    async fn test_fast_calls_pass_through() {
        let value = cache_call(Duration::from_secs(1), async { Ok::<_, CacheError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(bus_call(Duration::from_secs(1), "t", async { Ok(()) })
            .await
            .is_ok());
    }
}
