//! Fleet-shared L2 cache.
//!
//! The trait mirrors what a Redis-style server offers: string values with a
//! TTL, plus a time-ordered event log per key used by the rate limiter.
//! `window_admit` must be atomic on the server side (a script or
//! transaction in a real deployment); [`MemoryDistributedCache`] takes a
//! per-key lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::clock::Clock;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("distributed cache unavailable: {0}")]
    Unavailable(String),

    #[error("distributed cache timed out after {0:?}")]
    Timeout(Duration),

    #[error("cached payload is corrupt: {0}")]
    Corrupt(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Parameters for one sliding-window admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRequest {
    pub now_millis: i64,
    pub window_millis: i64,
    pub limit: u64,
    /// Unique id of the event to record.
    pub member: String,
    /// Record even when over the limit (log-only rules).
    pub record_when_full: bool,
}

/// Window contents after pruning (and after recording, if admitted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    pub count: u64,
    pub oldest_millis: Option<i64>,
    pub admitted: bool,
}

#[async_trait]
pub trait DistributedCache: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()>;

    async fn delete(&self, keys: &[String]) -> CacheResult<()>;

    /// Prune events older than the window, then record one if under the limit.
    async fn window_admit(&self, key: &str, request: WindowRequest) -> CacheResult<WindowState>;

    /// Prune and count without recording.
    async fn window_peek(
        &self,
        key: &str,
        now_millis: i64,
        window_millis: i64,
    ) -> CacheResult<WindowState>;
}

#[derive(Debug)]
struct StoredValue {
    value: String,
    expires_at: i64,
}

/// Admissions between sweeps of idle windows.
const SWEEP_EVERY: u64 = 256;

#[derive(Debug, Default)]
struct EventLog {
    /// (timestamp, member), ascending by timestamp.
    events: VecDeque<(i64, String)>,
    /// Window of the last request, used by the idle sweep.
    window_millis: i64,
}

impl EventLog {
    /// Every event has left the window.
    fn is_idle(&self, now: i64) -> bool {
        self.events
            .back()
            .map_or(true, |(ts, _)| *ts <= now - self.window_millis)
    }

    fn prune(&mut self, now: i64, window: i64) {
        let cutoff = now - window;
        while matches!(self.events.front(), Some((ts, _)) if *ts <= cutoff) {
            self.events.pop_front();
        }
    }

    fn record(&mut self, ts: i64, member: String) {
        let at = self.events.partition_point(|(t, _)| *t <= ts);
        self.events.insert(at, (ts, member));
    }

    fn state(&self, admitted: bool) -> WindowState {
        WindowState {
            count: self.events.len() as u64,
            oldest_millis: self.events.front().map(|(ts, _)| *ts),
            admitted,
        }
    }
}

/// In-process implementation for single-node deployments and tests.
#[derive(Debug)]
pub struct MemoryDistributedCache {
    values: DashMap<String, StoredValue>,
    windows: DashMap<String, EventLog>,
    admissions: AtomicU64,
    available: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl MemoryDistributedCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            values: DashMap::new(),
            windows: DashMap::new(),
            admissions: AtomicU64::new(0),
            available: AtomicBool::new(true),
            clock,
        }
    }

    /// Failure injection: make every call fail until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Scoped keys with a live event log.
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    fn drop_if_empty(&self, key: &str) {
        self.windows.remove_if(key, |_, log| log.events.is_empty());
    }

    /// Drop windows whose events have all expired. Stands in for a key TTL
    /// on a real server.
    fn sweep_idle(&self, now: i64) {
        if self.admissions.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.windows.retain(|_, log| !log.is_idle(now));
        }
    }

    fn ensure_available(&self) -> CacheResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unavailable("injected outage".into()))
        }
    }
}

#[async_trait]
impl DistributedCache for MemoryDistributedCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.ensure_available()?;
        let now = self.clock.now_millis();
        let expired = match self.values.get(key) {
            Some(stored) if stored.expires_at > now => return Ok(Some(stored.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.values.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()> {
        self.ensure_available()?;
        let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = self.clock.now_millis().saturating_add(ttl_millis);
        self.values
            .insert(key.to_string(), StoredValue { value, expires_at });
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> CacheResult<()> {
        self.ensure_available()?;
        for key in keys {
            self.values.remove(key);
        }
        Ok(())
    }

    async fn window_admit(&self, key: &str, request: WindowRequest) -> CacheResult<WindowState> {
        self.ensure_available()?;
        let now = request.now_millis;
        let state = {
            let mut log = self.windows.entry(key.to_string()).or_default();
            log.window_millis = request.window_millis;
            log.prune(now, request.window_millis);
            let admitted = (log.events.len() as u64) < request.limit;
            if admitted || request.record_when_full {
                log.record(now, request.member);
            }
            log.state(admitted)
        };
        if state.count == 0 {
            self.drop_if_empty(key);
        }
        self.sweep_idle(now);
        Ok(state)
    }

    async fn window_peek(
        &self,
        key: &str,
        now_millis: i64,
        window_millis: i64,
    ) -> CacheResult<WindowState> {
        self.ensure_available()?;
        let state = match self.windows.get_mut(key) {
            Some(mut log) => {
                log.prune(now_millis, window_millis);
                log.state(false)
            }
            None => return Ok(EventLog::default().state(false)),
        };
        if state.count == 0 {
            self.drop_if_empty(key);
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn request(now: i64, member: &str) -> WindowRequest {
        WindowRequest {
            now_millis: now,
            window_millis: 60_000,
            limit: 2,
            member: member.to_string(),
            record_when_full: false,
        }
    }

    #[tokio::test]
    async fn test_values_expire() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = MemoryDistributedCache::new(clock.clone());
        cache
            .set("k", "v".into(), Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        clock.advance_secs(300);
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(!cache.contains("k"));
    }

    #[tokio::test]
    async fn test_window_admission_and_pruning() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = MemoryDistributedCache::new(clock);

        assert!(cache.window_admit("w", request(0, "a")).await.unwrap().admitted);
        assert!(cache.window_admit("w", request(1_000, "b")).await.unwrap().admitted);
        let full = cache.window_admit("w", request(2_000, "c")).await.unwrap();
        assert!(!full.admitted);
        assert_eq!(full.count, 2);
        assert_eq!(full.oldest_millis, Some(0));

        // The first event leaves the window at exactly t = 60s.
        let later = cache.window_admit("w", request(60_000, "d")).await.unwrap();
        assert!(later.admitted);
        assert_eq!(later.oldest_millis, Some(1_000));
    }

    #[tokio::test]
    async fn test_record_when_full() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = MemoryDistributedCache::new(clock);
        let mut req = request(0, "a");
        req.limit = 0;
        req.record_when_full = true;
        let state = cache.window_admit("w", req).await.unwrap();
        assert!(!state.admitted);
        assert_eq!(state.count, 1);
        assert_eq!(cache.window_peek("w", 0, 60_000).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_emptied_window_is_removed() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = MemoryDistributedCache::new(clock);
        cache.window_admit("w", request(0, "a")).await.unwrap();
        assert_eq!(cache.window_count(), 1);

        let state = cache.window_peek("w", 120_000, 60_000).await.unwrap();
        assert_eq!(state.count, 0);
        assert_eq!(cache.window_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_windows_are_swept() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = MemoryDistributedCache::new(clock);
        for i in 0..SWEEP_EVERY {
            cache
                .window_admit(&format!("ip:{i}"), request(0, "a"))
                .await
                .unwrap();
        }
        assert_eq!(cache.window_count(), SWEEP_EVERY as usize);

        // One busy subject after every other window has gone quiet.
        for i in 0..SWEEP_EVERY {
            cache
                .window_admit("ip:busy", request(120_000, &i.to_string()))
                .await
                .unwrap();
        }
        assert_eq!(cache.window_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_outage() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = MemoryDistributedCache::new(clock);
        cache.set_available(false);
        assert!(matches!(cache.get("k").await, Err(CacheError::Unavailable(_))));
        cache.set_available(true);
        assert!(cache.get("k").await.is_ok());
    }
}
