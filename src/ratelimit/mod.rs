//! Dynamic rate limiting.
//!
//! # Responsibilities
//! - Sliding-window counting per scoped key, stored as an event log in
//!   the distributed cache so every instance shares one count
//! - Apply the rule's violation action: block, throttle, queue, log only
//! - Pick up rule edits through ordinary configuration invalidation
//!
//! # Data Flow
//! ```text
//! consume(rule, subject)
//!     → resolve rule entry (`ratelimit.<rule>`) through the service
//!     → exempt? admit without counting
//!     → window_admit(scoped key): prune, count, record if under limit
//!     → over limit: block | throttle(retry-after) | queue(wait) | log only
//!     → cache unreachable: fail open (or closed), marked degraded
//! ```
//!
//! # Design Decisions
//! - Rules are plain `json` configuration entries: versioned, validated by
//!   the `rate_limit_rule` predicate, rolled back like anything else
//! - Queued waiters sleep until the oldest event leaves the window, and
//!   are woken early whenever a rule changes

pub mod scope;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::audit::{self, AuditAction, AuditEvent};
use crate::cache::{
    BusError, BusEvent, CacheError, DistributedCache, InvalidationHandler, Subscription,
    WindowRequest, WindowState,
};
use crate::config::RateLimitConfig;
use crate::error::{ControlPlaneError, ControlPlaneResult, EntityKind};
use crate::model::{RateLimitRule, RateLimitSubject, ViolationAction};
use crate::observability::metrics;
use crate::resilience::timeouts;
use crate::service::ConfigurationService;

pub use scope::scoped_key;

/// Outcome of one check or consume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub rule: String,
    pub allowed: bool,
    /// Action applied because the limit was reached.
    pub action: Option<ViolationAction>,
    pub limit: u64,
    /// Events in the window, including this one if it was recorded.
    pub count: u64,
    pub remaining: u64,
    /// Until the oldest event leaves the window.
    pub reset_after: Option<Duration>,
    /// Suggested wait before retrying a rejected request.
    pub retry_after: Option<Duration>,
    /// Time spent queued before admission.
    pub queued_for: Option<Duration>,
    pub exempt: bool,
    /// Decided without the distributed cache.
    pub degraded: bool,
}

impl RateLimitDecision {
    fn open(rule: &str, limit: u64) -> Self {
        Self {
            rule: rule.to_string(),
            allowed: true,
            action: None,
            limit,
            count: 0,
            remaining: limit,
            reset_after: None,
            retry_after: None,
            queued_for: None,
            exempt: false,
            degraded: false,
        }
    }

    fn from_window(rule: &str, limit: u64, state: &WindowState, reset_after: Option<Duration>) -> Self {
        Self {
            count: state.count,
            remaining: limit.saturating_sub(state.count),
            reset_after,
            ..Self::open(rule, limit)
        }
    }

    fn outcome(&self) -> &'static str {
        match (self.allowed, self.action) {
            _ if self.exempt => "exempt",
            _ if self.degraded => "degraded",
            (true, None) if self.queued_for.is_some() => "queued",
            (true, None) => "allowed",
            (true, Some(_)) => "log_only",
            (false, Some(ViolationAction::Throttle)) => "throttled",
            (false, Some(ViolationAction::Queue)) => "queue_rejected",
            (false, _) => "blocked",
        }
    }
}

/// Shared-window rate limiter driven by configuration entries.
#[derive(Debug)]
pub struct RateLimiter {
    service: Arc<ConfigurationService>,
    cache: Arc<dyn DistributedCache>,
    config: RateLimitConfig,
    waiting: DashMap<String, Arc<AtomicUsize>>,
    rule_changed: Arc<Notify>,
}

impl RateLimiter {
    pub fn new(service: Arc<ConfigurationService>) -> Self {
        Self {
            config: service.config().rate_limit.clone(),
            cache: service.collaborators().l2.clone(),
            service,
            waiting: DashMap::new(),
            rule_changed: Arc::new(Notify::new()),
        }
    }

    /// Wake queued waiters whenever a rule entry is invalidated.
    pub fn subscribe_rule_changes(&self) -> Result<Subscription, BusError> {
        let notify = self.rule_changed.clone();
        let prefix = self.config.rule_prefix.clone();
        let handler: InvalidationHandler = Arc::new(move |event| match event {
            BusEvent::Invalidate(msg) if msg.key.starts_with(&prefix) => notify.notify_waiters(),
            BusEvent::Overflow { .. } => notify.notify_waiters(),
            BusEvent::Invalidate(_) => {}
        });
        let bus = &self.service.collaborators().bus;
        bus.subscribe(&self.service.config().bus.config_topic, handler)
    }

    /// Current rule definition for `rule`.
    pub async fn rule(&self, rule: &str) -> ControlPlaneResult<RateLimitRule> {
        let key = format!("{}{rule}", self.config.rule_prefix);
        let resolved = match self.service.get(&key, &self.config.environment).await {
            Ok(resolved) => resolved,
            Err(ControlPlaneError::NotFound { .. }) => {
                return Err(ControlPlaneError::not_found(EntityKind::RateLimitRule, rule))
            }
            Err(e) => return Err(e),
        };
        let parsed: RateLimitRule = resolved.value.parse_json().ok_or_else(|| {
            ControlPlaneError::InvalidRequest(format!("entry '{key}' is not a rate limit rule"))
        })?;
        parsed
            .check()
            .map_err(|reason| ControlPlaneError::InvalidRequest(format!("rule '{rule}': {reason}")))?;
        Ok(parsed)
    }

    /// Would a request be admitted now? Records nothing.
    pub async fn check(
        &self,
        rule_name: &str,
        subject: &RateLimitSubject,
    ) -> ControlPlaneResult<RateLimitDecision> {
        let rule = self.rule(rule_name).await?;
        if !rule.enabled {
            return Ok(RateLimitDecision::open(rule_name, rule.max_requests));
        }
        if is_exempt(&rule, subject) {
            return Ok(RateLimitDecision {
                exempt: true,
                ..RateLimitDecision::open(rule_name, rule.max_requests)
            });
        }

        let key = scoped_key(rule_name, &rule.scope, subject)?;
        let now = self.service.clock().now_millis();
        let window = rule.window_millis();
        let peeked = timeouts::cache_call(
            self.service.config().store.cache_timeout(),
            self.cache.window_peek(&key, now, window),
        )
        .await;
        match peeked {
            Ok(state) => {
                let reset = reset_after(&state, now, window);
                let mut decision = RateLimitDecision::from_window(rule_name, rule.max_requests, &state, reset);
                if state.count >= rule.max_requests {
                    decision.action = Some(rule.action);
                    decision.allowed = rule.action == ViolationAction::LogOnly;
                    decision.retry_after = retry_hint(rule.action, reset);
                }
                Ok(decision)
            }
            Err(e) => Ok(self.degraded(rule_name, &rule, &e)),
        }
    }

    /// Admit and record a request, applying the violation action when the
    /// limit is reached.
    pub async fn consume(
        &self,
        rule_name: &str,
        subject: &RateLimitSubject,
    ) -> ControlPlaneResult<RateLimitDecision> {
        let rule = self.rule(rule_name).await?;
        let decision = if !rule.enabled {
            RateLimitDecision::open(rule_name, rule.max_requests)
        } else if is_exempt(&rule, subject) {
            RateLimitDecision {
                exempt: true,
                ..RateLimitDecision::open(rule_name, rule.max_requests)
            }
        } else {
            let key = scoped_key(rule_name, &rule.scope, subject)?;
            match self.admit(&key, &rule).await {
                Ok((state, reset)) if state.admitted => {
                    RateLimitDecision::from_window(rule_name, rule.max_requests, &state, reset)
                }
                Ok((state, reset)) => self.violate(rule_name, rule, &key, subject, state, reset).await?,
                Err(e) => self.degraded(rule_name, &rule, &e),
            }
        };
        metrics::record_rate_limit(rule_name, decision.outcome());
        Ok(decision)
    }

    async fn admit(
        &self,
        key: &str,
        rule: &RateLimitRule,
    ) -> Result<(WindowState, Option<Duration>), CacheError> {
        let now = self.service.clock().now_millis();
        let window = rule.window_millis();
        let request = WindowRequest {
            now_millis: now,
            window_millis: window,
            limit: rule.max_requests,
            member: Uuid::new_v4().to_string(),
            record_when_full: rule.action == ViolationAction::LogOnly,
        };
        let state = timeouts::cache_call(
            self.service.config().store.cache_timeout(),
            self.cache.window_admit(key, request),
        )
        .await?;
        Ok((state, reset_after(&state, now, window)))
    }

    async fn violate(
        &self,
        rule_name: &str,
        rule: RateLimitRule,
        key: &str,
        subject: &RateLimitSubject,
        state: WindowState,
        reset: Option<Duration>,
    ) -> ControlPlaneResult<RateLimitDecision> {
        let mut decision = RateLimitDecision::from_window(rule_name, rule.max_requests, &state, reset);
        decision.action = Some(rule.action);
        match rule.action {
            ViolationAction::Block | ViolationAction::Throttle => {
                decision.allowed = false;
                decision.retry_after = retry_hint(rule.action, reset);
                tracing::debug!(rule = rule_name, key, action = rule.action.as_str(), "Rate limit exceeded");
            }
            ViolationAction::LogOnly => {
                decision.allowed = true;
                tracing::warn!(rule = rule_name, key, count = state.count, "Rate limit exceeded (log only)");
                let actor = subject.identities().next().unwrap_or("anonymous");
                audit::emit(
                    self.service.audit(),
                    AuditEvent::new(
                        AuditAction::RateLimitViolation,
                        actor,
                        "rate limit exceeded",
                        rule_name,
                        self.service.clock().now(),
                    )
                    .with_details(json!({
                        "scoped_key": key,
                        "count": state.count,
                        "limit": rule.max_requests,
                    })),
                )
                .await;
            }
            ViolationAction::Queue => return self.wait_in_queue(rule_name, rule, key, decision).await,
        }
        Ok(decision)
    }

    /// Hold the request until a slot frees up, the rule changes, or the
    /// maximum wait passes.
    async fn wait_in_queue(
        &self,
        rule_name: &str,
        mut rule: RateLimitRule,
        key: &str,
        mut decision: RateLimitDecision,
    ) -> ControlPlaneResult<RateLimitDecision> {
        let (_slot, ahead) = QueueSlot::join(&self.waiting, key);
        if ahead >= self.config.queue_capacity {
            decision.allowed = false;
            decision.retry_after = decision.reset_after;
            tracing::debug!(rule = rule_name, key, "Rate limit queue full");
            return Ok(decision);
        }

        let started = tokio::time::Instant::now();
        let deadline = started + self.config.max_queue_wait();
        let mut reset = decision.reset_after;
        loop {
            let changed = self.rule_changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let now = tokio::time::Instant::now();
            if now >= deadline {
                decision.allowed = false;
                decision.retry_after = reset;
                return Ok(decision);
            }
            let wait = reset
                .unwrap_or(Duration::from_millis(50))
                .max(Duration::from_millis(1))
                .min(deadline - now);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = &mut changed => {
                    rule = self.rule(rule_name).await?;
                }
            }

            match self.admit(key, &rule).await {
                Ok((state, next_reset)) if state.admitted => {
                    let mut admitted =
                        RateLimitDecision::from_window(rule_name, rule.max_requests, &state, next_reset);
                    admitted.queued_for = Some(started.elapsed());
                    return Ok(admitted);
                }
                Ok((state, next_reset)) => {
                    decision = RateLimitDecision::from_window(rule_name, rule.max_requests, &state, next_reset);
                    decision.action = Some(ViolationAction::Queue);
                    reset = next_reset;
                }
                Err(e) => return Ok(self.degraded(rule_name, &rule, &e)),
            }
        }
    }

    fn degraded(&self, rule_name: &str, rule: &RateLimitRule, err: &CacheError) -> RateLimitDecision {
        tracing::warn!(
            rule = rule_name,
            error = %err,
            fail_open = self.config.fail_open,
            "Rate limit window unavailable"
        );
        RateLimitDecision {
            allowed: self.config.fail_open,
            degraded: true,
            ..RateLimitDecision::open(rule_name, rule.max_requests)
        }
    }
}

/// One waiter's place in a scoped key's queue. The key's counter is
/// removed when its last waiter leaves.
struct QueueSlot<'a> {
    waiting: &'a DashMap<String, Arc<AtomicUsize>>,
    key: String,
    counter: Arc<AtomicUsize>,
}

impl<'a> QueueSlot<'a> {
    /// Join the queue; also returns how many were waiting already.
    fn join(waiting: &'a DashMap<String, Arc<AtomicUsize>>, key: &str) -> (Self, usize) {
        // Increment under the shard lock so `remove_if` never drops a live counter.
        let entry = waiting
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)));
        let ahead = entry.fetch_add(1, Ordering::SeqCst);
        let counter = entry.clone();
        drop(entry);
        let slot = Self {
            waiting,
            key: key.to_string(),
            counter,
        };
        (slot, ahead)
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
        self.waiting
            .remove_if(&self.key, |_, c| c.load(Ordering::SeqCst) == 0);
    }
}

/// `block` rejects outright; throttled and queued rejections carry the wait.
fn retry_hint(action: ViolationAction, reset: Option<Duration>) -> Option<Duration> {
    match action {
        ViolationAction::Throttle | ViolationAction::Queue => reset,
        ViolationAction::Block | ViolationAction::LogOnly => None,
    }
}

fn is_exempt(rule: &RateLimitRule, subject: &RateLimitSubject) -> bool {
    let exemptions = &rule.exemptions;
    subject
        .identities()
        .any(|id| exemptions.identities.iter().any(|e| e == id))
        || subject
            .roles
            .iter()
            .any(|role| exemptions.roles.iter().any(|e| e == role))
}

fn reset_after(state: &WindowState, now_millis: i64, window_millis: i64) -> Option<Duration> {
    state.oldest_millis.map(|oldest| {
        let remaining = (oldest + window_millis - now_millis).max(0);
        Duration::from_millis(u64::try_from(remaining).unwrap_or(0))
    })
}
