//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use control_plane::audit::MemoryAuditSink;
use control_plane::cache::{BroadcastBus, MemoryDistributedCache};
use control_plane::clock::ManualClock;
use control_plane::lifecycle::ControlPlane;
use control_plane::model::{ChangeContext, ConfigurationEntry, DataType, ValidationRule};
use control_plane::store::MemoryStore;
use control_plane::ControlPlaneConfig;

/// One control plane instance plus handles on its in-memory collaborators.
pub struct Fixture {
    pub plane: ControlPlane,
    pub store: Arc<MemoryStore>,
    pub l2: Arc<MemoryDistributedCache>,
    pub bus: Arc<BroadcastBus>,
    pub audit: Arc<MemoryAuditSink>,
    pub clock: Arc<ManualClock>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(ControlPlaneConfig::default())
    }

    pub fn with_config(config: ControlPlaneConfig) -> Self {
        let clock = Arc::new(ManualClock::starting_at_epoch_2024());
        let store = Arc::new(MemoryStore::new());
        let l2 = Arc::new(MemoryDistributedCache::new(clock.clone()));
        let bus = Arc::new(BroadcastBus::new(config.bus.channel_capacity));
        let audit = Arc::new(MemoryAuditSink::new());
        let plane = build(config, &store, &l2, &bus, &audit, &clock);
        Self {
            plane,
            store,
            l2,
            bus,
            audit,
            clock,
        }
    }

    /// A second instance sharing this one's store, L2, bus and clock.
    pub fn peer(&self) -> ControlPlane {
        build(
            (*self.plane.config).clone(),
            &self.store,
            &self.l2,
            &self.bus,
            &self.audit,
            &self.clock,
        )
    }

    pub async fn create(&self, entry: ConfigurationEntry) {
        self.plane.service.create_entry(entry, &ctx()).await.unwrap();
    }

    pub async fn set(&self, key: &str, environment: &str, value: Value) {
        self.plane
            .service
            .set(key, value, environment, &ctx())
            .await
            .unwrap();
    }

    /// `checkout.maxRetries`: 0..=10, global 3, staging 5, production 3.
    pub async fn seed_checkout(&self) {
        self.create(
            ConfigurationEntry::new("checkout.maxRetries", DataType::Number)
                .with_value(json!(3))
                .with_category("checkout")
                .with_validation(ValidationRule::range(0.0, 10.0)),
        )
        .await;
        self.set("checkout.maxRetries", "staging", json!(5)).await;
        self.set("checkout.maxRetries", "production", json!(3)).await;
    }

    pub async fn number(&self, key: &str, environment: &str) -> f64 {
        self.plane
            .service
            .get(key, environment)
            .await
            .unwrap()
            .value
            .as_f64()
            .unwrap()
    }
}

fn build(
    config: ControlPlaneConfig,
    store: &Arc<MemoryStore>,
    l2: &Arc<MemoryDistributedCache>,
    bus: &Arc<BroadcastBus>,
    audit: &Arc<MemoryAuditSink>,
    clock: &Arc<ManualClock>,
) -> ControlPlane {
    ControlPlane::builder(config)
        .with_store(store.clone())
        .with_distributed_cache(l2.clone())
        .with_bus(bus.clone())
        .with_audit(audit.clone())
        .with_clock(clock.clone())
        .build()
        .unwrap()
}

pub fn ctx() -> ChangeContext {
    ChangeContext::new("ops@example.com", "integration test")
}

/// Let bus subscriber tasks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
