//! Bootstrap file watcher.
//!
//! Bootstrap values are immutable for the life of the process. The watcher
//! re-reads the file when it changes, validates it, and reports which
//! sections differ from the running configuration so operators know a
//! restart is pending. It never applies them live.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::{load_config, BootstrapError};
use crate::config::schema::ControlPlaneConfig;

/// Sent when the file on disk diverges from the running configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartRequired {
    pub sections: Vec<&'static str>,
}

/// Running configuration next to the last valid version read from disk.
#[derive(Debug)]
pub struct ReloadState {
    path: PathBuf,
    running: Arc<ControlPlaneConfig>,
    on_disk: ArcSwap<ControlPlaneConfig>,
}

impl ReloadState {
    pub fn new(path: &Path, running: Arc<ControlPlaneConfig>) -> Self {
        Self {
            path: path.to_path_buf(),
            on_disk: ArcSwap::new(running.clone()),
            running,
        }
    }

    pub fn running(&self) -> &ControlPlaneConfig {
        &self.running
    }

    /// Last valid configuration read from disk.
    pub fn on_disk(&self) -> Arc<ControlPlaneConfig> {
        self.on_disk.load_full()
    }

    /// Re-read the file. Returns the sections that differ from the running
    /// configuration. An invalid file leaves the previous on-disk view.
    pub fn reload(&self) -> Result<Vec<&'static str>, BootstrapError> {
        let loaded = load_config(&self.path)?;
        let sections = changed_sections(&self.running, &loaded);
        self.on_disk.store(Arc::new(loaded));
        Ok(sections)
    }
}

/// Names of top-level sections that differ.
pub fn changed_sections(a: &ControlPlaneConfig, b: &ControlPlaneConfig) -> Vec<&'static str> {
    let mut sections = Vec::new();
    if a.cache != b.cache {
        sections.push("cache");
    }
    if a.store != b.store {
        sections.push("store");
    }
    if a.circuit_breaker != b.circuit_breaker {
        sections.push("circuit_breaker");
    }
    if a.bus != b.bus {
        sections.push("bus");
    }
    if a.environments != b.environments {
        sections.push("environments");
    }
    if a.rate_limit != b.rate_limit {
        sections.push("rate_limit");
    }
    if a.flags != b.flags {
        sections.push("flags");
    }
    if a.observability != b.observability {
        sections.push("observability");
    }
    if a.seed != b.seed {
        sections.push("seed");
    }
    sections
}

/// A watcher that monitors the bootstrap file for changes.
pub struct ConfigWatcher {
    state: Arc<ReloadState>,
    notice_tx: mpsc::UnboundedSender<RestartRequired>,
}

impl ConfigWatcher {
    /// Create a new ConfigWatcher.
    ///
    /// Returns the watcher and a receiver for restart notices.
    pub fn new(
        path: &Path,
        running: Arc<ControlPlaneConfig>,
    ) -> (Self, mpsc::UnboundedReceiver<RestartRequired>) {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::new(ReloadState::new(path, running)),
                notice_tx,
            },
            notice_rx,
        )
    }

    pub fn state(&self) -> Arc<ReloadState> {
        self.state.clone()
    }

    /// Start watching the file. Events arrive on notify's own thread.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let state = self.state.clone();
        let tx = self.notice_tx.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    match state.reload() {
                        Ok(sections) if sections.is_empty() => {
                            tracing::debug!("Bootstrap file touched, no effective change");
                        }
                        Ok(sections) => {
                            tracing::warn!(
                                sections = ?sections,
                                "Bootstrap configuration changed on disk; restart required to apply"
                            );
                            let _ = tx.send(RestartRequired { sections });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Ignoring invalid bootstrap file on disk");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.state.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.state.path, "Bootstrap watcher started");
        Ok(watcher)
    }
}
