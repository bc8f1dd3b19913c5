//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP)
//! - Translate signals to [`SignalEvent`]s
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - SIGHUP re-reads the bootstrap file and reports pending restarts; it
//!   never applies bootstrap changes live

use std::io;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::ReloadState;
use crate::lifecycle::shutdown::Shutdown;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Shutdown,
    Reload,
}

/// Next shutdown or reload signal.
#[cfg(unix)]
pub async fn next_signal() -> io::Result<SignalEvent> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut hup = signal(SignalKind::hangup())?;
    tokio::select! {
        _ = term.recv() => Ok(SignalEvent::Shutdown),
        _ = int.recv() => Ok(SignalEvent::Shutdown),
        _ = hup.recv() => Ok(SignalEvent::Reload),
    }
}

#[cfg(not(unix))]
pub async fn next_signal() -> io::Result<SignalEvent> {
    tokio::signal::ctrl_c().await?;
    Ok(SignalEvent::Shutdown)
}

/// Listen until a shutdown signal arrives, then trigger `shutdown`.
pub fn spawn_listener(shutdown: Arc<Shutdown>, reload: Option<Arc<ReloadState>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match next_signal().await {
                Ok(SignalEvent::Shutdown) => {
                    tracing::info!("Shutdown signal received");
                    shutdown.trigger();
                    return;
                }
                Ok(SignalEvent::Reload) => match &reload {
                    Some(state) => match state.reload() {
                        Ok(sections) if sections.is_empty() => {
                            tracing::info!("Reload requested, bootstrap file unchanged");
                        }
                        Ok(sections) => {
                            tracing::warn!(sections = ?sections, "Bootstrap file differs; restart required to apply");
                        }
                        Err(e) => tracing::error!(error = %e, "Reload requested, bootstrap file invalid"),
                    },
                    None => tracing::info!("Reload requested, running without a bootstrap file"),
                },
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install signal handlers");
                    shutdown.trigger();
                    return;
                }
            }
        }
    })
}
