//! Distributed configuration control plane.
//!
//! # Architecture Overview
//!
//! ```text
//!   callers ──▶ ConfigurationService ──▶ Validator + DependencyView
//!                  │        │
//!                  │        ├──▶ store (entries, overrides, flags, history)
//!                  │        ├──▶ L1 (per process) / L2 (shared)
//!                  │        └──▶ invalidation bus ──▶ every instance's L1
//!                  │
//!   FlagEvaluator ─┤  (circuit breaker, stale definitions, static defaults)
//!   RateLimiter ───┤  (rules are entries, windows live in L2)
//!   RollbackEngine ┤  (history replayed through the write path)
//!   TemplateEngine ┘  (bulk writes with preview)
//! ```
//!
//! # Commands
//! - `serve`: bootstrap, seed, watch the bootstrap file, wait for a signal
//! - `check`: validate a bootstrap file and a seed file
//! - `preview`: diff a seeded template against one environment
//! - `evaluate`: decide a seeded flag for one subject

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use control_plane::config::{load_config, load_seed, BootstrapError, ConfigWatcher, SeedFile};
use control_plane::lifecycle::{signals, ControlPlane, Shutdown};
use control_plane::model::SubjectContext;
use control_plane::observability::{logging, metrics};
use control_plane::ControlPlaneConfig;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "control-plane", version, about = "Distributed configuration control plane")]
struct Cli {
    /// Bootstrap configuration file (TOML). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Seed definitions file; overrides `seed.path` from the bootstrap file.
    #[arg(short, long, global = true)]
    seed: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the control plane until SIGTERM or SIGINT.
    Serve,
    /// Validate the bootstrap and seed files, then exit.
    Check,
    /// Show what applying a seeded template would change.
    Preview {
        template: String,
        #[arg(short, long, default_value = "production")]
        environment: String,
    },
    /// Evaluate a seeded feature flag for one subject.
    Evaluate {
        flag: String,
        subject: String,
        #[arg(long)]
        role: Vec<String>,
        #[arg(long)]
        environment: Option<String>,
        #[arg(long)]
        country: Option<String>,
        #[arg(long)]
        app_version: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match bootstrap(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init_logging(&config.observability) {
        eprintln!("error: failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Command::Serve => serve(config, cli.config, cli.seed).await,
        Command::Check => check(&config, cli.seed.as_deref()),
        Command::Preview {
            template,
            environment,
        } => preview(config, cli.seed.as_deref(), &template, &environment).await,
        Command::Evaluate {
            flag,
            subject,
            role,
            environment,
            country,
            app_version,
        } => {
            let mut ctx = SubjectContext::for_subject(subject);
            for r in role {
                ctx = ctx.with_role(r);
            }
            if let Some(env) = environment {
                ctx = ctx.with_environment(env);
            }
            if let Some(country) = country {
                ctx = ctx.with_country(country);
            }
            if let Some(version) = app_version {
                ctx = ctx.with_app_version(version);
            }
            evaluate(config, cli.seed.as_deref(), &flag, &ctx).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn bootstrap(path: Option<&Path>) -> Result<ControlPlaneConfig, BootstrapError> {
    match path {
        Some(path) => load_config(path),
        None => Ok(ControlPlaneConfig::default()),
    }
}

fn seed_file(config: &ControlPlaneConfig, explicit: Option<&Path>) -> Result<SeedFile, BootstrapError> {
    match explicit.or(config.seed.path.as_deref()) {
        Some(path) => load_seed(path),
        None => Ok(SeedFile::default()),
    }
}

async fn seeded_plane(
    config: ControlPlaneConfig,
    seed: Option<&Path>,
) -> Result<ControlPlane, BootstrapError> {
    let seed = seed_file(&config, seed)?;
    let plane = ControlPlane::builder(config).build()?;
    if !seed.is_empty() {
        plane.apply_seed(&seed).await?;
    }
    Ok(plane)
}

async fn serve(
    config: ControlPlaneConfig,
    config_path: Option<PathBuf>,
    seed: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "control-plane starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let plane = seeded_plane(config, seed.as_deref()).await?;
    let shutdown = Arc::new(Shutdown::new());
    let mut tasks = Vec::new();

    // The watcher must outlive the wait below; dropping it stops watching.
    let mut _watcher = None;
    let mut reload = None;
    if let Some(path) = &config_path {
        let (watcher, mut notices) = ConfigWatcher::new(path, plane.config.clone());
        reload = Some(watcher.state());
        _watcher = Some(watcher.run()?);

        let mut stop = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    notice = notices.recv() => match notice {
                        Some(notice) => tracing::warn!(
                            sections = ?notice.sections,
                            "Restart pending for bootstrap changes"
                        ),
                        None => return,
                    },
                    _ = stop.recv() => return,
                }
            }
        }));
    }

    let mut stop = shutdown.subscribe();
    tasks.push(signals::spawn_listener(shutdown.clone(), reload));
    tracing::info!(
        environments = plane.config.environments.declared.len(),
        "Ready"
    );
    let _ = stop.recv().await;

    tracing::info!("Shutting down");
    drop(plane);
    shutdown.drain(tasks, SHUTDOWN_DEADLINE).await;
    tracing::info!("Shutdown complete");
    Ok(())
}

fn check(config: &ControlPlaneConfig, seed: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let seed = seed_file(config, seed)?;
    println!(
        "configuration ok: {} environments, seed: {} entries, {} overrides, {} flags, {} templates",
        config.environments.declared.len(),
        seed.entries.len(),
        seed.overrides.len(),
        seed.flags.len(),
        seed.templates.len()
    );
    Ok(())
}

async fn preview(
    config: ControlPlaneConfig,
    seed: Option<&Path>,
    template: &str,
    environment: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let plane = seeded_plane(config, seed).await?;
    let preview = plane.templates.preview(template, environment).await?;
    println!("{}", serde_json::to_string_pretty(&preview)?);
    Ok(())
}

async fn evaluate(
    config: ControlPlaneConfig,
    seed: Option<&Path>,
    flag: &str,
    subject: &SubjectContext,
) -> Result<(), Box<dyn std::error::Error>> {
    let plane = seeded_plane(config, seed).await?;
    let evaluation = plane.flags.evaluate(flag, subject).await;
    println!("{}", serde_json::to_string_pretty(&evaluation)?);
    Ok(())
}
