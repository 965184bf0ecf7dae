use anyhow::Context;
use boardshot::cdp::CdpSource;
use boardshot::server::{self, AppState};
use boardshot::{BoardConfig, Pipeline, ProcessRunner, ScratchBroker, SessionManager};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Serve live transit departure boards as e-ink ready PNGs.
#[derive(Debug, Parser)]
#[command(name = "boardshot", version, about)]
struct Args {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// JSON file with slot groups and render settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write a full-page screenshot per slot here after each (re)load
    #[arg(long)]
    debug_captures: Option<PathBuf>,

    /// Working directory for the external transforms (where `./aspect` lives)
    #[arg(long)]
    transform_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => BoardConfig::from_json_file(path)?,
        None => BoardConfig::default(),
    };
    if args.debug_captures.is_some() {
        config.debug_captures = args.debug_captures.clone();
    }
    config.validate()?;
    config.resolve_paths(&std::env::current_dir().context("reading working directory")?);

    if let Some(dir) = &config.debug_captures {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating debug capture dir {}", dir.display()))?;
    }

    let source = CdpSource::launch(config.viewport)?;
    let manager = SessionManager::builder(Arc::new(source))
        .groups(config.groups.clone())
        .retry(config.retry)
        .refresh_interval(config.refresh_interval)
        .debug_captures(config.debug_captures.clone())
        .start()
        .await
        .context("initial page load failed")?;
    manager.spawn_refresh_loops();

    let broker = match &config.scratch_dir {
        Some(dir) => ScratchBroker::in_dir(dir),
        None => ScratchBroker::new(),
    };
    let runner = match &args.transform_dir {
        Some(dir) => ProcessRunner::with_working_dir(dir),
        None => ProcessRunner::new(),
    };
    let pipeline = Pipeline::new(broker, Arc::new(runner));
    let state = Arc::new(AppState::new(Arc::clone(&manager), pipeline, &config)?);
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.port))
        .await
        .with_context(|| format!("binding port {}", args.port))?;
    info!(target: "boardshot", "Listening on port {}", args.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!(target: "boardshot", "shutdown requested");
        })
        .await?;

    manager.shutdown().await;
    Ok(())
}
