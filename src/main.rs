use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use zerotrace::cli::Args;
use zerotrace::config::Config;
use zerotrace::export::{JsonLineLog, TraceSink};
use zerotrace::server::{self, ServerState};
use zerotrace::trace::TraceEngine;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("Invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from(&args);
    let log = Arc::new(JsonLineLog::open(&config.logfile)?);
    let sink: Arc<dyn TraceSink> = log.clone();

    // Capture must work before any client is accepted
    let engine = match TraceEngine::start(config.clone(), sink) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;

    // Cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup Ctrl+C handler
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        cancel_clone.cancel();
    });

    let state = ServerState {
        engine: engine.clone(),
        log,
    };
    let served = server::serve(listener, state, cancel).await;

    engine.shutdown().context("Capture listener failed")?;
    served
}
