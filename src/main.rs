use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use feedstream::config::Config;
use feedstream::fetch::{FetchSettings, Fetcher};
use feedstream::publish::{Publisher, PublisherSettings, ZmqProducer};
use feedstream::scheduler::{AdaptiveScheduler, SchedulerSettings};
use feedstream::source::Registry;
use feedstream::storage::ArticleStore;

#[derive(Parser, Debug)]
#[command(
    name = "feedstream",
    about = "Adaptive RSS/Atom polling pipeline publishing to a message stream"
)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, short, default_value = "feedstream.toml")]
    config: PathBuf,

    /// Poll every source once, wait for the passes to finish, then exit
    #[arg(long)]
    once: bool,

    /// Bind the PUB socket at the broker endpoint instead of connecting to
    /// it (brokerless mode: subscribers connect here)
    #[arg(long)]
    bind: bool,

    /// Log filter, e.g. "info" or "feedstream=debug" (RUST_LOG wins if set)
    #[arg(long, default_value = "info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_filter.clone())),
        )
        .init();

    let config = Config::load(&args.config).with_context(|| {
        format!(
            "Failed to load configuration from {}",
            args.config.display()
        )
    })?;
    let pipeline = config.pipeline.clone();

    let registry = Registry::from_config(&config).context("Invalid source configuration")?;
    tracing::info!(sources = registry.len(), "Source registry built");

    let fetcher = Arc::new(
        Fetcher::new(FetchSettings {
            request_timeout: Duration::from_secs(pipeline.request_timeout_secs),
            max_feed_bytes: pipeline.max_feed_bytes,
        })
        .context("Failed to build HTTP client")?,
    );

    let producer = if args.bind {
        ZmqProducer::bind(&pipeline.broker_endpoint).await
    } else {
        ZmqProducer::connect(&pipeline.broker_endpoint).await
    }
    .with_context(|| format!("Failed to set up producer at {}", pipeline.broker_endpoint))?;
    let publisher = Arc::new(Publisher::new(
        Arc::new(producer),
        PublisherSettings::from(&pipeline),
    ));

    let store = pipeline
        .data_dir
        .as_ref()
        .map(|dir| Arc::new(ArticleStore::new(dir)));
    if let Some(store) = &store {
        tracing::info!(path = %store.root().display(), "Parsed-article side channel enabled");
    }

    let (scheduler, mut status_rx) = AdaptiveScheduler::new(
        registry,
        fetcher,
        publisher,
        store,
        SchedulerSettings::from(&pipeline),
    );

    // Render status changes for operators; a metrics/health component would
    // watch the same channel.
    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow().clone();
            tracing::debug!(
                active = status.active_source_count,
                in_flight = status.in_flight_count,
                ok = status.successful_fetches,
                failed = status.failed_fetches,
                "Pipeline status"
            );
        }
    });

    if args.once {
        let mut scheduler = scheduler;
        scheduler.run_once().await;
        let status = scheduler.snapshot();
        tracing::info!(
            ok = status.successful_fetches,
            failed = status.failed_fetches,
            "One-shot poll complete"
        );
        return Ok(());
    }

    tokio::select! {
        _ = scheduler.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    Ok(())
}
