//! Operator CLI: run the server, check a running instance, export or
//! replay persisted events.
//!
//! Exit codes: 0 clean shutdown, 1 fatal error, 2 unrecoverable
//! configuration problem.

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::{DateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use devlens_config::DevlensConfig;
use devlens_core::store::{EventFilter, EventStore};
use devlens_model::EventCategory;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "devlensctl", about = "devlens operator CLI", version)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the devlens server in the foreground.
    Start,
    /// Query a running server for its health and project status.
    Status {
        /// Base URL of the running server; defaults to the configured bind.
        #[arg(long)]
        url: Option<String>,
    },
    /// Dump persisted events as JSON lines.
    ExportEvents {
        /// Inclusive lower bound, milliseconds since epoch.
        #[arg(long)]
        from: Option<i64>,
        /// Inclusive upper bound, milliseconds since epoch.
        #[arg(long)]
        to: Option<i64>,
        /// Restrict to one category.
        #[arg(long)]
        category: Option<String>,
        #[arg(long, default_value_t = 10_000)]
        limit: u32,
    },
    /// Re-read persisted events in publish order (a dry-run re-emission).
    Replay {
        /// Start of the replayed window, milliseconds since epoch.
        #[arg(long)]
        since: i64,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match DevlensConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start tokio runtime: {err}");
            return ExitCode::from(1);
        }
    };

    let result = match cli.command {
        Command::Start => {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_filter.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();
            runtime.block_on(devlens_server::serve(config))
        }
        Command::Status { url } => runtime.block_on(status(&config, url)),
        Command::ExportEvents { from, to, category, limit } => {
            runtime.block_on(export_events(&config, from, to, category, limit))
        }
        Command::Replay { since } => runtime.block_on(replay(&config, since)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn status(config: &DevlensConfig, url: Option<String>) -> anyhow::Result<()> {
    let base = url.unwrap_or_else(|| format!("http://{}", config.server.bind));
    let client = reqwest::Client::new();

    let health: serde_json::Value = client
        .get(format!("{base}/health"))
        .send()
        .await?
        .json()
        .await?;
    let project: serde_json::Value = client
        .get(format!("{base}/api/v1/status"))
        .send()
        .await?
        .json()
        .await?;

    println!("{}", serde_json::to_string_pretty(&serde_json::json!({
        "health": health,
        "project": project,
    }))?);
    Ok(())
}

fn ms(value: i64) -> anyhow::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(value)
        .single()
        .ok_or_else(|| anyhow::anyhow!("timestamp out of range: {value}"))
}

async fn export_events(
    config: &DevlensConfig,
    from: Option<i64>,
    to: Option<i64>,
    category: Option<String>,
    limit: u32,
) -> anyhow::Result<()> {
    let store = EventStore::open(config.runtime.storage.clone()).await?;
    let from = match from {
        Some(value) => ms(value)?,
        None => Utc.timestamp_millis_opt(0).unwrap(),
    };
    let to = match to {
        Some(value) => ms(value)?,
        None => Utc::now(),
    };
    let mut filter = EventFilter {
        limit: Some(limit),
        ..Default::default()
    };
    if let Some(category) = category {
        let parsed = EventCategory::parse(&category).ok_or_else(|| {
            anyhow::anyhow!("unknown category: {category}")
        })?;
        filter.categories.push(parsed);
    }

    let events = store.find_by_time_range(from, to, &filter).await?;
    for event in &events {
        println!("{}", serde_json::to_string(event)?);
    }
    eprintln!("exported {} events", events.len());
    store.close().await;
    Ok(())
}

async fn replay(config: &DevlensConfig, since: i64) -> anyhow::Result<()> {
    let store = EventStore::open(config.runtime.storage.clone()).await?;
    let events = store
        .find_by_time_range(ms(since)?, Utc::now(), &EventFilter::default())
        .await?;

    let mut previous: Option<i64> = None;
    for event in &events {
        let gap_ms = previous
            .map(|prev| event.timestamp_ms() - prev)
            .unwrap_or(0);
        previous = Some(event.timestamp_ms());
        println!(
            "{}",
            serde_json::to_string(&serde_json::json!({
                "offsetMs": gap_ms,
                "event": event,
            }))?
        );
    }
    eprintln!("replayed {} events", events.len());
    store.close().await;
    Ok(())
}
