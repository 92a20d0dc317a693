use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use feedsync::config::Config;
use feedsync::feed::build_client;
use feedsync::storage::Database;
use feedsync::sync::Engine;
use feedsync::tasks::queue::{CursorPayload, ImportPayload};
use feedsync::tasks::{self, Task, Worker};

/// Bytes read from an OPML file before giving up.
const MAX_IMPORT_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "feedsync", about = "Feed synchronization engine for RSS/Atom feeds")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, value_name = "FILE", default_value = "feedsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the hub callback, the task worker and the periodic sweeps
    Serve,
    /// Queue a poll for every due feed once
    UpdateFeeds,
    /// Start a retention sweep over feeds nobody reads
    DeleteOldFeeds,
    /// Queue an OPML import for a user
    Import {
        #[arg(long)]
        user: String,
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    let db = Database::open(&config.database_path)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_path))?;
    let client = build_client(&config.fetch).context("Failed to build HTTP client")?;
    let engine = Engine::new(db, client, config);

    match args.command {
        Command::Serve => serve(engine).await,
        Command::UpdateFeeds => {
            let queued = tasks::update_feeds(&engine, Utc::now()).await?;
            println!("Queued {queued} feed updates");
            Ok(())
        }
        Command::DeleteOldFeeds => {
            let sweep =
                tasks::delete_old_feeds(&engine, &CursorPayload::default(), Utc::now()).await?;
            println!("Queued {} old feed deletions", sweep.queued);
            Ok(())
        }
        Command::Import { user, file } => {
            let meta = std::fs::metadata(&file)
                .with_context(|| format!("Failed to read import file: {}", file.display()))?;
            if meta.len() > MAX_IMPORT_BYTES {
                anyhow::bail!("Import file is larger than {MAX_IMPORT_BYTES} bytes");
            }
            let document = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read import file: {}", file.display()))?;
            let task = Task::ImportOpml(ImportPayload {
                user,
                document,
                skip: 0,
            });
            tasks::enqueue(&engine.db, &task, Utc::now()).await?;
            println!("Import queued");
            Ok(())
        }
    }
}

/// Run every long-lived loop until one of them fails or Ctrl-C arrives.
async fn serve(engine: Engine) -> Result<()> {
    let worker_cfg = engine.config.worker.clone();

    let update_sweep = periodic(
        engine.clone(),
        Duration::from_secs(worker_cfg.update_sweep_secs),
        "update",
        |engine| async move { tasks::update_feeds(&engine, Utc::now()).await.map(drop) },
    );
    let retention_sweep = periodic(
        engine.clone(),
        Duration::from_secs(worker_cfg.retention_sweep_secs),
        "retention",
        |engine| async move {
            tasks::delete_old_feeds(&engine, &CursorPayload::default(), Utc::now())
                .await
                .map(drop)
        },
    );
    let task_cleanup = periodic(
        engine.clone(),
        Duration::from_secs(3600),
        "task cleanup",
        |engine| async move { tasks::purge_tasks(&engine, Utc::now()).await.map(drop) },
    );

    tokio::select! {
        result = feedsync::web::serve(engine.clone()) => result,
        () = Worker::new(engine.clone()).run() => Ok(()),
        () = update_sweep => Ok(()),
        () = retention_sweep => Ok(()),
        () = task_cleanup => Ok(()),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            Ok(())
        }
    }
}

async fn periodic<F, Fut>(engine: Engine, every: Duration, name: &'static str, run: F)
where
    F: Fn(Engine) -> Fut,
    Fut: std::future::Future<Output = Result<(), tasks::TaskError>>,
{
    let mut interval = tokio::time::interval(every.max(Duration::from_secs(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(e) = run(engine.clone()).await {
            tracing::warn!(sweep = name, error = %e, "Periodic sweep failed");
        }
    }
}
