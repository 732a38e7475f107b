//! braid service binary.
//!
//! Loads configuration from the environment (with clap overrides), runs
//! migrations, and spawns the worker pool. SIGINT starts a drain: workers
//! finish their in-flight delivery and stop pulling.

use std::process;
use std::sync::Arc;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use braid::broker::postgres::PgQueue;
use braid::config::BraidConfig;
use braid::store::postgres::PgStateStore;
use braid::worker::Worker;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Parser)]
#[command(name = "braid", about = "Deduplicating email threading service")]
struct Args {
    /// Override the number of worker tasks.
    #[arg(long)]
    workers: Option<usize>,
    /// Override DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() {
    braid::init_logger();
    let args = Args::parse();

    let mut config = match BraidConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            log::error!("configuration error: {}", err);
            process::exit(1);
        }
    };
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(database_url) = args.database_url {
        config.database_url = database_url;
    }
    if let Err(err) = config.validate() {
        log::error!("configuration error: {}", err);
        process::exit(1);
    }

    if let Err(err) = run(config).await {
        log::error!("fatal: {}", err);
        process::exit(1);
    }
}

async fn run(config: BraidConfig) -> Result<(), Box<dyn std::error::Error>> {
    let pool = PgPoolOptions::new()
        .max_connections((config.workers * 2).max(5) as u32)
        .connect(&config.database_url)
        .await?;

    log::info!("checking database migration state");
    MIGRATOR.run(&pool).await?;

    let store = Arc::new(PgStateStore::new(pool.clone(), config.store_timeout));
    let queue = Arc::new(PgQueue::new(pool.clone()));

    // One epoch per process run; dedup entries record which run claimed
    // them, which is what post-mortems of a crashed claimant need.
    let worker_epoch = Uuid::new_v4();
    let shutdown = CancellationToken::new();

    log::info!(
        "starting {} workers (epoch {})",
        config.workers,
        worker_epoch
    );

    let mut handles = Vec::with_capacity(config.workers);
    for id in 0..config.workers {
        let worker = Worker::new(
            id,
            Arc::clone(&store),
            Arc::clone(&queue),
            worker_epoch,
            config.clone(),
        );
        handles.push(tokio::spawn(worker.run(shutdown.clone())));
    }

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown signal received, draining workers");
    shutdown.cancel();

    for handle in handles {
        if let Err(err) = handle.await {
            log::error!("worker task panicked: {}", err);
        }
    }

    pool.close().await;
    log::info!("shutdown complete");
    Ok(())
}
