//! braidctl: operator tooling for the braid pipeline.
//!
//! `enqueue` publishes a directory of raw records to the queue, `wait`
//! blocks until the queue drains, and `export` writes the assembled
//! threads to text files: one membership listing per thread, and every
//! root-to-leaf chain of the rebuilt trees.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;

use braid::broker::{MessageQueue, postgres::PgQueue};
use braid::models::QueueEnvelope;
use braid::store::{StateStore, postgres::PgStateStore};
use braid::threading;

#[derive(Parser)]
#[command(name = "braidctl", about = "Operator tooling for the braid pipeline")]
struct Args {
    /// Database URL; falls back to DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish every file in a directory to the queue, one record per
    /// file, in filename order.
    Enqueue {
        /// Directory of raw email records.
        dir: PathBuf,
    },
    /// Block until the queue is empty.
    Wait {
        /// Poll interval in milliseconds.
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    /// Write thread listings and hierarchy chains to an output directory.
    Export {
        /// Output directory for canonical_threads.txt and
        /// hierarchical_structure.txt.
        #[arg(long, default_value = "docs")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    braid::init_logger();
    let args = Args::parse();

    if let Err(err) = run(args).await {
        log::error!("braidctl: {}", err);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let database_url = match args.database_url {
        Some(url) => url,
        None => std::env::var("DATABASE_URL")
            .map_err(|_| "DATABASE_URL is not set and --database-url was not given")?,
    };

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    match args.command {
        Command::Enqueue { dir } => enqueue(&PgQueue::new(pool), &dir).await,
        Command::Wait { interval_ms } => {
            wait(&PgQueue::new(pool), Duration::from_millis(interval_ms)).await
        }
        Command::Export { out } => {
            export(
                &PgStateStore::new(pool, Duration::from_secs(30)),
                &out,
            )
            .await
        }
    }
}

async fn enqueue(queue: &PgQueue, dir: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    let mut published = 0usize;
    for path in paths {
        let source_id = match path.file_name().and_then(|name| name.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        // Raw records are not guaranteed to be valid UTF-8; lossy
        // decoding matches what the normalizer tolerates downstream.
        let raw = String::from_utf8_lossy(&std::fs::read(&path)?).into_owned();

        queue.enqueue(&QueueEnvelope { source_id: source_id.clone(), raw }).await?;
        log::info!("enqueued {}", source_id);
        published += 1;
    }

    log::info!("published {} records", published);
    Ok(())
}

async fn wait(queue: &PgQueue, interval: Duration) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        let pending = queue.pending_count().await?;
        if pending == 0 {
            log::info!("queue is empty");
            return Ok(());
        }
        log::info!("{} messages pending", pending);
        tokio::time::sleep(interval).await;
    }
}

async fn export(store: &PgStateStore, out: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(out)?;

    let mut listings = Vec::new();
    let mut chains = Vec::new();

    for key in store.list_thread_keys().await? {
        let Some(doc) = store.get_thread(&key).await? else {
            continue;
        };

        listings.push(format!("{}:", key));
        for member_id in doc.members.keys() {
            listings.push(format!("\t- {}", member_id));
        }

        let tree = threading::rebuild(&doc.members);
        for chain in tree.chains() {
            chains.push(chain.join(" -> "));
        }
    }

    std::fs::write(out.join("canonical_threads.txt"), listings.join("\n"))?;
    let mut hierarchy = chains.join("\n");
    if !hierarchy.is_empty() {
        hierarchy.push('\n');
    }
    std::fs::write(out.join("hierarchical_structure.txt"), hierarchy)?;

    log::info!("export written to {}", out.display());
    Ok(())
}
