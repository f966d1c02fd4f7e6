use std::path::PathBuf;

use clap::Parser;
use gatherd::scheduler::RUNTIME_RELEASE_TIMEOUT;
use gatherd::storage::{JsonLinesStorage, SqliteStorage, Storage};
use gatherd::{Agent, Config, Registry};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Host metrics agent with pluggable collectors", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "gatherd.toml")]
    config: PathBuf,

    /// Print the sample configuration of every plugin and exit
    #[arg(long)]
    sample_config: bool,

    /// List available plugins and exit
    #[arg(long)]
    list: bool,

    /// Gather every configured input once, print the result and exit
    #[arg(long)]
    test: bool,

    /// Print statistics of the configured SQLite output and exit
    #[arg(long)]
    stats: bool,

    /// Log filter, e.g. "debug" or "gatherd=trace"; RUST_LOG takes precedence
    #[arg(long, default_value = "gatherd=info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("gatherd: failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(run(args));
    // Dropping the runtime would wait on gathers the scheduler abandoned.
    runtime.shutdown_timeout(RUNTIME_RELEASE_TIMEOUT);

    if let Err(e) = result {
        eprintln!("gatherd: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let registry = Registry::builtin()?;

    if args.sample_config {
        print!("{}", registry.sample_config());
        return Ok(());
    }

    if args.list {
        for (name, description) in registry.descriptions() {
            println!("{:<10} {}", name, description);
        }
        return Ok(());
    }

    let config = Config::load(&args.config)?;

    if args.stats {
        let path = config.outputs.sqlite.clone().unwrap_or_else(SqliteStorage::default_path);
        show_stats(&SqliteStorage::new(Some(path)))?;
        return Ok(());
    }

    let agent = Agent::new(config, registry);

    if args.test {
        let measurements = agent.test().await?;
        if measurements.is_empty() {
            eprintln!("No measurements gathered");
        } else {
            JsonLinesStorage::stdout().store_measurements(measurements)?;
        }
        return Ok(());
    }

    tracing::info!(config = %args.config.display(), "gatherd starting");
    agent
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            }
        })
        .await?;
    Ok(())
}

fn show_stats(storage: &SqliteStorage) -> Result<(), Box<dyn std::error::Error>> {
    storage.initialize()?;
    let stats = storage.get_stats()?;

    println!("Database: {}", storage.path().display());
    println!("  Total measurements: {}", stats.total_measurements);
    println!("  Collection rounds: {}", stats.total_collection_rounds);

    if let Some(size) = stats.database_size_bytes {
        println!("  Database size: {:.2} KB", size as f64 / 1024.0);
    }

    if let Some(latest) = &stats.latest_collection {
        println!(
            "  Latest collection: {} ({} measurements)",
            latest.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            latest.measurements_count
        );
    }

    Ok(())
}
