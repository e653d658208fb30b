mod api_client;
mod catalog;
mod config;
mod context;
mod credentials;
mod dispatcher;
mod logging;
mod matching;
mod store;
mod sync;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::{Result, eyre::Context};

use crate::{
    config::Config, context::AppContext, dispatcher::MemoryBroker, logging::init_tracing,
    store::MemoryStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The config file to use
    #[arg(short, long, env = "PLAYLIST_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Console log level
    #[arg(long, default_value = "info", global = true, env = "LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sync workers
    Serve {
        /// Number of sync workers (overrides the config file)
        #[arg(short, long, env = "PLAYLIST_SYNC_WORKERS")]
        workers: Option<usize>,
    },
    /// Print the path to the config file
    ConfigPath,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let mut config = {
        if let Some(config) = args.config {
            Config::from_file(&config)
        } else {
            Config::load()
        }
    }
    .with_context(|| "Failed to load playlist-sync config")?;

    match args.command {
        Commands::Serve { workers } => {
            if let Some(workers) = workers {
                config.sync.workers = workers;
            }

            let kv = Arc::new(MemoryStore::new());
            let broker = Arc::new(MemoryBroker::new(config.visibility_timeout()));
            let context = AppContext::new(&config, kv, broker);

            tracing::info!(workers = config.sync.workers, "starting sync workers");
            let handles = context.start_workers();

            tokio::signal::ctrl_c()
                .await
                .wrap_err("Failed to listen for shutdown signal")?;
            tracing::info!("shutting down");
            for handle in handles {
                handle.abort();
            }
            // Give in-flight tasks a moment to hit their cancellation points.
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Commands::ConfigPath => match Config::config_path() {
            Some(path) => println!("{}", path.display()),
            None => println!("No default config path found"),
        },
    }

    Ok(())
}
