//! Profile Store Server
//!
//! Run with: cargo run -- serve --config profilestore.toml
//!
//! # Configuration
//!
//! Settings come from, in increasing precedence: built-in defaults, the
//! config file, `PROFILESTORE_*` environment variables, then command-line
//! flags. `RUST_LOG` overrides the configured log level.

use anyhow::Context;
use clap::{Parser, Subcommand};
use profilestore::api::{serve, ApiConfig, AppState};
use profilestore::config::{generate_default_config, Config, LoggingConfig};
use profilestore::storage::{Storage, StorageConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "profilestore")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Storage engine for continuous profiling data")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default)
    Serve {
        /// Config file; searched in the default locations when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Data directory
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print a default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve {
        config: None,
        data_dir: None,
        host: None,
        port: None,
    }) {
        Commands::Serve {
            config,
            data_dir,
            host,
            port,
        } => {
            let mut config = match config {
                Some(path) => Config::load_with_env(&path)?,
                None => Config::load_default(),
            };
            if let Some(dir) = data_dir {
                config.storage.data_dir = dir;
            }
            if let Some(host) = host {
                config.api.host = host;
            }
            if let Some(port) = port {
                config.api.port = port;
            }

            init_tracing(&config.logging);
            run_server(config).await
        }
        Commands::Config { output } => {
            let content = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, content)
                        .with_context(|| format!("writing {}", path.display()))?;
                    eprintln!("Config written to {}", path.display());
                }
                None => print!("{}", content),
            }
            Ok(())
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "profilestore={},tower_http={}",
            logging.level, logging.level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting profile store v{}", env!("CARGO_PKG_VERSION"));

    let storage_config = StorageConfig::from(&config.storage);
    let api_config = ApiConfig::from(&config.api);
    tracing::info!("Data directory: {:?}", storage_config.data_dir);

    let storage = Arc::new(Storage::new(storage_config).context("opening storage")?);
    let eviction = storage.start_background_eviction();

    let state = AppState::new(Arc::clone(&storage), api_config.clone());
    let served = serve(state, &api_config).await;

    // Storage is closed even when the server failed
    tracing::info!("Shutting down storage...");
    eviction.abort();
    storage.close().context("closing storage")?;
    served?;

    tracing::info!("Profile store stopped");
    Ok(())
}
