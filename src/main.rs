use anyhow::Context;
use clap::{Parser, Subcommand};
use engram_runtime::{EngramRuntime, RuntimeConfig};

#[derive(Parser)]
#[command(name = "engram", version, about = "Bitemporal memory substrate for AI coding agents")]
struct Cli {
    /// Path to a TOML config file; environment variables apply otherwise.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline: ingestor, parser, aggregator, and indexer.
    Run {
        /// Run entirely in memory with mock embedders (no external services).
        #[arg(long)]
        in_memory: bool,
    },
    /// Validate configuration and backend connectivity, then exit.
    Check,
}

fn load_config(path: Option<&str>) -> anyhow::Result<RuntimeConfig> {
    match path {
        Some(path) => RuntimeConfig::load(path).context("loading config file"),
        None => RuntimeConfig::from_env().context("resolving config from environment"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run { in_memory } => {
            let runtime = if in_memory {
                EngramRuntime::in_memory(config).await?
            } else {
                EngramRuntime::connect(config).await?
            };
            let handles = runtime.start().await?;
            tracing::info!("Pipeline running; ctrl-c to stop");

            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            for handle in handles {
                handle.abort();
            }
            runtime.shutdown().await?;
        }
        Command::Check => {
            let runtime = EngramRuntime::connect(config).await?;
            runtime.shutdown().await?;
            println!("ok");
        }
    }
    Ok(())
}
