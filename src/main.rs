mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use latentdict::{config, server};

#[derive(Parser)]
#[command(name = "latentdict", version, about = "3D word-embedding projections for word-relationship visualization")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server
    Serve {
        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Project words into 3D and print the result as JSON
    Project {
        /// Words to project
        #[arg(required = true)]
        words: Vec<String>,
        /// Fit a basis on these highlight words (repeatable)
        #[arg(long = "fit")]
        fit: Vec<String>,
        /// Reuse a basis id returned by an earlier call
        #[arg(long)]
        basis: Option<String>,
        /// Use the default basis regardless of --fit / --basis
        #[arg(long)]
        reset: bool,
    },
    /// Embed the default corpus into the cache ahead of the first request
    Warm {
        /// Discard the stored default basis and fit it again
        #[arg(long)]
        refit: bool,
    },
    /// Run cache diagnostics
    Doctor,
    /// Manage the embedding model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the embedding model to ~/.latentdict/models/
    Download,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config (for log level)
    let mut config = config::AppConfig::load()?;

    // Log to stderr so stdout stays clean for `project` JSON output.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            server::serve(config).await?;
        }
        Command::Project {
            words,
            fit,
            basis,
            reset,
        } => {
            let args = cli::project::ProjectArgs {
                words,
                fit,
                basis,
                reset,
            };
            tokio::task::spawn_blocking(move || cli::project::project(&config, args)).await??;
        }
        Command::Warm { refit } => {
            tokio::task::spawn_blocking(move || cli::warm::warm(&config, refit)).await??;
        }
        Command::Doctor => {
            cli::doctor::doctor(&config)?;
        }
        Command::Model { action } => match action {
            ModelAction::Download => {
                cli::model_download(&config.embedding).await?;
            }
        },
    }

    Ok(())
}
