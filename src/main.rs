use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ollamad")]
#[command(version)]
#[command(about = "Run large language models locally", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon.
    Serve {
        /// Bind address, overriding OLLAMA_HOST.
        #[arg(long)]
        host: Option<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { host } => {
            let addr = host.unwrap_or_else(ollamad::envconfig::host);
            ollamad::server::serve(addr).await
        }
    }
}
