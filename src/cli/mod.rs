pub mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::tasks::TaskRegistry;

#[derive(Parser)]
#[command(name = "arkflow", about = "Archival workflow engine", version)]
struct Cli {
    /// Path to a YAML config file (defaults to ./arkflow.yaml if present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the chunked-upload receiving server.
    Serve {
        #[arg(long, env = "ARKFLOW_HOST")]
        host: Option<String>,
        #[arg(long, env = "ARKFLOW_PORT")]
        port: Option<u16>,
        /// Directory uploads are assembled in.
        #[arg(long, env = "ARKFLOW_UPLOAD_DIR")]
        dir: Option<PathBuf>,
    },
    /// List registered task names with their queue hints.
    Tasks,
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    let file_config = config::ArkflowConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { host, port, dir } => {
            let host = host
                .or(file_config.host.clone())
                .unwrap_or_else(|| "127.0.0.1".to_string());
            let port = port.or(file_config.port).unwrap_or(8420);
            let dir = dir
                .or(file_config.upload_dir.clone().map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("uploads"));

            crate::api::serve(&host, port, dir).await
        }

        Command::Tasks => {
            let registry = TaskRegistry::with_builtins();
            for (name, queue) in registry.list() {
                println!("{:<45} queue={}", name, queue);
            }
            Ok(())
        }
    }
}
