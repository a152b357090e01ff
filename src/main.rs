use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

/// `ARKFLOW_LOG` wins over `RUST_LOG`; without either, engine spans log at
/// info and everything else stays quiet.
fn init_tracing() {
    let filter = std::env::var("ARKFLOW_LOG")
        .ok()
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("arkflow=info,warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    match arkflow::cli::run_cli().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
