use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = kiln_core::cli::Cli::parse();

    // Load .env from CWD, falling back to the executable's directory
    if dotenvy::dotenv().is_err() {
        let _ = dotenvy::from_path(kiln_core::config::exe_dir().join(".env"));
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match cli.command {
        None => kiln_core::run_host().await,
        Some(cmd) => kiln_core::cli::dispatch(cmd).await,
    }
}
