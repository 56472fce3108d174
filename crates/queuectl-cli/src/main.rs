mod cli;
mod commands;
mod table;

use clap::Parser;
use cli::Cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(level_to_directive(&cli.log_level).into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if let Err(e) = commands::run(cli).await {
        eprintln!("✗ Error: {e}");
        std::process::exit(1);
    }
}

fn level_to_directive(level: &str) -> tracing::Level {
    level.to_uppercase().parse().unwrap_or(tracing::Level::INFO)
}
