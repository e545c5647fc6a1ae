//! `tt` — task automation with incremental execution.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tasktree::cli::Cli;

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("tasktree={}", cli.log_level).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    if let Err(e) = tasktree::cli::dispatch(cli) {
        eprintln!("error: {}", e);
        std::process::exit(e.exit_code());
    }
}
