mod cmd;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

/// Event-driven package repository updater
///
/// Applies package additions and removals to the RPM or Debian
/// repository metadata stored next to them in an object store.
#[derive(Parser)]
#[command(name = "repofresh", max_term_width = 80)]
struct Args {
    #[command(subcommand)]
    command: cmd::Command,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    cmd::run(args.command).await
}
