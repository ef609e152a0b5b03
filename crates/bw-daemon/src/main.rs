//! breakwater entrypoint.

#![forbid(unsafe_code)]

use clap::Parser;

use bw_daemon::cli;
use bw_daemon::config::{Cli, Command};
use bw_daemon::run;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so command output stays clean on stdout.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Daemon(args) => run::run_daemon(args).await,
        Command::Listlimits(args) => cli::list_limits(&args).await,
        Command::Updatelimit(args) => cli::update_limit(&args).await,
        Command::Clearlimit(args) => cli::clear_limit(&args).await,
        Command::Updatedefaultlimit(args) => cli::update_default_limit(&args).await,
    }
}
