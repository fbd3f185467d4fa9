mod backend;
mod cache;
mod commands;
mod config;
mod db;
mod event;
mod message;
mod sync;
#[cfg(test)]
mod testing;
mod worker;

use clap::Parser;
use color_eyre::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use backend::client::HttpTransport;

#[derive(Parser, Debug)]
#[command(name = "visto-offline")]
#[command(about = "Offline cache and background sync for the vistoGEST point of sale")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/visto-offline/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Debug logging
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Also write a daily rolling log file into this directory
  #[arg(long, global = true)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.verbose, args.log_dir.as_deref());

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  let storage = db::Database::open(&config.database_path()?)?;
  let transport = HttpTransport::new()?;
  let worker = Arc::new(worker::Worker::new(config, storage, transport)?);

  commands::execute(args.command, worker).await
}

/// Logs go to stderr; stdout carries command output.
fn init_logging(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
    EnvFilter::new(if verbose {
      "visto_offline=debug,info"
    } else {
      "info"
    })
  });

  let (file_layer, guard) = match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "visto-offline.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (
        Some(fmt::layer().with_ansi(false).with_writer(writer)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(
      fmt::layer()
        .with_target(verbose)
        .with_writer(std::io::stderr),
    )
    .with(file_layer)
    .init();

  guard
}
