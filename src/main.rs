mod commands;

use clap::Parser;
use color_eyre::Result;
use rescache::config::Config;
use rescache::logging;
use rescache::rest::ResourceRegistry;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rescache")]
#[command(about = "Query REST collection resources through a client-side cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/rescache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Write logs to a daily-rolling file in this directory instead of stderr
  #[arg(long)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.log_dir.as_deref())?;

  let config = Config::load(args.config.as_deref())?;
  let registry = ResourceRegistry::new(&config)?;

  let output = commands::execute(&registry, args.command).await?;
  println!("{}", serde_json::to_string_pretty(&output)?);

  Ok(())
}
