mod cmd;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use shelver_lib::consts::DEFAULT_REGISTRY_FILE;

use cmd::{BuildArgs, Global};

/// shelver - build machine images in dependency order
#[derive(Parser)]
#[command(name = "shelver")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Registry file
  #[arg(short = 'c', long = "config", global = true, default_value = DEFAULT_REGISTRY_FILE)]
  config: PathBuf,

  /// Directory templates and archive sources are relative to (default: the registry's directory)
  #[arg(short = 'd', long, global = true)]
  base_dir: Option<PathBuf>,

  /// Archive cache directory (default: <base-dir>/.shelver/cache)
  #[arg(long, global = true)]
  cache_dir: Option<PathBuf>,

  /// Directory for rendered requests and user data (default: <base-dir>/.shelver/tmp)
  #[arg(long, global = true)]
  tmp_dir: Option<PathBuf>,

  /// Directory for per-image builder logs (default: <base-dir>/.shelver/log)
  #[arg(long, global = true)]
  log_dir: Option<PathBuf>,

  /// Keep the run's tmp directory after the run
  #[arg(long, global = true)]
  keep_tmp: bool,

  /// Image builder command; `build -machine-readable <file>` is appended
  #[arg(long, global = true, default_value = "packer")]
  builder_cmd: String,

  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build images and everything they are based on
  Build(BuildArgs),

  /// Show the build order and resolved configuration without building
  Plan {
    /// Images to plan; glob patterns allowed (default: all)
    patterns: Vec<String>,

    /// Output as JSON
    #[arg(long)]
    json: bool,
  },

  /// List artifacts recorded by previous runs
  List {
    /// Output as JSON
    #[arg(long)]
    json: bool,
  },
}

fn main() -> Result<ExitCode> {
  let cli = Cli::parse();

  let filter = if cli.verbose {
    EnvFilter::new("debug")
  } else {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
  };
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let global = Global {
    config: cli.config,
    base_dir: cli.base_dir,
    cache_dir: cli.cache_dir,
    tmp_dir: cli.tmp_dir,
    log_dir: cli.log_dir,
    keep_tmp: cli.keep_tmp,
    builder_cmd: cli.builder_cmd,
  };

  let success = match cli.command {
    Commands::Build(args) => cmd::cmd_build(&global, &args)?,
    Commands::Plan { patterns, json } => cmd::cmd_plan(&global, &patterns, json).map(|_| true)?,
    Commands::List { json } => cmd::cmd_list(&global, json).map(|_| true)?,
  };

  Ok(if success { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
