//! persevere-bridge - runs the continuation schedulers next to a host runtime.
//!
//! The host spawns this process and talks NDJSON over stdin/stdout (see
//! `protocol`). Logs go to stderr.

mod bridge;
mod hook;
mod host;
mod protocol;

use std::path::PathBuf;

use clap::Parser;
use persevere::io::config::{DEFAULT_CONFIG_PATH, load_config};
use persevere::logging;
use tokio::io::BufReader;
use tracing::info;

#[derive(Parser)]
#[command(name = "persevere-bridge")]
#[command(about = "Keep agent sessions working: stdio bridge for host runtimes")]
struct Args {
    /// Project directory (contains .persevere/)
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,

    /// Config file (defaults to .persevere/config.toml in the project directory)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let project_dir = args.project_dir.canonicalize().unwrap_or(args.project_dir);
    let config_path = args
        .config
        .unwrap_or_else(|| project_dir.join(DEFAULT_CONFIG_PATH));
    let cfg = load_config(&config_path)?;
    logging::init(&cfg.log_level);
    info!(
        project_dir = %project_dir.display(),
        config = %config_path.display(),
        "starting persevere-bridge"
    );

    bridge::run(
        &cfg,
        &project_dir,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}
