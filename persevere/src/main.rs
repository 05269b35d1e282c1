//! Command-line access to the persisted iteration loop.
//!
//! Inspect, start, cancel or complete the loop recorded under `.persevere/`
//! without a host runtime attached, and write a default config file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use persevere::core::types::{PromptRequest, Todo, Toast, TranscriptEntry};
use persevere::delivery::Delivery;
use persevere::dispatch::EventDispatcher;
use persevere::exit_codes;
use persevere::io::config::{DEFAULT_CONFIG_PATH, PluginConfig, load_config, write_config};
use persevere::io::host::Host;
use persevere::io::loop_state::{FileLoopStore, LoopState};
use persevere::iteration::{IterationLoop, LoopError};
use persevere::logging;

#[derive(Parser)]
#[command(
    name = "persevere",
    version,
    about = "Inspect and drive the persisted iteration loop"
)]
struct Cli {
    /// Config file (missing file means defaults).
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the active loop, if any.
    Status,
    /// Start a loop owned by a session.
    Start {
        #[arg(long)]
        session: String,
        /// Iteration ceiling (defaults to `default_max_iterations`).
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Task text.
        prompt: String,
    },
    /// Stop the active loop without completing it.
    Cancel {
        #[arg(long)]
        session: String,
    },
    /// Mark the active loop complete.
    Complete {
        #[arg(long)]
        session: String,
        #[arg(long)]
        summary: Option<String>,
    },
    /// Write a config file with default values.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

/// Host stand-in for CLI use: status lines go to stdout, nothing else exists.
struct DetachedHost;

#[async_trait]
impl Host for DetachedHost {
    async fn fetch_todos(&self, _session_id: &str) -> Result<Vec<Todo>> {
        Ok(Vec::new())
    }

    async fn send_prompt(&self, request: PromptRequest) -> Result<()> {
        println!("{}", request.text);
        Ok(())
    }

    async fn show_toast(&self, _toast: Toast) -> Result<()> {
        Ok(())
    }

    async fn fetch_transcript(
        &self,
        _session_id: &str,
        _limit: usize,
    ) -> Result<Vec<TranscriptEntry>> {
        Ok(Vec::new())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let outcome = match cli.command {
        Command::InitConfig { force } => {
            logging::init("warn");
            cmd_init_config(&cli.config, force)?;
            return Ok(exit_codes::OK);
        }
        Command::Status => {
            match open_loop(&cli.config)?.status()? {
                Some(state) => print_state(&state),
                None => println!("no active loop"),
            }
            return Ok(exit_codes::OK);
        }
        Command::Start {
            session,
            max_iterations,
            prompt,
        } => open_loop(&cli.config)?
            .start_loop(&session, &prompt, max_iterations)
            .map(|state| print_state(&state)),
        Command::Cancel { session } => {
            open_loop(&cli.config)?
                .cancel_loop(&session)
                .await
                .map(|state| {
                    println!(
                        "cancelled loop {} at iteration {}/{}",
                        state.completion_marker, state.iteration, state.max_iterations
                    );
                })
        }
        Command::Complete { session, summary } => open_loop(&cli.config)?
            .complete_loop(&session, summary)
            .await
            .map(|_| ()),
    };

    match outcome {
        Ok(()) => Ok(exit_codes::OK),
        Err(LoopError::Storage(msg)) => bail!("{msg}"),
        Err(err) => {
            eprintln!("{err}");
            Ok(exit_codes::REJECTED)
        }
    }
}

/// Load config, start logging, and bind the loop to the configured state file.
fn open_loop(config_path: &Path) -> Result<IterationLoop> {
    let cfg = load_config(config_path)?;
    logging::init(&cfg.log_level);
    let store = FileLoopStore::new(cfg.state_path_in(Path::new(".")));
    // The CLI never evaluates; idle events only reach the bridge.
    let dispatcher = EventDispatcher::build(
        &cfg,
        Arc::new(DetachedHost),
        Arc::new(store),
        None,
        Delivery::Direct,
    );
    Ok(dispatcher.iteration().clone())
}

fn cmd_init_config(path: &Path, force: bool) -> Result<()> {
    if !force && path.exists() {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &PluginConfig::default())?;
    println!("wrote {}", path.display());
    Ok(())
}

fn print_state(state: &LoopState) {
    println!("loop {}", state.completion_marker);
    println!("session: {}", state.session_id);
    println!("iteration: {}/{}", state.iteration, state.max_iterations);
    println!("started_at: {}", state.started_at);
    println!("task:\n{}", state.prompt);
}
