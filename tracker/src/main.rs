//! wakatrack - editor heartbeat tracking client.
//!
//! This binary lets editors without an in-process integration report
//! activity: they write newline-delimited JSON events to its stdin and the
//! tracker turns them into heartbeats.
//!
//! # Commands
//!
//! - `wakatrack run`: Read editor events from stdin and send heartbeats
//! - `wakatrack check`: Validate configuration
//! - `wakatrack resolve <PATH>`: Show the project detected for a file
//!
//! # Configuration
//!
//! See the [`config`](wakatrack::config) module for available options.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wakatrack::config::{default_config_path, TrackerConfig};
use wakatrack::coordinator::TrackingCoordinator;
use wakatrack::project::ProjectResolver;
use wakatrack::types::EditorEvent;

/// wakatrack - editor heartbeat tracking client.
///
/// Turns editor activity into rate-limited heartbeats and delivers them to a
/// WakaTime-compatible endpoint.
#[derive(Parser, Debug)]
#[command(name = "wakatrack")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    WAKATRACK_ENABLED              Enable tracking (true/false)
    WAKATRACK_API_KEY              API key (falls back to WAKATIME_API_KEY)
    WAKATRACK_API_URL              Heartbeat endpoint
    WAKATRACK_PROJECT              Fixed project name
    WAKATRACK_HIDE_FILE_NAMES      Send HIDDEN instead of file paths
    WAKATRACK_HIDE_PROJECT_NAMES   Omit project names
    WAKATRACK_TIMEOUT              Request timeout in seconds (default: 30)

EVENT FORMAT (one JSON object per line on stdin):
    {\"kind\":\"edit\",\"path\":\"/repo/src/main.rs\",\"language\":\"rust\",
     \"cursor\":{\"lineno\":12,\"cursorpos\":4},\"lines\":80}

    kind is one of: open, edit, save, cursor_move

EXAMPLES:
    # Validate configuration
    wakatrack check

    # Show which project a file belongs to
    wakatrack resolve src/main.rs

    # Track events produced by an editor plugin
    editor-plugin | wakatrack run
")]
struct Cli {
    /// Configuration file (default: platform config dir, wakatrack/config.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Read editor events from stdin and send heartbeats.
    ///
    /// Stops at end of input or on Ctrl+C, then flushes pending heartbeats.
    Run,

    /// Load and validate configuration.
    Check,

    /// Print the project detected for a file.
    Resolve {
        /// File to resolve.
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging();

    match cli.command {
        Command::Check => run_check(cli.config.as_deref()),
        Command::Resolve { path } => run_resolve(cli.config.as_deref(), &path),
        Command::Run => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to create tokio runtime")?;

            runtime.block_on(run_tracker(cli.config))
        }
    }
}

/// Runs the check command.
fn run_check(config_path: Option<&Path>) -> Result<()> {
    let config = TrackerConfig::load(config_path).context("Failed to load configuration")?;

    let source = config_path
        .map(Path::to_path_buf)
        .or_else(|| default_config_path().filter(|p| p.is_file()));
    match source {
        Some(path) => println!("Configuration file: {}", path.display()),
        None => println!("Configuration file: (none, using defaults and environment)"),
    }

    println!();
    println!("  enabled:            {}", config.enabled);
    println!(
        "  api key:            {}",
        config
            .api_key
            .as_ref()
            .map_or_else(|| "(not set)".to_string(), |k| k.masked())
    );
    println!("  api url:            {}", config.api_url);
    println!(
        "  project override:   {}",
        config.project.as_deref().unwrap_or("(detect)")
    );
    println!("  hide file names:    {}", config.hide_file_names);
    println!("  hide project names: {}", config.hide_project_names);
    println!("  timeout:            {}s", config.timeout);
    println!("  debounce window:    {}s", config.debounce_secs);
    println!();

    config.validate().context("Configuration cannot start tracking")?;
    println!("Configuration OK");

    Ok(())
}

/// Runs the resolve command.
fn run_resolve(config_path: Option<&Path>, path: &Path) -> Result<()> {
    let config = TrackerConfig::load(config_path).context("Failed to load configuration")?;

    let path = std::path::absolute(path)
        .with_context(|| format!("Failed to resolve {}", path.display()))?;

    let mut resolver = ProjectResolver::new(config.project);
    let info = resolver.resolve(&path);

    match (info.name, info.root) {
        (Some(name), Some(root)) => println!("{name} ({})", root.display()),
        (Some(name), None) => println!("{name} (configured)"),
        (None, Some(root)) => println!("(unnamed) ({})", root.display()),
        (None, None) => println!("No project found for {}", path.display()),
    }

    Ok(())
}

/// Runs the tracker until stdin closes or a shutdown signal arrives.
async fn run_tracker(config_path: Option<PathBuf>) -> Result<()> {
    info!("Starting wakatrack");

    let config =
        TrackerConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
    let mut tracker =
        TrackingCoordinator::start(config).context("Failed to start heartbeat tracking")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    info!("Reading editor events from stdin");

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }

            line = lines.next_line() => match line {
                Ok(Some(line)) => process_line(&mut tracker, &line),
                Ok(None) => {
                    info!("Event stream closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read event stream");
                    break;
                }
            }
        }
    }

    info!("Shutting down...");

    let report = tracker.shutdown().await;

    if report.unsent > 0 {
        error!(
            unsent_heartbeats = report.unsent,
            "Some heartbeats could not be sent"
        );
    }

    info!("wakatrack stopped");
    Ok(())
}

/// Parses one event line and hands it to the coordinator.
fn process_line(tracker: &mut TrackingCoordinator, line: &str) {
    if line.trim().is_empty() {
        return;
    }

    match EditorEvent::from_json_line(line) {
        Ok(event) => {
            tracker.handle_event(event);
        }
        Err(e) => warn!(error = %e, "Skipping malformed event"),
    }
}

/// Initializes the logging subsystem.
///
/// Logs go to stderr so they never mix with command output.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .init();
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
