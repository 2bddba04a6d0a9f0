//! navigator-daemon: keeps a vault's navigator cache in sync from the
//! command line.
//!
//! Runs the same engine a host editor would, against the native filesystem.
//! Prints the tag tree as JSON once the cache has settled.

use anyhow::Result;
use clap::Parser;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use navigator_daemon::watcher::{FileWatcher, WATCH_DEBOUNCE};
use navigator_daemon::{Daemon, DaemonConfig};

/// How often the settings file is checked for edits in watch mode.
const SETTINGS_POLL: Duration = Duration::from_secs(2);

/// Upper bound on waiting for the first pass to settle before printing.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Parser, Debug)]
#[command(name = "navigator-daemon")]
#[command(about = "Navigator cache sync daemon")]
struct Args {
    /// Path to the vault directory
    #[arg(short, long)]
    vault: String,

    /// Settings JSON (defaults to <vault>/.navigator/settings.json)
    #[arg(short, long)]
    settings: Option<String>,

    /// Discard the cache and regenerate everything
    #[arg(long)]
    rebuild: bool,

    /// Keep running and follow vault changes
    #[arg(short, long)]
    watch: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

fn print_tag_tree(daemon: &Daemon) -> Result<()> {
    let tree = daemon.context().tag_tree();
    println!("{}", serde_json::to_string_pretty(&*tree)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,navigator_core=debug,navigator_daemon=debug"
    } else {
        "info,navigator_core=info,navigator_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = DaemonConfig::load(&args.vault, args.settings.as_deref())?;
    info!("Starting navigator-daemon");
    info!("Vault path: {:?}", config.vault_path);
    if let Some(path) = &config.settings_path {
        info!("Settings: {:?}", path);
    }

    let mut daemon = Daemon::open(config).await?;
    daemon.start(args.rebuild).await?;
    match tokio::time::timeout(SETTLE_TIMEOUT, daemon.settle()).await {
        Ok(settled) => {
            settled?;
        }
        Err(_) => warn!(
            "Content still pending after {:?} ({} metadata wait(s))",
            SETTLE_TIMEOUT,
            daemon.context().metadata_queue().pending_count()
        ),
    }
    print_tag_tree(&daemon)?;

    if !args.watch {
        daemon.shutdown();
        return Ok(());
    }

    let mut watcher = FileWatcher::new(daemon.config().vault_path.clone(), WATCH_DEBOUNCE)?;
    let mut settings_poll = tokio::time::interval(SETTINGS_POLL);
    let mut tags = daemon.context().subscribe_tag_tree();
    tags.mark_unchanged();
    info!("Watching {:?}. Press Ctrl+C to stop.", watcher.vault_path());

    loop {
        tokio::select! {
            Some(batch) = watcher.event_rx().recv() => {
                let events = daemon.apply_fs_batch(&batch).await;
                info!("Applied {} vault event(s)", events.len());
            }

            _ = settings_poll.tick() => {
                daemon.reload_settings_if_changed();
            }

            changed = tags.changed() => {
                if changed.is_err() {
                    warn!("Tag tree channel closed");
                    break;
                }
                tags.mark_unchanged();
                print_tag_tree(&daemon)?;
            }

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    daemon.shutdown();
    Ok(())
}
