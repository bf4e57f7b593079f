//! `arpet-share`: runs one anchor-sharing session from the terminal.
//!
//! # Usage
//!
//! ```text
//! arpet-share [OPTIONS] <host|guest>
//!
//! Options:
//!   --config <PATH>         Config file [default: platform config dir]
//!   --device-name <NAME>    Name other devices see
//!   --transport <KIND>      tcp | wifi-direct
//!   --debug-timings         Short host visibility window
//! ```
//!
//! Every option can also be set through an environment variable
//! (`ARPET_CONFIG`, `ARPET_DEVICE_NAME`, `ARPET_TRANSPORT`,
//! `ARPET_DEBUG_TIMINGS`).  Command-line values win over the config file.
//!
//! While the session runs, type a command and press Enter:
//!
//! | Input      | Intent             |
//! |------------|--------------------|
//! | `c`        | `Continue`         |
//! | `t`        | `TryAgain`         |
//! | `p`        | `RetryPairing`     |
//! | `x`        | `CancelConnection` |
//! | `d`        | `DisconnectScreen` |
//! | `m`        | `ConnectedScreen`  |
//! | `q`        | `Cancel`           |
//!
//! Ctrl+C cancels the session.
//!
//! # Architecture overview
//!
//! ```text
//! stdin / Ctrl+C ──UserIntent──► SessionCoordinator ──SessionOutput──► stdout
//!                                   │            ▲
//!                       Transport (tcp | wifi-direct)
//!                       CloudAnchorService (offline)
//! ```

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use arpet_core::{Device, DeviceId};
use arpet_session::application::coordinator::{SessionCoordinator, SessionHandle};
use arpet_session::application::session::{SessionOutput, UserIntent};
use arpet_session::application::transport::Transport;
use arpet_session::infrastructure::cloud::OfflineCloudService;
use arpet_session::infrastructure::network::{TcpTransport, WifiDirectTransport};
use arpet_session::infrastructure::storage::config::{
    load_config, load_config_from, AppConfig, TransportKind,
};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Share an AR pet's world anchor with nearby devices.
#[derive(Debug, Parser)]
#[command(name = "arpet-share", version)]
struct Cli {
    /// Read settings from this TOML file instead of the platform config dir.
    #[arg(long, env = "ARPET_CONFIG")]
    config: Option<PathBuf>,

    /// Name other devices see.
    #[arg(long, env = "ARPET_DEVICE_NAME")]
    device_name: Option<String>,

    /// Link technology: `tcp` or `wifi-direct`.
    #[arg(long, env = "ARPET_TRANSPORT", value_parser = parse_transport)]
    transport: Option<TransportKind>,

    /// Use the short host visibility window.
    #[arg(long, env = "ARPET_DEBUG_TIMINGS")]
    debug_timings: bool,

    #[command(subcommand)]
    role: RoleCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
enum RoleCommand {
    /// Invite guests and host the shared anchor.
    Host,
    /// Find an inviting host and resolve its anchor.
    Guest,
}

fn parse_transport(value: &str) -> Result<TransportKind, String> {
    match value {
        "tcp" => Ok(TransportKind::Tcp),
        "wifi-direct" => Ok(TransportKind::WifiDirect),
        other => Err(format!("unknown transport {other:?}; expected tcp or wifi-direct")),
    }
}

impl Cli {
    /// Loads the config file and applies command-line overrides.
    fn resolve_config(&self) -> anyhow::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => load_config_from(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => load_config().context("failed to load config")?,
        };
        if let Some(name) = &self.device_name {
            config.network.device_name = name.clone();
        }
        if let Some(kind) = self.transport {
            config.network.transport = kind;
        }
        if self.debug_timings {
            config.session.debug_timings = true;
        }
        Ok(config)
    }
}

fn build_transport(config: &AppConfig) -> anyhow::Result<Arc<dyn Transport>> {
    Ok(match config.network.transport {
        TransportKind::Tcp => {
            let tcp = config
                .network
                .tcp_config()
                .context("invalid [network] settings")?;
            Arc::new(TcpTransport::new(tcp))
        }
        TransportKind::WifiDirect => Arc::new(WifiDirectTransport::new(Device::new(
            DeviceId::random(),
            config.network.device_name.clone(),
            "wifi-direct",
        ))),
    })
}

fn intent_for(line: &str) -> Option<UserIntent> {
    match line.trim() {
        "c" => Some(UserIntent::Continue),
        "t" => Some(UserIntent::TryAgain),
        "p" => Some(UserIntent::RetryPairing),
        "x" => Some(UserIntent::CancelConnection),
        "d" => Some(UserIntent::DisconnectScreen),
        "m" => Some(UserIntent::ConnectedScreen),
        "q" => Some(UserIntent::Cancel),
        _ => None,
    }
}

/// Forwards stdin commands to the session on a plain thread.
///
/// A blocking read cannot be cancelled, so it must not run on the runtime:
/// a detached thread lets the process exit while it still waits for input.
fn spawn_stdin_reader(handle: SessionHandle) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Handle::current();
    std::thread::Builder::new()
        .name("arpet-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                match intent_for(&line) {
                    Some(intent) => {
                        if runtime.block_on(handle.send(intent)).is_err() {
                            break;
                        }
                    }
                    None => warn!("unknown command {:?}", line.trim()),
                }
            }
        })
        .context("failed to start stdin reader")?;
    Ok(())
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.resolve_config()?;

    // `RUST_LOG` wins over the config file's level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let transport = build_transport(&config)?;
    let cloud = Arc::new(OfflineCloudService::new());
    let (coordinator, handle, mut outputs) = SessionCoordinator::new(
        config.session.settings(),
        config.session.reply_timeout(),
        Arc::clone(&transport),
        cloud,
    );
    info!(
        "arpet-share starting as {:?} on {} transport ({})",
        cli.role,
        transport.name(),
        transport.local_device()
    );
    let session = tokio::spawn(coordinator.run());

    // ── Ctrl+C ────────────────────────────────────────────────────────────────
    let cancel = handle.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, cancelling session");
                let _ = cancel.send(UserIntent::Cancel).await;
            }
            Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    spawn_stdin_reader(handle.clone())?;

    let first = match cli.role {
        RoleCommand::Host => UserIntent::Host,
        RoleCommand::Guest => UserIntent::Guest,
    };
    handle
        .send(first)
        .await
        .context("session closed before it started")?;

    while let Some(output) = outputs.recv().await {
        match output {
            SessionOutput::Screen(screen) => println!("screen: {screen:?}"),
            SessionOutput::BackToHub => println!("back to hub"),
            SessionOutput::SharingStarted { role, world_center } => {
                println!("sharing started as {role}, world center at {:?}", world_center.translation())
            }
            SessionOutput::SharingStopped => println!("sharing stopped"),
        }
    }

    let report = session.await.context("session task failed")?;
    info!("arpet-share finished: {report:?}");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
