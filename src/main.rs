//! Sandbox Terminal Relay
//!
//! Gives each dashboard terminal connection its own shell on a pseudo-terminal
//! and relays keystrokes, resizes and output over WebSocket.

mod config;
mod pty;
mod relay;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::RelayConfig;
use server::WebSocketServer;

/// Sandbox Terminal Relay
///
/// WebSocket terminal relay for the sandbox dashboard
#[derive(Parser, Debug)]
#[command(name = "sandbox-relay")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Shell to launch for each session
    #[arg(long)]
    shell: Option<String>,

    /// Maximum concurrent sessions (0 for no limit)
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Seconds without input before a session is closed (0 to disable)
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Command line flags win over the config file
    fn apply(&self, config: &mut RelayConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        if let Some(shell) = &self.shell {
            config.shell.program = Some(shell.clone());
        }
        if let Some(max_sessions) = self.max_sessions {
            config.sessions.max_sessions = max_sessions;
        }
        if let Some(idle_timeout) = self.idle_timeout {
            config.sessions.idle_timeout_secs = idle_timeout;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG takes precedence over --verbose
    let log_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Sandbox Terminal Relay v{}", env!("CARGO_PKG_VERSION"));

    let mut config = RelayConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    args.apply(&mut config);
    config.validate()?;

    match config.sessions.cap() {
        Some(cap) => info!("Session limit: {}", cap),
        None => info!("Session limit: none"),
    }
    if let Some(idle) = config.sessions.idle_timeout() {
        info!("Idle sessions close after {:?}", idle);
    }

    // Create and start the WebSocket server
    let server = Arc::new(WebSocketServer::new(config));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    // Run the server
    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_override_config() {
        let args = Args::parse_from([
            "sandbox-relay",
            "--port",
            "6000",
            "--shell",
            "/bin/sh",
            "--max-sessions",
            "0",
            "--idle-timeout",
            "30",
        ]);
        let mut config = RelayConfig::default();
        args.apply(&mut config);

        assert_eq!(config.server.port, 6000);
        assert_eq!(config.server.bind, crate::config::DEFAULT_BIND);
        assert_eq!(config.shell.program.as_deref(), Some("/bin/sh"));
        assert_eq!(config.sessions.cap(), None);
        assert_eq!(
            config.sessions.idle_timeout(),
            Some(std::time::Duration::from_secs(30))
        );
    }

    #[test]
    fn test_args_defaults_keep_config() {
        let args = Args::parse_from(["sandbox-relay"]);
        let mut config = RelayConfig::default();
        args.apply(&mut config);
        assert_eq!(config, RelayConfig::default());
        assert_eq!(args.config, PathBuf::from("relay.toml"));
    }
}
