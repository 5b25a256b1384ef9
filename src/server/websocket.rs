//! WebSocket server implementation
//!
//! Listens for dashboard terminal connections and runs one relay session per
//! connection until the server is told to shut down.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::handler::{handle_connection, ConnectionContext};
use crate::config::{ListenConfig, RelayConfig};
use crate::relay::SessionTracker;

/// How long shutdown waits for sessions to terminate their shells
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// WebSocket server for the dashboard terminal
pub struct WebSocketServer {
    listen: ListenConfig,
    context: ConnectionContext,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    ///
    /// The shell's environment is resolved here, once, and reused for every
    /// session.
    pub fn new(config: RelayConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let context = ConnectionContext {
            spawn_spec: Arc::new(config.shell.spawn_spec()),
            tracker: Arc::new(SessionTracker::new(config.sessions.cap())),
            path: Arc::from(config.server.path.as_str()),
            idle_timeout: config.sessions.idle_timeout(),
        };

        Self {
            listen: config.server,
            context,
            shutdown_tx,
        }
    }

    /// Sessions currently admitted
    pub fn tracker(&self) -> &SessionTracker {
        &self.context.tracker
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.listen.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    ///
    /// Connections are handled concurrently. On shutdown every connection is
    /// closed, and this waits a bounded time for their shells to go away.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!("WebSocket server listening on ws://{}{}", addr, self.listen.path);

        let spec = &self.context.spawn_spec;
        info!(
            "Sessions run {} in {} with {} environment variables",
            spec.program,
            spec.cwd.display(),
            spec.env.len()
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let context = self.context.clone();
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, context, shutdown_rx).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        // Wait for active sessions to terminate their shells
        let tracker = self.tracker();
        let session_count = tracker.active_count();
        if session_count > 0 {
            info!("Waiting for {} active sessions to close...", session_count);
            if !tracker.wait_idle(SHUTDOWN_GRACE).await {
                warn!(
                    "{} sessions still open after {:?}",
                    tracker.active_count(),
                    SHUTDOWN_GRACE
                );
                for session in tracker.sessions() {
                    warn!(
                        "Session {} for {} ({}, pid {:?}) still open after {}s",
                        session.id,
                        session.peer,
                        session.shell,
                        session.pid,
                        session.uptime().as_secs()
                    );
                }
            }
        }

        Ok(())
    }
}
