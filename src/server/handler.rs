//! WebSocket connection handler
//!
//! Runs one relay session per connection: handshake, admission, shell spawn,
//! then the event loop until either side goes away. The shell is terminated
//! on every exit path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::protocol::{check_input_len, ClientMessage, ErrorCode, ServerMessage};
use crate::pty::SpawnSpec;
use crate::relay::{Forwarder, Session, SessionInfo, SessionTracker};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Outbound event queue depth
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long to wait for an exited shell to be reaped
const EXIT_STATUS_WAIT: Duration = Duration::from_millis(500);

/// Read-only state shared by every connection
#[derive(Clone)]
pub struct ConnectionContext {
    /// Template every shell is spawned from
    pub spawn_spec: Arc<SpawnSpec>,
    pub tracker: Arc<SessionTracker>,
    /// Request path accepted for the upgrade
    pub path: Arc<str>,
    pub idle_timeout: Option<Duration>,
}

/// Handle a single WebSocket connection
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    ctx: ConnectionContext,
    shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    info!("New connection from {}", peer_addr);

    let path = Arc::clone(&ctx.path);
    let callback =
        move |request: &Request, response: Response| check_path(request, response, &path);
    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            warn!("Rejected handshake from {}: {}", peer_addr, e);
            return Ok(());
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let mut slot = match ctx.tracker.admit() {
        Ok(slot) => slot,
        Err(e) => {
            warn!("Refusing session for {}: {}", peer_addr, e);
            close(&mut ws_sender, CloseCode::Again, "session limit reached").await;
            return Ok(());
        }
    };

    let (mut session, output) = match Session::open(&ctx.spawn_spec) {
        Ok(opened) => opened,
        Err(e) => {
            error!("Failed to start shell for {}: {}", peer_addr, e);
            close(&mut ws_sender, CloseCode::Error, "failed to start shell").await;
            return Ok(());
        }
    };

    slot.register(SessionInfo {
        id: session.id(),
        peer: peer_addr,
        shell: session.shell().to_string(),
        pid: session.pid(),
        started_at: SystemTime::now(),
    });
    info!(
        "Session {} started for {} ({}, pid {:?})",
        session.id(),
        peer_addr,
        session.shell(),
        session.pid()
    );

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let _forwarder = Forwarder::spawn(output, event_tx, session.id());

    let result = relay(
        &mut session,
        event_rx,
        &mut ws_sender,
        &mut ws_receiver,
        peer_addr,
        ctx.idle_timeout,
        shutdown_rx,
    )
    .await;

    session.close().await;
    drop(slot);

    info!("Connection from {} closed", peer_addr);
    result
}

/// Accept the upgrade only on the configured path
fn check_path(request: &Request, response: Response, path: &str) -> Result<Response, ErrorResponse> {
    if request.uri().path() == path {
        return Ok(response);
    }

    let mut rejection = ErrorResponse::new(Some(format!(
        "no terminal endpoint at {}",
        request.uri().path()
    )));
    *rejection.status_mut() = StatusCode::NOT_FOUND;
    Err(rejection)
}

/// Event loop for a live session
async fn relay(
    session: &mut Session,
    mut events: mpsc::Receiver<ServerMessage>,
    ws_sender: &mut WsSink,
    ws_receiver: &mut WsSource,
    peer_addr: SocketAddr,
    idle_timeout: Option<Duration>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let size = session.size();
    send_message(
        ws_sender,
        &ServerMessage::connected(session.id(), session.shell(), size.cols, size.rows),
    )
    .await?;

    // A limit too large to schedule never fires, same as no limit
    let idle_timeout = idle_timeout.filter(|limit| idle_deadline(*limit).is_some());
    let idle_limit = idle_timeout.unwrap_or(Duration::from_secs(3600));
    let idle = tokio::time::sleep(idle_limit);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            // Receive messages from client
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(deadline) = idle_deadline(idle_limit) {
                            idle.as_mut().reset(deadline);
                        }
                        if let Some(reply) = handle_text(&text, session) {
                            send_message(ws_sender, &reply).await?;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if let Some(deadline) = idle_deadline(idle_limit) {
                            idle.as_mut().reset(deadline);
                        }
                        if let Some(reply) = handle_binary(&data, session) {
                            send_message(ws_sender, &reply).await?;
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        // tungstenite answers pings itself
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} requested close", peer_addr);
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {
                        // Raw frame, ignore
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", peer_addr, e);
                        break;
                    }
                    None => {
                        info!("Connection closed by {}", peer_addr);
                        break;
                    }
                }
            }
            // Forward shell output
            event = events.recv() => {
                match event {
                    Some(message) => send_message(ws_sender, &message).await?,
                    None => {
                        let exit_code = session.exit_code_within(EXIT_STATUS_WAIT).await;
                        info!("Session {} shell exited ({:?})", session.id(), exit_code);
                        send_message(ws_sender, &ServerMessage::exit(exit_code)).await?;
                        close(ws_sender, CloseCode::Normal, "shell exited").await;
                        break;
                    }
                }
            }
            // Evict idle sessions
            _ = &mut idle, if idle_timeout.is_some() => {
                info!("Session {} idle for {:?}, closing", session.id(), idle_limit);
                close(ws_sender, CloseCode::Normal, "idle timeout").await;
                break;
            }
            // Handle shutdown signal
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, closing connection to {}", peer_addr);
                close(ws_sender, CloseCode::Away, "server shutting down").await;
                break;
            }
        }
    }

    Ok(())
}

/// When an idle period starting now would end, if that instant is representable
fn idle_deadline(limit: Duration) -> Option<Instant> {
    Instant::now().checked_add(limit)
}

/// Handle a JSON text frame, returning the reply to send, if any
fn handle_text(text: &str, session: &mut Session) -> Option<ServerMessage> {
    let message = match ClientMessage::from_json(text) {
        Ok(message) => message,
        Err(e) => {
            debug!("Invalid message for session {}: {}", session.id(), e);
            return Some(e.into());
        }
    };

    match message {
        ClientMessage::Input { data } => forward_input(session, data.as_bytes()),
        ClientMessage::Resize { cols, rows } => {
            session.resize(cols, rows);
            None
        }
        ClientMessage::Ping { seq } => Some(ServerMessage::pong(seq)),
    }
}

/// Binary frames are raw input
fn handle_binary(data: &[u8], session: &Session) -> Option<ServerMessage> {
    if let Err(e) = check_input_len(data.len()) {
        return Some(e.into());
    }
    forward_input(session, data)
}

fn forward_input(session: &Session, data: &[u8]) -> Option<ServerMessage> {
    match session.input(data) {
        Ok(()) => None,
        Err(e) => {
            warn!("Session {} dropped {} bytes of input: {}", session.id(), data.len(), e);
            Some(ServerMessage::error_with_code(
                e.to_string(),
                ErrorCode::SessionClosed,
            ))
        }
    }
}

async fn send_message(ws_sender: &mut WsSink, message: &ServerMessage) -> anyhow::Result<()> {
    ws_sender.send(Message::Text(message.to_json()?)).await?;
    Ok(())
}

/// Best-effort close frame
async fn close(ws_sender: &mut WsSink, code: CloseCode, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = ws_sender.send(Message::Close(Some(frame))).await {
        debug!("Failed to send close frame: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_deadline() {
        let now = Instant::now();
        let deadline = idle_deadline(Duration::from_secs(30)).unwrap();
        assert!(deadline >= now + Duration::from_secs(30));

        assert_eq!(idle_deadline(Duration::from_secs(u64::MAX)), None);
        assert_eq!(idle_deadline(Duration::MAX), None);
    }
}
