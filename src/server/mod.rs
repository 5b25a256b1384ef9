//! WebSocket server module
//!
//! Accepts dashboard terminal connections and relays each one to its own
//! shell session.

mod handler;
mod protocol;
mod websocket;

pub use protocol::*;
pub use websocket::*;
