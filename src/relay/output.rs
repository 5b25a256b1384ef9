//! Output forwarding
//!
//! A dedicated task per session drains the PTY output queue and turns it into
//! `output` events for the connection, in the order the shell produced them.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::pty::PtyOutput;
use crate::server::ServerMessage;

/// Reassembles UTF-8 sequences split across PTY reads
///
/// Invalid bytes become U+FFFD; an incomplete trailing sequence is held back
/// until the next chunk.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of the buffered input as is complete
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut decoded = String::with_capacity(self.pending.len());

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    decoded.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    decoded.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        decoded
    }

    /// Flush whatever is still held back
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Handle to a running forwarding task; aborts it when dropped
pub struct Forwarder {
    handle: JoinHandle<()>,
}

impl Forwarder {
    /// Start forwarding `output` into `events`
    ///
    /// The task ends once the shell's output is exhausted, dropping its
    /// sender so the receiving side observes the end of the stream.
    pub fn spawn(
        mut output: mpsc::Receiver<PtyOutput>,
        events: mpsc::Sender<ServerMessage>,
        session_id: Uuid,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut decoder = Utf8Decoder::new();

            while let Some(chunk) = output.recv().await {
                let data = decoder.decode(&chunk.data);
                if data.is_empty() {
                    continue;
                }
                if events.send(ServerMessage::output(data)).await.is_err() {
                    debug!("Session {} event receiver dropped", session_id);
                    return;
                }
            }

            let rest = decoder.finish();
            if !rest.is_empty() {
                let _ = events.send(ServerMessage::output(rest)).await;
            }
            debug!("Session {} output stream ended", session_id);
        });

        Self { handle }
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_decode_ascii() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"hello\r\n"), "hello\r\n");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_decode_split_sequence() {
        // "é" is 0xC3 0xA9, "€" is 0xE2 0x82 0xAC
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"caf\xC3"), "caf");
        assert_eq!(decoder.decode(b"\xA9 \xE2"), "é ");
        assert_eq!(decoder.decode(b"\x82"), "");
        assert_eq!(decoder.decode(b"\xAC!"), "€!");
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"a\xFFb"), "a\u{FFFD}b");
    }

    #[test]
    fn test_finish_flushes_incomplete_tail() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"x\xE2\x82"), "x");
        assert_eq!(decoder.finish(), "\u{FFFD}");
        assert_eq!(decoder.finish(), "");
    }

    #[tokio::test]
    async fn test_forwarder_preserves_order() {
        let (output_tx, output_rx) = mpsc::channel(16);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let forwarder = Forwarder::spawn(output_rx, events_tx, Uuid::new_v4());

        let chunks: [&[u8]; 3] = [b"one ", b"two \xC3", b"\xA9 three"];
        for chunk in chunks {
            output_tx
                .send(PtyOutput {
                    data: chunk.to_vec(),
                })
                .await
                .unwrap();
        }
        drop(output_tx);

        let mut received = Vec::new();
        while let Ok(Some(event)) = timeout(Duration::from_secs(2), events_rx.recv()).await {
            match event {
                ServerMessage::Output { data } => received.push(data),
                other => panic!("unexpected event {:?}", other),
            }
        }

        assert_eq!(received, vec!["one ", "two ", "é three"]);
        drop(forwarder);
    }

    #[tokio::test]
    async fn test_forwarder_abort_on_drop() {
        let (_output_tx, output_rx) = mpsc::channel::<PtyOutput>(16);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let forwarder = Forwarder::spawn(output_rx, events_tx, Uuid::new_v4());

        drop(forwarder);

        // The aborted task drops its sender, ending the stream
        let ended = timeout(Duration::from_secs(2), events_rx.recv()).await;
        assert!(matches!(ended, Ok(None)));
    }
}
