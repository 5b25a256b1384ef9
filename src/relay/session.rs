//! Individual relay session
//!
//! One session per client connection: a single shell on its own PTY, alive
//! from accept until disconnect. Closing is best-effort and happens once.

use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::pty::{PtyError, PtyOutput, PtyProcess, SpawnSpec, TerminalSize};

/// Errors that can occur during session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to start shell: {0}")]
    Spawn(#[source] PtyError),

    #[error("Session is closed")]
    Closed,

    #[error("PTY error: {0}")]
    Pty(#[from] PtyError),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// A shell bound to one client connection
pub struct Session {
    /// Log correlation id; not a resumable identity
    id: Uuid,
    /// Program that was launched
    shell: String,
    pid: Option<u32>,
    /// Last size applied to the PTY
    size: TerminalSize,
    /// The shell, until the session is closed
    process: Option<PtyProcess>,
}

impl Session {
    /// Spawn the shell and hand back its output queue
    ///
    /// On failure nothing is left running and no output queue exists.
    pub fn open(spec: &SpawnSpec) -> SessionResult<(Self, mpsc::Receiver<PtyOutput>)> {
        let mut process = PtyProcess::spawn(spec).map_err(SessionError::Spawn)?;
        let output = process.take_output().ok_or_else(|| {
            SessionError::Spawn(PtyError::SystemError("output queue unavailable".to_string()))
        })?;

        let session = Self {
            id: Uuid::new_v4(),
            shell: spec.program.clone(),
            pid: process.pid(),
            size: process.size(),
            process: Some(process),
        };

        debug!(
            "Session {} opened ({}, pid {:?})",
            session.id, session.shell, session.pid
        );
        Ok((session, output))
    }

    /// Get the session ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current terminal size
    pub fn size(&self) -> TerminalSize {
        self.size
    }

    /// Whether [`Session::close`] has not run yet
    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.process.is_some()
    }

    /// Whether the shell is still running
    #[cfg(test)]
    pub fn is_alive(&mut self) -> bool {
        self.process.as_mut().is_some_and(PtyProcess::is_alive)
    }

    /// Exit code of the shell, waiting up to `limit` for it to be reaped
    pub async fn exit_code_within(&mut self, limit: Duration) -> Option<u32> {
        let process = self.process.as_mut()?;
        let deadline = tokio::time::Instant::now() + limit;

        loop {
            if let Some(code) = process.exit_code() {
                return Some(code);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Forward client input to the shell
    pub fn input(&self, data: &[u8]) -> SessionResult<()> {
        let process = self.process.as_ref().ok_or(SessionError::Closed)?;
        process.write(data)?;
        Ok(())
    }

    /// Apply a new terminal size
    ///
    /// Failures are logged and otherwise ignored; the previous size stays in
    /// effect. Returns whether the size was applied.
    pub fn resize(&mut self, cols: u16, rows: u16) -> bool {
        let Some(process) = self.process.as_mut() else {
            debug!("Session {} resize after close ignored", self.id);
            return false;
        };

        match process.resize(cols, rows) {
            Ok(()) => {
                self.size = TerminalSize::new(cols, rows);
                debug!("Session {} resized to {}x{}", self.id, cols, rows);
                true
            }
            Err(e) => {
                warn!("Session {} failed to resize to {}x{}: {}", self.id, cols, rows, e);
                false
            }
        }
    }

    /// Terminate the shell
    ///
    /// Errors are logged and swallowed. Calling this again is a no-op.
    pub async fn close(&mut self) {
        let Some(mut process) = self.process.take() else {
            debug!("Session {} already closed", self.id);
            return;
        };

        let id = self.id;
        match tokio::task::spawn_blocking(move || process.terminate()).await {
            Ok(Ok(())) => info!("Session {} shell terminated", id),
            Ok(Err(PtyError::ProcessExited)) => debug!("Session {} shell had already exited", id),
            Ok(Err(e)) => warn!("Session {} failed to terminate shell: {}", id, e),
            Err(e) => error!("Session {} termination task failed: {}", id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::ShellEnv;
    use tokio::time::timeout;

    fn shell_spec() -> SpawnSpec {
        SpawnSpec::new("/bin/sh", "/tmp").with_env(ShellEnv::inherit().with_var("PS1", "$ "))
    }

    async fn read_until(rx: &mut mpsc::Receiver<PtyOutput>, needle: &str) -> String {
        let mut collected = String::new();
        let _ = timeout(Duration::from_secs(5), async {
            while let Some(output) = rx.recv().await {
                collected.push_str(&String::from_utf8_lossy(&output.data));
                if collected.contains(needle) {
                    break;
                }
            }
        })
        .await;
        collected
    }

    #[cfg(target_os = "linux")]
    fn process_exists(pid: u32) -> bool {
        std::path::Path::new(&format!("/proc/{}", pid)).exists()
    }

    #[tokio::test]
    async fn test_open_and_echo() {
        let (mut session, mut output) = Session::open(&shell_spec()).unwrap();
        assert!(session.is_open());
        assert!(session.is_alive());
        assert_eq!(session.size(), TerminalSize::new(80, 24));

        session.input(b"echo $((40+2))\n").unwrap();
        let text = read_until(&mut output, "42").await;
        assert!(text.contains("42"), "got {:?}", text);

        session.close().await;
    }

    #[tokio::test]
    async fn test_open_invalid_shell() {
        let spec = SpawnSpec::new("/nonexistent/bin/shell", "/tmp").with_env(ShellEnv::inherit());
        let result = Session::open(&spec);
        assert!(matches!(result, Err(SessionError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_input_order() {
        let (mut session, mut output) = Session::open(&shell_spec()).unwrap();

        for chunk in ["echo ", "ord", "er-$((3", "+4))", "\n"] {
            session.input(chunk.as_bytes()).unwrap();
        }
        let text = read_until(&mut output, "order-7").await;
        assert!(text.contains("order-7"), "got {:?}", text);

        session.close().await;
    }

    #[tokio::test]
    async fn test_resize_sequence() {
        let (mut session, mut output) = Session::open(&shell_spec()).unwrap();

        assert!(session.resize(40, 10));
        assert!(session.resize(120, 40));
        assert_eq!(session.size(), TerminalSize::new(120, 40));

        session.input(b"stty size\n").unwrap();
        let text = read_until(&mut output, "40 120").await;
        assert!(text.contains("40 120"), "got {:?}", text);

        session.close().await;
    }

    #[tokio::test]
    async fn test_resize_after_exit_keeps_session() {
        let spec = shell_spec().with_args(["-c", "exit 0"]);
        let (mut session, mut output) = Session::open(&spec).unwrap();

        // Drain until the shell is gone
        let _ = timeout(Duration::from_secs(5), async {
            while output.recv().await.is_some() {}
        })
        .await;
        assert_eq!(session.exit_code_within(Duration::from_secs(2)).await, Some(0));

        assert!(!session.resize(100, 30));
        assert!(session.is_open());
        assert_eq!(session.size(), TerminalSize::new(80, 24));

        session.close().await;
    }

    #[tokio::test]
    async fn test_close_terminates_shell() {
        let (mut session, _output) = Session::open(&shell_spec()).unwrap();
        let pid = session.pid().unwrap();

        session.close().await;
        assert!(!session.is_open());
        assert!(!session.is_alive());
        #[cfg(target_os = "linux")]
        assert!(!process_exists(pid));
        let _ = pid;

        // Second close is a no-op
        session.close().await;
        assert!(matches!(session.input(b"ls\n"), Err(SessionError::Closed)));
        assert!(!session.resize(100, 30));
    }

    #[tokio::test]
    async fn test_no_output_after_close() {
        let (mut session, mut output) = Session::open(&shell_spec()).unwrap();
        session.close().await;

        // Whatever was already queued drains, then the stream ends
        let ended = timeout(Duration::from_secs(5), async {
            while output.recv().await.is_some() {}
        })
        .await;
        assert!(ended.is_ok());
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let (mut first, mut first_out) = Session::open(&shell_spec()).unwrap();
        let (mut second, mut second_out) = Session::open(&shell_spec()).unwrap();
        assert_ne!(first.id(), second.id());
        assert_ne!(first.pid(), second.pid());

        first.input(b"echo first-$((1000+1))\n").unwrap();
        second.input(b"echo second-$((2000+2))\n").unwrap();

        let first_text = read_until(&mut first_out, "first-1001").await;
        let second_text = read_until(&mut second_out, "second-2002").await;

        assert!(first_text.contains("first-1001"));
        assert!(second_text.contains("second-2002"));
        assert!(!first_text.contains("second"));
        assert!(!second_text.contains("first"));

        first.close().await;
        second.close().await;
    }
}
