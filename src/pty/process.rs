//! PTY process management
//!
//! Handles spawning processes with PTY terminal emulation, including:
//! - Configurable terminal size and an explicit environment
//! - Ordered, non-blocking input through a writer thread
//! - Output delivered on a queue fed by a reader thread
//! - Terminal resize support
//! - Termination with reaping, and release on drop

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::ShellEnv;

/// Errors that can occur during PTY operations
#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open PTY: {0}")]
    OpenFailed(String),

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Failed to write to PTY: {0}")]
    WriteFailed(String),

    #[error("Failed to resize PTY: {0}")]
    ResizeFailed(String),

    #[error("Failed to terminate process: {0}")]
    TerminateFailed(String),

    #[error("Process already exited")]
    ProcessExited,

    #[error("Process already terminated")]
    AlreadyTerminated,

    #[error("PTY system error: {0}")]
    SystemError(String),
}

/// Result type for PTY operations
pub type PtyResult<T> = Result<T, PtyError>;

/// Output queue depth, in chunks
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

const READ_BUFFER_SIZE: usize = 4096;

/// Terminal size configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Convert to portable-pty PtySize
    fn to_pty_size(self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl From<PtySize> for TerminalSize {
    fn from(size: PtySize) -> Self {
        Self::new(size.cols, size.rows)
    }
}

/// Output data from the PTY
#[derive(Debug, Clone)]
pub struct PtyOutput {
    /// The output data
    pub data: Vec<u8>,
}

/// Everything needed to start a process on a new PTY
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Program to run, resolved against `PATH` in `env` when relative
    pub program: String,
    pub args: Vec<String>,
    /// Working directory
    pub cwd: PathBuf,
    /// Complete environment of the child; nothing else is inherited
    pub env: ShellEnv,
    /// Initial terminal size
    pub size: TerminalSize,
}

impl SpawnSpec {
    /// Create a spec with no arguments, an empty environment and the default size
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: ShellEnv::new(),
            size: TerminalSize::default(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, env: ShellEnv) -> Self {
        self.env = env;
        self
    }

    pub fn with_size(mut self, size: TerminalSize) -> Self {
        self.size = size;
        self
    }
}

/// Handle to a running PTY process
///
/// The handle owns the child exclusively. Dropping it without calling
/// [`PtyProcess::terminate`] still kills and reaps the child.
pub struct PtyProcess {
    /// Unique identifier, used for log correlation
    id: Uuid,
    /// OS process id, when the platform reports one
    pid: Option<u32>,
    /// The master PTY handle
    master: Box<dyn MasterPty + Send>,
    /// The child process
    child: Box<dyn Child + Send + Sync>,
    /// Queue drained by the writer thread
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    /// Queue filled by the reader thread, until taken
    output_rx: Option<mpsc::Receiver<PtyOutput>>,
    /// Last size applied to the PTY
    size: TerminalSize,
    /// Set once termination has been attempted
    terminated: bool,
}

impl PtyProcess {
    /// Spawn a new process with PTY
    ///
    /// The child starts from an empty environment populated only from
    /// `spec.env`. Output starts flowing immediately into a bounded queue; take
    /// it with [`PtyProcess::take_output`].
    pub fn spawn(spec: &SpawnSpec) -> PtyResult<Self> {
        let id = Uuid::new_v4();

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(spec.size.to_pty_size())
            .map_err(|e| PtyError::OpenFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        cmd.cwd(&spec.cwd);
        cmd.env_clear();
        for (key, value) in spec.env.iter() {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        // Only the child keeps the slave open, so EOF follows its exit
        drop(pair.slave);

        let pid = child.process_id();

        let io = pair
            .master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, pair.master.take_writer()?)));
        let (reader, writer) = match io {
            Ok(io) => io,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PtyError::SystemError(e.to_string()));
            }
        };

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        std::thread::spawn(move || Self::reader_loop(reader, output_tx, id));
        std::thread::spawn(move || Self::writer_loop(writer, input_rx, id));

        debug!(
            "Spawned PTY {} ({}, pid {:?}, {}x{})",
            id, spec.program, pid, spec.size.cols, spec.size.rows
        );

        Ok(Self {
            id,
            pid,
            master: pair.master,
            child,
            input_tx,
            output_rx: Some(output_rx),
            size: spec.size,
            terminated: false,
        })
    }

    /// Reader loop that runs in a separate thread
    ///
    /// Ends on EOF, on a read error (EIO once the slave side is gone) or when
    /// the output receiver is dropped.
    fn reader_loop(
        mut reader: Box<dyn Read + Send>,
        output_tx: mpsc::Sender<PtyOutput>,
        id: Uuid,
    ) {
        let mut buffer = [0u8; READ_BUFFER_SIZE];

        loop {
            match reader.read(&mut buffer) {
                Ok(0) => {
                    debug!("PTY {} reached EOF", id);
                    break;
                }
                Ok(n) => {
                    let output = PtyOutput {
                        data: buffer[..n].to_vec(),
                    };
                    if output_tx.blocking_send(output).is_err() {
                        debug!("PTY {} output receiver dropped", id);
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("PTY {} read ended: {}", id, e);
                    break;
                }
            }
        }
    }

    /// Writer loop that runs in a separate thread, applying input in order
    fn writer_loop(
        mut writer: Box<dyn Write + Send>,
        mut input_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        id: Uuid,
    ) {
        while let Some(data) = input_rx.blocking_recv() {
            if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                warn!("PTY {} input write failed: {}", id, e);
                break;
            }
        }
    }

    /// OS process id of the child
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Get the last size applied to the terminal
    pub fn size(&self) -> TerminalSize {
        self.size
    }

    /// Size as reported by the PTY device itself
    #[cfg(test)]
    pub fn pty_size(&self) -> PtyResult<TerminalSize> {
        self.master
            .get_size()
            .map(TerminalSize::from)
            .map_err(|e| PtyError::SystemError(e.to_string()))
    }

    /// Take the output queue
    ///
    /// Returns `None` after the first call. The receiver yields `None` once the
    /// process has exited and all of its output has been consumed.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<PtyOutput>> {
        self.output_rx.take()
    }

    /// Check whether the child is still running
    ///
    /// Reaps the child if it has exited.
    pub fn is_alive(&mut self) -> bool {
        !self.terminated && matches!(self.child.try_wait(), Ok(None))
    }

    /// Exit code of the child, if it has exited
    pub fn exit_code(&mut self) -> Option<u32> {
        self.child
            .try_wait()
            .ok()
            .flatten()
            .map(|status| status.exit_code())
    }

    /// Queue input for the PTY (stdin)
    ///
    /// Never blocks. Chunks are written in the order they were queued.
    pub fn write(&self, data: &[u8]) -> PtyResult<()> {
        if self.terminated {
            return Err(PtyError::AlreadyTerminated);
        }

        self.input_tx
            .send(data.to_vec())
            .map_err(|_| PtyError::WriteFailed("input writer has stopped".to_string()))
    }

    /// Queue a string for the PTY
    #[cfg(test)]
    pub fn write_str(&self, s: &str) -> PtyResult<()> {
        self.write(s.as_bytes())
    }

    /// Resize the terminal
    pub fn resize(&mut self, cols: u16, rows: u16) -> PtyResult<()> {
        if self.terminated {
            return Err(PtyError::AlreadyTerminated);
        }
        if !self.is_alive() {
            return Err(PtyError::ProcessExited);
        }

        let new_size = TerminalSize::new(cols, rows);
        self.master
            .resize(new_size.to_pty_size())
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))?;

        self.size = new_size;
        Ok(())
    }

    /// Kill the process and reap it
    ///
    /// Only the first call does anything; later calls return
    /// [`PtyError::AlreadyTerminated`]. If the child had already exited it is
    /// reaped and [`PtyError::ProcessExited`] is returned.
    ///
    /// Blocks for the kill grace period, so async callers should run it on a
    /// blocking thread.
    pub fn terminate(&mut self) -> PtyResult<()> {
        if self.terminated {
            return Err(PtyError::AlreadyTerminated);
        }
        self.terminated = true;

        if let Ok(Some(status)) = self.child.try_wait() {
            debug!("PTY {} had already exited ({})", self.id, status.exit_code());
            return Err(PtyError::ProcessExited);
        }

        self.child
            .kill()
            .map_err(|e| PtyError::TerminateFailed(e.to_string()))?;
        let status = self
            .child
            .wait()
            .map_err(|e| PtyError::TerminateFailed(e.to_string()))?;

        debug!("PTY {} terminated ({})", self.id, status.exit_code());
        Ok(())
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if self.terminated {
            return;
        }
        match self.terminate() {
            Ok(()) | Err(PtyError::ProcessExited) => {}
            Err(e) => warn!("PTY {} cleanup on drop failed: {}", self.id, e),
        }
    }
}
