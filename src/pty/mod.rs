//! PTY management module
//!
//! Provides PTY terminal emulation for running shells with full terminal support.
//! Uses portable-pty for cross-platform compatibility.

mod env;
mod process;

pub use env::*;
pub use process::*;
