//! Session relay module
//!
//! Bridges each client connection to its own shell: spawning, input, resize,
//! output forwarding and teardown, plus admission control across sessions.

mod output;
mod session;
mod tracker;

pub use output::*;
pub use session::*;
pub use tracker::*;
