//! Configuration module
//!
//! Handles loading relay settings and resolving how shells are launched.

mod relay;

pub use relay::*;
