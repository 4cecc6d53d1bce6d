//! link-daemon library: Exposes the daemon's building blocks for testing.
//!
//! This is a thin library layer over the daemon binary, allowing
//! integration tests to access argument handling and the demo loop.

pub mod cli;
pub mod demo;

pub use cli::{Args, PeerSpec};
