//! HTTP and tunnel surface of a relay node, plus process bootstrap.
//!
//! [`node::Node`] wires the session registry and monitors together, runs
//! the periodic schedules, and owns the shutdown order. [`cli::run`] is
//! the binary entry point.

pub mod cli;
pub mod error;
pub mod logging;
pub mod node;
pub mod routes;
pub mod session;

pub use cli::run;
pub use node::Node;
