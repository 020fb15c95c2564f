//! # relaynode: game-traffic relay node
//!
//! Facade crate that re-exports the relaynode workspace crates so
//! consumers can depend on a single `relaynode` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | relaynode-core | Config, wire types, store abstraction, key schema, scheduler |
//! | [`tunnel`] | relaynode-tunnel | Session registry, packet forwarding, upstream sockets |
//! | [`monitor`] | relaynode-monitor | Health checks, heartbeats, metrics sampling |
//! | [`server`] | relaynode-server | HTTP routes, tunnel WebSocket, bootstrap, CLI |

pub use relaynode_core as core;
pub use relaynode_monitor as monitor;
pub use relaynode_server as server;
pub use relaynode_tunnel as tunnel;
