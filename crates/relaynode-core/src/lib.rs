// relaynode-core: Pure types, config, coordination store, scheduling
// No internal relaynode dependencies; this is the foundation crate.

pub mod config;
pub mod envelope;
pub mod etcd;
pub mod events;
pub mod keys;
pub mod node;
pub mod schedule;
pub mod store;
pub mod time;
