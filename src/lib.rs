//! A sharded, replicated key-value store with causal consistency.
//!
//! [`core`] holds the pure value types ([`core::vector_clock`],
//! [`core::shard_scheme`]) and the synchronisation primitives
//! ([`core::concurrency`]) the node state machine is built from.
//! [`infrastructure`] wires those into the actual running node: the local
//! datastore, the node's view of cluster membership, the wire encodings
//! shared with other replicas, the inter-server retry loops, and the
//! [`infrastructure::Node`] state machine itself. [`transport`] is the
//! thin `axum` layer that exposes all of it over HTTP.

pub mod app_state;
pub mod config;
pub mod core;
pub mod error;
pub mod infrastructure;
pub mod transport;

pub use error::{AppError, AppResult};
