//! The node state machine and the plumbing it is built from: the local
//! datastore, the node's view of cluster membership, the wire encodings
//! shared with other replicas, and the retry loops used by gossip and
//! reshard coordination.

pub mod datastore;
pub mod node;
pub mod retry;
pub mod view;
pub mod wire;

pub use datastore::{Datastore, PutOutcome};
pub use node::{Node, NodeError, ReshardError};
pub use view::View;
