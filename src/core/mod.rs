//! Pure, side-effect-free value types and synchronisation primitives.
//!
//! Nothing in this module touches the network or a clock other than
//! [`vector_clock`]'s own physical-time stamp. [`crate::infrastructure`]
//! wires these into the actual node state machine and HTTP transport.

pub mod concurrency;
pub mod shard_scheme;
pub mod vector_clock;

pub use concurrency::{ReadGuard, SwitchPermit, ViewPermit, WriteGuard};
pub use shard_scheme::{hash_key, ShardInfo, ShardScheme};
pub use vector_clock::{CompareValue, VectorClock};
