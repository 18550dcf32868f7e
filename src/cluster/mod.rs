//! Cluster replication layer
//!
//! Everything that turns the single-process store into a replicated one:
//! the consensus engine and its callback surface, the persisted log, the
//! per-peer links, the request queue types, and the coordinator that owns
//! them all on the replication thread.

pub mod codec;
pub mod engine;
pub mod node;
pub mod node_link;
pub mod raft_log;
pub mod requests;

pub use engine::{RaftEngine, Role};
pub use node::{RaftHandle, RaftNode};
