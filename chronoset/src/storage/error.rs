//! Physical storage-node failures.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage node {addr} unreachable: {source}")]
    Connect {
        addr: String,
        #[source]
        source: redis::RedisError,
    },

    #[error("storage node {addr} command failed: {source}")]
    Command {
        addr: String,
        #[source]
        source: redis::RedisError,
    },

    #[error("no pooled connection available for {addr} within checkout timeout")]
    PoolExhausted { addr: String },

    #[error("connection pool for {addr} is shutting down")]
    PoolClosed { addr: String },

    #[error("storage node {addr} did not respond within the {kind} timeout")]
    CommandTimeout { addr: String, kind: &'static str },

    /// A member lives in both the add-set and the remove-set on one node,
    /// violating the shard script's mutual-exclusion invariant. Treated as
    /// a physical failure for that node's reply; other nodes still answer,
    /// and a later repair typically heals it.
    #[error("member present in both add-set and remove-set for key on node {addr}")]
    CorruptedState { addr: String },
}
