//! Storage wire operations.
pub mod error;
pub mod hash;
pub mod memory;
pub mod ordered_set;
pub mod pool;
pub mod redis_backend;

pub use error::Error;
pub use hash::{shard_index, FnvKeyHasher, KeyHasher};
pub use ordered_set::{presence, OrderedSetStore, SetSelector};
