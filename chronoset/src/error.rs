//! Error kinds. Each layer keeps its own `Error` enum close to
//! the code that raises it (`storage::Error`, `cluster::Error`,
//! `farm::Error`); this module holds the one boundary error shared by
//! callers that never touch storage at all, and re-exports the rest so
//! `chronoset::error::*` is a complete map of everything that can go wrong.
use thiserror::Error;

pub use crate::cluster::Error as ClusterError;
pub use crate::farm::Error as FarmError;
pub use crate::storage::Error as StorageError;

/// Malformed cursor or KSM at a system boundary.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("malformed cursor: {0}")]
    Cursor(String),
    #[error("malformed KSM: {0}")]
    Ksm(String),
}
