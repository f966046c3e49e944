use thiserror::Error;

use crate::error::ParseError;
use crate::storage;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cluster has no storage nodes configured")]
    NoNodes,

    #[error(transparent)]
    Storage(#[from] storage::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),
}
