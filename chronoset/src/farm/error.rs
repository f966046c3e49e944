use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("farm has no clusters configured")]
    NoClusters,

    #[error("write quorum of {want} unreachable: only {got} cluster(s) acknowledged")]
    QuorumUnreachable { want: usize, got: usize },

    #[error(transparent)]
    Cluster(#[from] crate::cluster::Error),
}
