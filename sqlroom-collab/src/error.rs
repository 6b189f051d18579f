use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum RoomError {
    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    #[error("invalid state vector: {0}")]
    InvalidStateVector(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("room already has state; snapshot rejected")]
    SnapshotRejected,

    #[error("client snapshots disabled")]
    ClientSnapshotsDisabled,

    #[error("room is closed")]
    Closed,

    #[error("{0}")]
    Store(#[from] StoreError),
}
