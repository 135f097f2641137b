use thiserror::Error;

use crate::core::IdError;
use crate::index::QueueIndexError;
use crate::queue::QueueError;
use crate::store::MsgStoreError;

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over the subsystem errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Store(#[from] MsgStoreError),

    #[error(transparent)]
    Index(#[from] QueueIndexError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Id(#[from] IdError),
}
