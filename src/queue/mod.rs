//! The tiered queue engine: five-stage pipeline, phase-change residency
//! balancing, and the publish/fetch/ack/requeue/transaction protocol.

use thiserror::Error;

use crate::index::QueueIndexError;
use crate::store::MsgStoreError;

mod delta;
mod engine;
mod pipeline;
mod rates;
mod status;
mod txn;

pub use engine::{FetchResult, StageDepths, TieredQueue, IO_BATCH};
pub use status::Message;

pub type QueueResult<T> = Result<T, QueueError>;

/// Disk failures surface unchanged from the collaborating subsystems; the
/// engine performs no local retry, since both own their durability
/// protocols.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] MsgStoreError),
    #[error(transparent)]
    Index(#[from] QueueIndexError),
}
