//! Content-addressed message store.
//!
//! One instance per persistence class (persistent, transient). Bodies are
//! filed by GUID and refcounted so several queues can share one on-disk
//! copy. `sync` is the durable gate the transactional commit path waits on.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::Guid;

mod client;
mod store;

pub use client::StoreClient;
pub use store::{MsgStore, CLEAN_MARKER_FILE};

pub type MsgStoreResult<T> = Result<T, MsgStoreError>;

#[derive(Debug, Error)]
pub enum MsgStoreError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("message {guid} not present in store")]
    NotFound { guid: Guid },
    #[error("message exceeds max bytes {max_bytes} (got {got_bytes})")]
    MsgTooLarge { max_bytes: usize, got_bytes: usize },
    #[error("clean-shutdown marker invalid: {reason}")]
    MarkerInvalid { reason: String },
}

impl MsgStoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MsgStoreError::Io {
            path: Some(path.into()),
            source,
        }
    }
}
