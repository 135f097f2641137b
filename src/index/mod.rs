//! Per-queue index: a segmented append-only log of publish/deliver/ack
//! records, plus the checkpoint-terms protocol used at shutdown/startup.
//!
//! Each queue owns one index under `<base>/<escaped queue name>/`. Segment
//! `N` covers seq ids `[N*S, (N+1)*S)`; a segment whose publishes are all
//! acked is deleted. The `clean.json` terms file is written by a clean
//! terminate and consumed by the next recover, so its absence means the
//! previous shutdown was not clean.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::core::{Guid, QueueName, StoreRef};

mod entry;
mod journal;

pub use entry::{encode_frame, replay_segment, IndexRecord, SegmentReplay};
pub use journal::{IndexEntry, QueueIndex};

pub const TERMS_FILE: &str = "clean.json";

pub type QueueIndexResult<T> = Result<T, QueueIndexError>;

#[derive(Debug, Error)]
pub enum QueueIndexError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("index frame invalid: {reason}")]
    Frame { reason: String },
    #[error("terms file invalid: {reason}")]
    TermsInvalid { reason: String },
}

impl QueueIndexError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        QueueIndexError::Io {
            path: Some(path.into()),
            source,
        }
    }
}

/// Checkpoint terms a queue writes through its index at clean shutdown and
/// reads back at the next startup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryTerms {
    pub persistent_ref: StoreRef,
    pub transient_ref: StoreRef,
    pub persistent_count: u64,
}

/// Broker-level recovery: read and consume each durable queue's terms file.
///
/// Consuming (deleting) the file up front makes any crash between here and
/// the next clean terminate a dirty shutdown for that queue.
pub fn recover(
    base_dir: &Path,
    queue_names: &[QueueName],
) -> QueueIndexResult<Vec<(QueueName, Option<RecoveryTerms>)>> {
    let mut out = Vec::with_capacity(queue_names.len());
    for name in queue_names {
        let path = base_dir.join(name.escaped()).join(TERMS_FILE);
        let terms = match fs::read(&path) {
            Ok(bytes) => {
                fs::remove_file(&path).map_err(|source| QueueIndexError::io(&path, source))?;
                match serde_json::from_slice::<RecoveryTerms>(&bytes) {
                    Ok(terms) => Some(terms),
                    Err(err) => {
                        debug!(queue = %name, error = %err, "unreadable terms file dropped");
                        None
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => return Err(QueueIndexError::io(&path, source)),
        };
        out.push((name.clone(), terms));
    }
    Ok(out)
}

/// Count references to each GUID held by unacked persistent publishes
/// across the given queues. Feeds the persistent store's refcount rebuild
/// after a dirty start.
pub fn scan_guid_refs(
    base_dir: &Path,
    queue_names: &[QueueName],
) -> QueueIndexResult<HashMap<Guid, u64>> {
    let mut counts: HashMap<Guid, u64> = HashMap::new();
    for name in queue_names {
        let dir = base_dir.join(name.escaped());
        if !dir.exists() {
            continue;
        }
        let mut persistent: HashMap<crate::core::SeqId, Guid> = HashMap::new();
        for path in journal::segment_paths(&dir)? {
            let replay = replay_segment(&path)?;
            for record in replay.records {
                match record {
                    IndexRecord::Publish {
                        seq_id,
                        guid,
                        is_persistent: true,
                    } => {
                        persistent.insert(seq_id, guid);
                    }
                    IndexRecord::Publish { .. } | IndexRecord::Deliver { .. } => {}
                    IndexRecord::Ack { seq_id } => {
                        persistent.remove(&seq_id);
                    }
                }
            }
        }
        for guid in persistent.into_values() {
            *counts.entry(guid).or_insert(0) += 1;
        }
    }
    Ok(counts)
}
