//! Transaction buffers and the on-sync apply queue.

use std::collections::HashMap;

use crate::core::{SeqId, TxnId};

use super::status::Message;

/// Pending work of one uncommitted transaction.
#[derive(Debug, Default)]
pub struct TxnBuffer {
    pub pending_messages: Vec<Message>,
    pub pending_acks: Vec<Vec<SeqId>>,
}

/// Transactions in flight on this queue, keyed by the caller's id.
#[derive(Debug, Default)]
pub struct TxnTable {
    txns: HashMap<TxnId, TxnBuffer>,
}

impl TxnTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Created lazily on first `tx_publish`/`tx_ack`.
    pub fn lookup_or_create(&mut self, txn: TxnId) -> &mut TxnBuffer {
        self.txns.entry(txn).or_default()
    }

    /// Remove on commit or rollback. Absent means an empty transaction.
    pub fn take(&mut self, txn: TxnId) -> TxnBuffer {
        self.txns.remove(&txn).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.txns.is_empty()
    }
}

/// A committed transaction's work, posted back by the persistent store's
/// sync callback. The post-commit function stays behind in the engine's fun
/// table; only its handle travels through the channel.
#[derive(Debug)]
pub struct SyncCommit {
    pub pubs: Vec<Message>,
    pub acks: Vec<SeqId>,
    pub fun: u64,
}

/// Commits waiting to be applied, batched so one queue-index sync covers
/// them all.
#[derive(Debug, Default)]
pub struct OnSync {
    pub acks: Vec<SeqId>,
    pub pubs: Vec<Message>,
    pub fun_handles: Vec<u64>,
}

impl OnSync {
    pub fn is_empty(&self) -> bool {
        self.acks.is_empty() && self.pubs.is_empty() && self.fun_handles.is_empty()
    }

    pub fn push(&mut self, commit: SyncCommit) {
        self.acks.extend(commit.acks);
        self.pubs.extend(commit.pubs);
        self.fun_handles.push(commit.fun);
    }
}
