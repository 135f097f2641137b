//! Broker-wide startup: negotiate clean vs. dirty recovery across the
//! shared stores and the per-queue indexes, then hand out queues.
//!
//! Order matters: the transient store directory is wiped unconditionally
//! (transient bodies never survive a restart), the queue indexes give up
//! their checkpoint terms, and the persistent store starts against the refs
//! those terms carry. Only when the store reports a dirty start does the
//! expensive path run: refcounts rebuilt by scanning every durable queue's
//! index segments.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::Config;
use crate::core::{ClockSource, QueueName, StoreRef};
use crate::index::{self, RecoveryTerms};
use crate::queue::TieredQueue;
use crate::store::MsgStore;
use crate::Result;

const PERSISTENT_STORE_DIR: &str = "msg_store_persistent";
const TRANSIENT_STORE_DIR: &str = "msg_store_transient";
const QUEUES_DIR: &str = "queues";

/// The node-wide storage stack: both message stores plus the recovered
/// checkpoint terms, keyed by queue, waiting to be claimed at queue init.
pub struct NodeStores {
    persistent: MsgStore,
    transient: MsgStore,
    index_dir: PathBuf,
    terms: HashMap<QueueName, RecoveryTerms>,
}

/// Bring the node's storage tier up under `base_dir`.
pub fn start(base_dir: &Path, durable_queues: &[QueueName], config: &Config) -> Result<NodeStores> {
    let transient_dir = base_dir.join(TRANSIENT_STORE_DIR);
    MsgStore::clean_dir(&transient_dir)?;
    let transient = MsgStore::fresh(&transient_dir, config.max_msg_bytes)?;

    let index_dir = base_dir.join(QUEUES_DIR);
    std::fs::create_dir_all(&index_dir)
        .map_err(|source| crate::store::MsgStoreError::io(&index_dir, source))?;
    let recovered = index::recover(&index_dir, durable_queues)?;
    let refs: Vec<StoreRef> = recovered
        .iter()
        .filter_map(|(_, terms)| terms.as_ref().map(|t| t.persistent_ref))
        .collect();

    let persistent = MsgStore::open(base_dir.join(PERSISTENT_STORE_DIR), &refs, config.max_msg_bytes)?;
    if !persistent.successfully_recovered_state() {
        warn!("persistent store started dirty; rebuilding refcounts from queue indexes");
        let counts = index::scan_guid_refs(&index_dir, durable_queues)?;
        persistent.seed_refcounts(counts)?;
    }

    let terms: HashMap<QueueName, RecoveryTerms> = recovered
        .into_iter()
        .filter_map(|(name, terms)| terms.map(|t| (name, t)))
        .collect();
    debug!(
        queues = durable_queues.len(),
        clean_terms = terms.len(),
        clean_store = persistent.successfully_recovered_state(),
        "storage tier started"
    );

    Ok(NodeStores {
        persistent,
        transient,
        index_dir,
        terms,
    })
}

impl NodeStores {
    pub fn persistent(&self) -> &MsgStore {
        &self.persistent
    }

    pub fn transient(&self) -> &MsgStore {
        &self.transient
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    /// Open one queue, consuming its recovered terms if any.
    pub fn open_queue(
        &mut self,
        name: &QueueName,
        durable: bool,
        config: &Config,
        clock: Arc<dyn ClockSource>,
    ) -> Result<TieredQueue> {
        let terms = self.terms.remove(name);
        TieredQueue::init(
            name.clone(),
            durable,
            terms,
            &self.persistent,
            &self.transient,
            &self.index_dir,
            config,
            clock,
        )
        .map_err(Into::into)
    }

    /// Clean node shutdown. Call after every queue has terminated; writes
    /// the persistent store's marker so the next start is clean.
    pub fn terminate(&self) -> Result<()> {
        self.persistent.terminate()?;
        Ok(())
    }
}
