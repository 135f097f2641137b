//! The queue engine: residency balancing, the public protocol, and the
//! per-queue recovery handshake.
//!
//! One engine value per queue, driven as a single-threaded actor: every
//! public operation observes and mutates `self` and returns before the next
//! begins. The message stores are shared and do their own locking; the
//! queue index is owned here.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::core::{ClockSource, Guid, QueueName, SeqId, StoreRef, TxnId};
use crate::index::{QueueIndex, QueueIndexError, RecoveryTerms};
use crate::store::{MsgStore, StoreClient};

use super::delta::Delta;
use super::pipeline::Pipeline;
use super::rates::Rates;
use super::status::{Message, MsgStatus, PendingAck};
use super::txn::{OnSync, SyncCommit, TxnTable};
use super::QueueResult;

/// Batch size for body and index-entry writes. A hard floor and ceiling:
/// each α→β pass demotes at most this many bodies, and a β→γ pass writes
/// exactly this many index entries.
pub const IO_BATCH: usize = 64;

/// One fetched message and its delivery bookkeeping.
#[derive(Debug)]
pub struct FetchResult {
    pub message: Message,
    /// True when the message had been delivered before (a requeue, or a
    /// redelivery after restart).
    pub is_delivered: bool,
    /// The tag to `ack`/`requeue` with; `None` when no ack is expected.
    pub ack_tag: Option<SeqId>,
    /// Queue length after this fetch.
    pub remaining: usize,
}

/// Per-stage element counts, for introspection and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageDepths {
    pub q1: usize,
    pub q2: usize,
    pub delta: u64,
    pub q3: usize,
    pub q4: usize,
}

pub struct TieredQueue {
    name: QueueName,
    durable: bool,
    pipeline: Pipeline,
    next_seq_id: SeqId,
    /// Delivered-but-unacked messages, keyed by ack tag.
    pending_ack: BTreeMap<SeqId, PendingAck>,
    index: QueueIndex,
    persistent_client: StoreClient,
    transient_client: StoreClient,
    persistent_ref: StoreRef,
    transient_ref: StoreRef,
    txns: TxnTable,
    on_sync: OnSync,
    commit_funs: HashMap<u64, Box<dyn FnOnce() + Send>>,
    next_fun_handle: u64,
    sync_tx: Sender<SyncCommit>,
    sync_rx: Receiver<SyncCommit>,
    len: usize,
    persistent_count: u64,
    ram_msg_count: usize,
    target_ram_msg_count: Option<u64>,
    duration_target: Option<f64>,
    rates: Rates,
    /// Seq-id watermark set at init: an on-disk entry below this that is
    /// non-persistent is an orphan and is dropped on reload.
    transient_threshold: SeqId,
    clock: Arc<dyn ClockSource>,
}

impl TieredQueue {
    /// Bring a queue up against the shared stores and its own index.
    ///
    /// `terms` is what the previous clean shutdown left behind, if any. A
    /// missing terms value means the shutdown was not clean: fresh store
    /// refs are minted and the recovered entry count is derived from the
    /// index bounds. When the persistent store itself reports a dirty
    /// start, the terms' `persistent_count` hint is ignored in favour of
    /// the index's rescanned count.
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        name: QueueName,
        durable: bool,
        terms: Option<RecoveryTerms>,
        persistent_store: &MsgStore,
        transient_store: &MsgStore,
        index_dir: &Path,
        config: &Config,
        clock: Arc<dyn ClockSource>,
    ) -> QueueResult<Self> {
        let store_recovered = persistent_store.successfully_recovered_state();
        let attempt_clean = durable && terms.is_some() && store_recovered;
        let (persistent_ref, transient_ref) = match &terms {
            Some(t) => (t.persistent_ref, t.transient_ref),
            None => (StoreRef::fresh(), StoreRef::fresh()),
        };
        let persistent_client = persistent_store.client_init(persistent_ref);
        let transient_client = transient_store.client_init(transient_ref);

        let contains_store = persistent_store.clone();
        let (recovered_count, index) = QueueIndex::init(
            index_dir,
            &name,
            attempt_clean,
            move |guid| contains_store.contains(guid),
            config.segment_entry_count,
        )?;
        let (low, next) = index.bounds();

        let delta_count = match (&terms, store_recovered) {
            (Some(t), true) => t.persistent_count,
            (_, false) => recovered_count,
            (None, true) => next.get().saturating_sub(low.get()),
        };

        let now = clock.now_micros();
        let (sync_tx, sync_rx) = unbounded();
        let mut queue = Self {
            name,
            durable,
            pipeline: Pipeline::new(),
            next_seq_id: next,
            pending_ack: BTreeMap::new(),
            index,
            persistent_client,
            transient_client,
            persistent_ref,
            transient_ref,
            txns: TxnTable::new(),
            on_sync: OnSync::default(),
            commit_funs: HashMap::new(),
            next_fun_handle: 0,
            sync_tx,
            sync_rx,
            len: delta_count as usize,
            persistent_count: delta_count,
            ram_msg_count: 0,
            target_ram_msg_count: None,
            duration_target: None,
            rates: Rates::init(now, delta_count),
            transient_threshold: next,
            clock,
        };
        queue.pipeline.delta = Delta::new(low, delta_count, next);
        if !queue.pipeline.delta.is_blank() {
            queue.maybe_deltas_to_betas()?;
        }
        debug!(
            queue = %queue.name,
            durable,
            recovered = queue.len,
            clean = attempt_clean,
            "queue initialised"
        );
        queue.assert_invariants();
        Ok(queue)
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Message bodies currently held in RAM.
    pub fn ram_msg_count(&self) -> usize {
        self.ram_msg_count
    }

    /// β/γ records whose index entry is not yet persisted.
    pub fn ram_index_count(&self) -> usize {
        self.pipeline.ram_index_count()
    }

    pub fn persistent_count(&self) -> u64 {
        self.persistent_count
    }

    /// The orphan watermark established at init: a reloaded entry below
    /// this that is non-persistent gets dropped.
    pub fn transient_threshold(&self) -> SeqId {
        self.transient_threshold
    }

    pub fn depths(&self) -> StageDepths {
        StageDepths {
            q1: self.pipeline.q1.len(),
            q2: self.pipeline.q2.len(),
            delta: self.pipeline.delta.count(),
            q3: self.pipeline.q3.len(),
            q4: self.pipeline.q4.len(),
        }
    }

    /// Append one message. The message lands at the warm tail (Q1, or Q4
    /// when everything colder is empty); persistent bodies and index
    /// entries are written through, but nothing is synced, so this never
    /// blocks on the disk beyond buffered writes.
    pub fn publish(&mut self, msg: Message) -> QueueResult<()> {
        self.publish_inner(msg, false, false)?;
        self.reduce_memory_use()?;
        self.assert_invariants();
        Ok(())
    }

    /// Optimistic direct-to-consumer delivery; valid only on an empty
    /// queue. With `ack_required` the message goes straight to the
    /// pending-ack map and the returned tag acks it; without, the blank
    /// ack comes back and the queue is untouched.
    pub fn publish_delivered(
        &mut self,
        ack_required: bool,
        msg: Message,
    ) -> QueueResult<Option<SeqId>> {
        debug_assert_eq!(self.len, 0, "publish_delivered on a non-empty queue");
        if !ack_required {
            return Ok(None);
        }
        let is_persistent = msg.is_persistent && self.durable;
        let seq_id = self.next_seq_id;
        self.next_seq_id = seq_id.next();
        let mut status = MsgStatus::new(seq_id, &msg, is_persistent);
        status.is_delivered = true;
        self.maybe_write_msg_to_disk(false, &mut status)?;
        self.maybe_write_index_to_disk(false, &mut status)?;
        if is_persistent {
            self.persistent_count += 1;
        }
        self.rates.note_in();
        self.rates.note_out();
        self.pending_ack.insert(seq_id, PendingAck::from_status(status));
        self.assert_invariants();
        Ok(Some(seq_id))
    }

    /// Pull the next message off the read head, demand-loading colder
    /// stages as Q4 and Q3 drain. Returns `None` on an empty queue.
    pub fn fetch(&mut self, ack_required: bool) -> QueueResult<Option<FetchResult>> {
        loop {
            if let Some(status) = self.pipeline.q4.pop_front() {
                let result = self.internal_fetch(ack_required, status)?;
                self.assert_invariants();
                return Ok(Some(result));
            }
            if !self.pull_from_q3()? {
                self.assert_invariants();
                return Ok(None);
            }
        }
    }

    /// Settle delivered messages for good: drop bodies from the stores and
    /// ack index entries where they exist.
    pub fn ack(&mut self, ack_tags: &[SeqId]) -> QueueResult<()> {
        let mut index_acks = Vec::new();
        let mut persistent_guids = Vec::new();
        let mut transient_guids = Vec::new();
        for &tag in ack_tags {
            let Some(entry) = self.pending_ack.remove(&tag) else {
                debug_assert!(false, "ack tag {tag} has no pending entry");
                continue;
            };
            if entry.is_persistent() {
                self.persistent_count -= 1;
            }
            match entry {
                PendingAck::OnDisk {
                    is_persistent,
                    guid,
                } => {
                    if is_persistent {
                        // A persistent publish always has its index entry
                        // on disk; a transient one may not, and its stale
                        // entry is reclaimed by the transient threshold on
                        // the next reload.
                        index_acks.push(tag);
                        persistent_guids.push(guid);
                    } else {
                        transient_guids.push(guid);
                    }
                }
                PendingAck::InRam(_) => {}
            }
        }
        if !index_acks.is_empty() {
            self.index.ack(&index_acks)?;
        }
        if !persistent_guids.is_empty() {
            self.persistent_client.remove(&persistent_guids)?;
        }
        if !transient_guids.is_empty() {
            self.transient_client.remove(&transient_guids)?;
        }
        self.assert_invariants();
        Ok(())
    }

    /// Put delivered-but-unacked messages back on the queue. Each is
    /// re-published (new seq id, `is_delivered` set), evicted bodies are
    /// reloaded first, the old persistent index entries are acked and the
    /// old store references released.
    pub fn requeue(&mut self, ack_tags: &[SeqId]) -> QueueResult<()> {
        let mut old_index_acks = Vec::new();
        let mut persistent_release = Vec::new();
        let mut transient_release = Vec::new();
        for &tag in ack_tags {
            let Some(entry) = self.pending_ack.remove(&tag) else {
                debug_assert!(false, "requeue tag {tag} has no pending entry");
                continue;
            };
            if entry.is_persistent() {
                self.persistent_count -= 1;
            }
            match entry {
                PendingAck::InRam(status) => {
                    let body = status.body.expect("in-ram pending entry holds its body");
                    let msg = Message::with_guid(status.guid, body, status.is_persistent);
                    self.publish_inner(msg, true, false)?;
                }
                PendingAck::OnDisk {
                    is_persistent,
                    guid,
                } => {
                    let body = self.client_for(is_persistent).read(guid)?;
                    if is_persistent {
                        old_index_acks.push(tag);
                        persistent_release.push(guid);
                    } else {
                        transient_release.push(guid);
                    }
                    let msg = Message::with_guid(guid, body, is_persistent);
                    self.publish_inner(msg, true, false)?;
                }
            }
        }
        if !old_index_acks.is_empty() {
            self.index.ack(&old_index_acks)?;
        }
        if !persistent_release.is_empty() {
            self.persistent_client.release(&persistent_release)?;
        }
        if !transient_release.is_empty() {
            self.transient_client.release(&transient_release)?;
        }
        self.reduce_memory_use()?;
        self.assert_invariants();
        Ok(())
    }

    /// Drop every queued message, batching the deliver/ack and remove
    /// calls. Pending acks are untouched. Returns the number removed.
    pub fn purge(&mut self) -> QueueResult<usize> {
        let count = self.len;
        let q4: Vec<MsgStatus> = self.pipeline.q4.drain(..).collect();
        self.remove_queue_entries(&q4)?;
        loop {
            let mut drained = Vec::new();
            while let Some(status) = self.pipeline.q3.pop_front() {
                drained.push(status);
            }
            self.remove_queue_entries(&drained)?;
            if self.pipeline.delta.is_blank() {
                break;
            }
            self.maybe_deltas_to_betas()?;
        }
        debug_assert!(self.pipeline.q2.is_empty());
        let q1: Vec<MsgStatus> = self.pipeline.q1.drain(..).collect();
        self.remove_queue_entries(&q1)?;
        self.len = 0;
        self.ram_msg_count = 0;
        debug!(queue = %self.name, purged = count, "queue purged");
        self.assert_invariants();
        Ok(count)
    }

    /// Purge, drop every pending-ack entry from the stores and index (no
    /// keep-persistent variant), delete the index files, and deregister
    /// the store clients.
    pub fn delete_and_terminate(mut self) -> QueueResult<()> {
        self.purge()?;
        let entries = std::mem::take(&mut self.pending_ack);
        let mut index_acks = Vec::new();
        let mut persistent_guids = Vec::new();
        let mut transient_guids = Vec::new();
        for (tag, entry) in entries {
            if let PendingAck::OnDisk {
                is_persistent,
                guid,
            } = entry
            {
                if is_persistent {
                    index_acks.push(tag);
                    persistent_guids.push(guid);
                } else {
                    transient_guids.push(guid);
                }
            }
        }
        if !index_acks.is_empty() {
            self.index.ack(&index_acks)?;
        }
        if !persistent_guids.is_empty() {
            self.persistent_client.remove(&persistent_guids)?;
        }
        if !transient_guids.is_empty() {
            self.transient_client.remove(&transient_guids)?;
        }
        self.persistent_count = 0;
        self.index.delete_and_terminate()?;
        self.persistent_client.delete();
        self.transient_client.delete();
        debug!(queue = %self.name, "queue deleted");
        Ok(())
    }

    /// Clean shutdown: flush parked commits, hand pending acks back to the
    /// stores (persistent entries stay put so they are redelivered after
    /// restart), and write the checkpoint terms through the index.
    pub fn terminate(mut self) -> QueueResult<RecoveryTerms> {
        self.tx_commit_index()?;
        let entries = std::mem::take(&mut self.pending_ack);
        let mut transient_guids = Vec::new();
        for entry in entries.into_values() {
            if let PendingAck::OnDisk {
                is_persistent: false,
                guid,
            } = entry
            {
                transient_guids.push(guid);
            }
        }
        if !transient_guids.is_empty() {
            self.transient_client.remove(&transient_guids)?;
        }
        let terms = RecoveryTerms {
            persistent_ref: self.persistent_ref,
            transient_ref: self.transient_ref,
            persistent_count: self.persistent_count,
        };
        self.index.terminate(&terms)?;
        self.persistent_client.terminate();
        self.transient_client.terminate();
        debug!(
            queue = %self.name,
            len = self.len,
            persistent = self.persistent_count,
            "queue terminated clean"
        );
        Ok(terms)
    }

    /// Buffer a publish under `txn`. Persistent bodies on a durable queue
    /// are written through now so the commit-time sync is cheap (phase one
    /// of the two-phase commit).
    pub fn tx_publish(&mut self, txn: TxnId, msg: Message) -> QueueResult<()> {
        if self.durable && msg.is_persistent {
            self.persistent_client.write(msg.guid, &msg.body)?;
        }
        self.txns.lookup_or_create(txn).pending_messages.push(msg);
        Ok(())
    }

    pub fn tx_ack(&mut self, txn: TxnId, ack_tags: Vec<SeqId>) {
        self.txns.lookup_or_create(txn).pending_acks.push(ack_tags);
    }

    /// Discard a transaction, dropping its eagerly-written bodies. Returns
    /// the ack tags the caller must deal with again.
    pub fn tx_rollback(&mut self, txn: TxnId) -> QueueResult<Vec<SeqId>> {
        let buf = self.txns.take(txn);
        if self.durable {
            let guids: Vec<Guid> = buf
                .pending_messages
                .iter()
                .filter(|m| m.is_persistent)
                .map(|m| m.guid)
                .collect();
            if !guids.is_empty() {
                self.persistent_client.remove(&guids)?;
            }
        }
        Ok(buf.pending_acks.into_iter().flatten().collect())
    }

    /// Commit a transaction. With persistent publishes on a durable queue
    /// the commit parks until the store confirms the bodies durable (phase
    /// two); the confirmation posts a wakeup that the next `idle_timeout`
    /// drains, and only then do the publishes, acks and `on_commit` run.
    /// Everything else applies immediately. Returns the transaction's ack
    /// tags.
    pub fn tx_commit(
        &mut self,
        txn: TxnId,
        on_commit: Box<dyn FnOnce() + Send>,
    ) -> QueueResult<Vec<SeqId>> {
        let buf = self.txns.take(txn);
        let acks: Vec<SeqId> = buf.pending_acks.into_iter().flatten().collect();
        let pubs = buf.pending_messages;
        let persistent_guids: Vec<Guid> = if self.durable {
            pubs.iter()
                .filter(|m| m.is_persistent)
                .map(|m| m.guid)
                .collect()
        } else {
            Vec::new()
        };

        let fun = self.register_fun(on_commit);
        let commit = SyncCommit {
            pubs,
            acks: acks.clone(),
            fun,
        };
        if persistent_guids.is_empty() {
            self.on_sync.push(commit);
            self.tx_commit_index()?;
        } else {
            let sender = self.sync_tx.clone();
            self.persistent_client.sync(
                &persistent_guids,
                Box::new(move || {
                    let _ = sender.send(commit);
                }),
            )?;
            trace!(queue = %self.name, txn = %txn, "commit parked until store sync");
        }
        Ok(acks)
    }

    /// Outstanding on-sync work that an idle actor should drain.
    pub fn needs_idle_timeout(&self) -> bool {
        !self.on_sync.is_empty() || !self.sync_rx.is_empty()
    }

    /// Idle hook: apply parked commits and run one phase-change pass.
    pub fn idle_timeout(&mut self) -> QueueResult<()> {
        self.tx_commit_index()?;
        self.reduce_memory_use()?;
        self.assert_invariants();
        Ok(())
    }

    /// Pre-hibernate hook: push the index write buffer out so the actor
    /// can sleep without holding it.
    pub fn handle_pre_hibernate(&mut self) -> QueueResult<()> {
        self.index.flush()?;
        Ok(())
    }

    /// Close the current rate windows and estimate how many seconds of
    /// messages RAM currently holds. `None` means unbounded (no observed
    /// flow). The stored duration target is re-applied against the fresh
    /// rates.
    pub fn ram_duration(&mut self) -> QueueResult<Option<f64>> {
        let now = self.clock.now_micros();
        let duration = self.rates.measure(now, self.ram_msg_count);
        self.apply_duration_target(self.duration_target)?;
        Ok(duration)
    }

    /// Set the target seconds-of-messages to keep in RAM (`None` for
    /// unbounded). Lowering the target demotes eagerly; raising it never
    /// promotes, because only fetches prove the memory is wanted.
    pub fn set_ram_duration_target(&mut self, target_secs: Option<f64>) -> QueueResult<()> {
        self.apply_duration_target(target_secs)
    }

    fn apply_duration_target(&mut self, target_secs: Option<f64>) -> QueueResult<()> {
        self.duration_target = target_secs;
        let new_target = target_secs.map(|secs| (secs * self.rates.combined_avg()).floor() as u64);
        let lowered = match (new_target, self.target_ram_msg_count) {
            (Some(_), None) => true,
            (Some(new), Some(old)) => new < old,
            (None, _) => false,
        };
        self.target_ram_msg_count = new_target;
        if lowered {
            trace!(queue = %self.name, target = ?new_target, "ram target lowered");
            self.reduce_memory_use()?;
            self.assert_invariants();
        }
        Ok(())
    }

    fn publish_inner(
        &mut self,
        msg: Message,
        is_delivered: bool,
        msg_on_disk: bool,
    ) -> QueueResult<SeqId> {
        let is_persistent = msg.is_persistent && self.durable;
        let seq_id = self.next_seq_id;
        self.next_seq_id = seq_id.next();
        let mut status = MsgStatus::new(seq_id, &msg, is_persistent);
        status.is_delivered = is_delivered;
        status.msg_on_disk = msg_on_disk;
        self.maybe_write_msg_to_disk(false, &mut status)?;
        self.maybe_write_index_to_disk(false, &mut status)?;
        if self.pipeline.q3.is_empty() {
            self.pipeline.q4.push_back(status);
        } else {
            self.pipeline.q1.push_back(status);
        }
        self.len += 1;
        self.ram_msg_count += 1;
        if is_persistent {
            self.persistent_count += 1;
        }
        self.rates.note_in();
        Ok(seq_id)
    }

    fn internal_fetch(
        &mut self,
        ack_required: bool,
        mut status: MsgStatus,
    ) -> QueueResult<FetchResult> {
        if status.index_on_disk && !status.is_delivered {
            self.index.deliver(&[status.seq_id])?;
        }
        let body = status
            .body
            .clone()
            .expect("read-head residency always holds a body");
        let was_delivered = status.is_delivered;
        let message = Message::with_guid(status.guid, body, status.is_persistent);

        let ack_tag = if ack_required {
            status.is_delivered = true;
            let tag = status.seq_id;
            self.pending_ack.insert(tag, PendingAck::from_status(status));
            Some(tag)
        } else {
            if status.msg_on_disk {
                self.client_for(status.is_persistent).remove(&[status.guid])?;
            }
            if status.index_on_disk {
                self.index.ack(&[status.seq_id])?;
            }
            if status.is_persistent {
                self.persistent_count -= 1;
            }
            None
        };
        self.len -= 1;
        self.ram_msg_count -= 1;
        self.rates.note_out();
        Ok(FetchResult {
            message,
            is_delivered: was_delivered,
            ack_tag,
            remaining: self.len,
        })
    }

    /// Promote one element across the Q3/Q4 boundary, reading its body
    /// back if it was shed. Refills Q3 from Δ (or slides Q1 down) when the
    /// promotion empties it. Returns false when there is nothing left.
    fn pull_from_q3(&mut self) -> QueueResult<bool> {
        let Some(mut status) = self.pipeline.q3.pop_front() else {
            debug_assert!(self.pipeline.delta.is_blank());
            return Ok(false);
        };
        if status.body.is_none() {
            let body = self.client_for(status.is_persistent).read(status.guid)?;
            status.body = Some(body);
        }
        self.ram_msg_count += 1;
        self.pipeline.q4.push_back(status);
        if self.pipeline.q3.is_empty() {
            if !self.pipeline.delta.is_blank() {
                self.maybe_deltas_to_betas()?;
            }
            if self.pipeline.q3.is_empty() && self.pipeline.delta.is_blank() {
                let q1 = std::mem::take(&mut self.pipeline.q1);
                self.pipeline.q4.extend(q1);
            }
        }
        Ok(true)
    }

    /// One phase-change pass toward the RAM target: shed at most one
    /// IO_BATCH of bodies, then index entries if over the permitted count,
    /// then collapse everything cold into Δ when the target is zero.
    fn reduce_memory_use(&mut self) -> QueueResult<()> {
        let Some(target) = self.target_ram_msg_count else {
            return Ok(());
        };
        let excess = (self.ram_msg_count as u64).saturating_sub(target);
        let chunk = excess.min(IO_BATCH as u64) as usize;
        if chunk > 0 {
            self.push_alphas_to_betas(chunk)?;
        }
        self.limit_ram_index()?;
        if target == 0 {
            self.push_betas_to_deltas()?;
        }
        Ok(())
    }

    /// α→β: shed bodies, preferring the elements farthest from the read
    /// head (Q1 from its boundary with Q2, then Q4 from its boundary with
    /// Q3).
    fn push_alphas_to_betas(&mut self, quota: usize) -> QueueResult<()> {
        let mut remaining = quota;
        while remaining > 0 {
            let Some(mut status) = self.pipeline.q1.pop_front() else {
                break;
            };
            self.demote_alpha(&mut status)?;
            if self.pipeline.delta.is_blank() {
                // Q2 must stay empty while Δ is blank; Q3 adjoins Q1
                // directly then.
                self.pipeline.q3.push_back(status);
            } else {
                self.pipeline.q2.push_back(status);
            }
            remaining -= 1;
        }
        while remaining > 0 {
            let Some(mut status) = self.pipeline.q4.pop_back() else {
                break;
            };
            self.demote_alpha(&mut status)?;
            self.pipeline.q3.push_front(status);
            remaining -= 1;
        }
        if remaining < quota {
            trace!(queue = %self.name, demoted = quota - remaining, "alpha bodies shed");
        }
        Ok(())
    }

    fn demote_alpha(&mut self, status: &mut MsgStatus) -> QueueResult<()> {
        self.maybe_write_msg_to_disk(true, status)?;
        status.body = None;
        self.ram_msg_count -= 1;
        Ok(())
    }

    /// β→γ: when RAM holds more unpersisted index entries than permitted,
    /// write exactly one IO_BATCH of them out. The permitted count
    /// `β − ⌊β²/(len − Δcount)⌋` keeps the γ fraction ahead of the β
    /// fraction, so a later β/γ→δ conversion is cheap.
    fn limit_ram_index(&mut self) -> QueueResult<()> {
        let Some(permitted) = self.permitted_ram_index_count() else {
            return Ok(());
        };
        let ram_index = self.pipeline.ram_index_count() as u64;
        if ram_index.saturating_sub(permitted) < IO_BATCH as u64 {
            return Ok(());
        }
        let index = &mut self.index;
        let wrote = self
            .pipeline
            .q2
            .persist_indices_from_front(IO_BATCH, |status| write_index_entry(index, status))?;
        if wrote < IO_BATCH {
            self.pipeline
                .q3
                .persist_indices_from_front(IO_BATCH - wrote, |status| {
                    write_index_entry(index, status)
                })?;
        }
        trace!(queue = %self.name, "index entries shed");
        Ok(())
    }

    fn permitted_ram_index_count(&self) -> Option<u64> {
        if self.len == 0 {
            return None;
        }
        let betas = (self.pipeline.q2.len() + self.pipeline.q3.len()) as u64;
        let denom = (self.len as u64).saturating_sub(self.pipeline.delta.count());
        if denom == 0 {
            return Some(0);
        }
        let squeeze = ((betas as u128 * betas as u128) / denom as u128) as u64;
        Some(betas.saturating_sub(squeeze))
    }

    /// β/γ→δ: absorb Q2 entirely and Q3's far end into the range, forcing
    /// any survivor's index entry out first. Q3 keeps everything inside
    /// one segment boundary of its read end, since that is what the next
    /// δ→β load would pull straight back.
    fn push_betas_to_deltas(&mut self) -> QueueResult<()> {
        while let Some(mut status) = self.pipeline.q2.pop_front() {
            self.maybe_write_index_to_disk(true, &mut status)?;
            self.pipeline.delta.absorb_high(status.seq_id);
        }
        let Some(limit) = self
            .pipeline
            .q3
            .front()
            .map(|status| self.index.next_segment_boundary(status.seq_id))
        else {
            return Ok(());
        };
        while let Some(seq_id) = self.pipeline.q3.back().map(|status| status.seq_id) {
            if seq_id < limit {
                break;
            }
            let mut status = self
                .pipeline
                .q3
                .pop_back()
                .expect("peeked element present");
            self.maybe_write_index_to_disk(true, &mut status)?;
            self.pipeline.delta.absorb_low(status.seq_id);
        }
        Ok(())
    }

    /// δ→β: load up to one index segment from the cold range onto Q3's
    /// warm tail, dropping transient orphans from before the threshold.
    /// When the range drains, Q2 slides down onto Q3.
    fn maybe_deltas_to_betas(&mut self) -> QueueResult<()> {
        if self.pipeline.delta.is_blank() {
            return Ok(());
        }
        loop {
            let start = self.pipeline.delta.start();
            let end = self.pipeline.delta.end();
            let read_to = self.index.next_segment_boundary(start).min(end);
            let entries = self.index.read(start, read_to)?;

            let mut delivers = Vec::new();
            let mut orphan_acks = Vec::new();
            let mut loaded = 0u64;
            for entry in &entries {
                if entry.seq_id < self.transient_threshold && !entry.is_persistent {
                    if !entry.is_delivered {
                        delivers.push(entry.seq_id);
                    }
                    orphan_acks.push(entry.seq_id);
                    continue;
                }
                self.pipeline.q3.push_back(MsgStatus::from_index_entry(entry));
                loaded += 1;
            }
            if !delivers.is_empty() {
                self.index.deliver(&delivers)?;
            }
            if !orphan_acks.is_empty() {
                trace!(
                    queue = %self.name,
                    dropped = orphan_acks.len(),
                    "transient orphans dropped on delta load"
                );
                self.index.ack(&orphan_acks)?;
            }

            let before = self.pipeline.delta.count();
            self.pipeline.delta.advance(read_to, loaded);
            if self.pipeline.delta.is_blank() {
                // A recovered count hint can overshoot what the index
                // really held; reconcile when the range runs out early.
                let residue = before.saturating_sub(loaded);
                if residue > 0 {
                    warn!(
                        queue = %self.name,
                        residue,
                        "delta count hint exceeded recovered entries"
                    );
                    self.len -= residue as usize;
                    self.persistent_count = self.persistent_count.saturating_sub(residue);
                }
                let mut q2 = std::mem::take(&mut self.pipeline.q2);
                self.pipeline.q3.append(&mut q2);
                return Ok(());
            }
            if loaded > 0 {
                return Ok(());
            }
            // The whole range was filtered or acked; keep walking.
        }
    }

    /// Apply parked commits: acks first, then publishes (persistent bodies
    /// were already written by `tx_publish`), one index sync over the lot,
    /// then the post-commit functions.
    fn tx_commit_index(&mut self) -> QueueResult<()> {
        self.drain_sync_wakeups();
        if self.on_sync.is_empty() {
            return Ok(());
        }
        let on_sync = std::mem::take(&mut self.on_sync);
        self.ack(&on_sync.acks)?;
        let mut persistent_seqs = Vec::new();
        for msg in on_sync.pubs {
            let written = self.durable && msg.is_persistent;
            let seq_id = self.publish_inner(msg, false, written)?;
            if written {
                persistent_seqs.push(seq_id);
            }
        }
        self.index.sync(&persistent_seqs)?;
        for handle in on_sync.fun_handles {
            if let Some(fun) = self.commit_funs.remove(&handle) {
                fun();
            }
        }
        self.assert_invariants();
        Ok(())
    }

    fn drain_sync_wakeups(&mut self) {
        while let Ok(commit) = self.sync_rx.try_recv() {
            self.on_sync.push(commit);
        }
    }

    fn register_fun(&mut self, fun: Box<dyn FnOnce() + Send>) -> u64 {
        let handle = self.next_fun_handle;
        self.next_fun_handle += 1;
        self.commit_funs.insert(handle, fun);
        handle
    }

    fn remove_queue_entries(&mut self, entries: &[MsgStatus]) -> QueueResult<()> {
        let mut delivers = Vec::new();
        let mut acks = Vec::new();
        let mut persistent_guids = Vec::new();
        let mut transient_guids = Vec::new();
        for status in entries {
            if status.msg_on_disk {
                if status.is_persistent {
                    persistent_guids.push(status.guid);
                } else {
                    transient_guids.push(status.guid);
                }
            }
            if status.index_on_disk {
                if !status.is_delivered {
                    delivers.push(status.seq_id);
                }
                acks.push(status.seq_id);
            }
            if status.is_persistent {
                self.persistent_count -= 1;
            }
        }
        if !delivers.is_empty() {
            self.index.deliver(&delivers)?;
        }
        if !acks.is_empty() {
            self.index.ack(&acks)?;
        }
        if !persistent_guids.is_empty() {
            self.persistent_client.remove(&persistent_guids)?;
        }
        if !transient_guids.is_empty() {
            self.transient_client.remove(&transient_guids)?;
        }
        Ok(())
    }

    fn maybe_write_msg_to_disk(&mut self, force: bool, status: &mut MsgStatus) -> QueueResult<()> {
        if status.msg_on_disk {
            return Ok(());
        }
        if !(force || status.is_persistent) {
            return Ok(());
        }
        let body = status
            .body
            .as_ref()
            .expect("residency without a body cannot be written");
        self.client_for(status.is_persistent).write(status.guid, body)?;
        status.msg_on_disk = true;
        Ok(())
    }

    fn maybe_write_index_to_disk(
        &mut self,
        force: bool,
        status: &mut MsgStatus,
    ) -> QueueResult<()> {
        if status.index_on_disk {
            return Ok(());
        }
        if !(force || status.is_persistent) {
            return Ok(());
        }
        debug_assert!(status.msg_on_disk, "index entry must not precede the body");
        self.index
            .publish(status.guid, status.seq_id, status.is_persistent)?;
        if status.is_delivered {
            self.index.deliver(&[status.seq_id])?;
        }
        status.index_on_disk = true;
        Ok(())
    }

    fn client_for(&self, is_persistent: bool) -> &StoreClient {
        if is_persistent {
            &self.persistent_client
        } else {
            &self.transient_client
        }
    }

    #[cfg(debug_assertions)]
    fn assert_invariants(&self) {
        assert!(
            self.pipeline.invariants_hold(self.len),
            "queue invariants violated: len={}, depths={:?}",
            self.len,
            self.depths()
        );
        assert_eq!(
            self.ram_msg_count,
            self.pipeline.ram_msg_count(),
            "ram_msg_count drift"
        );
    }

    #[cfg(not(debug_assertions))]
    fn assert_invariants(&self) {}
}

fn write_index_entry(
    index: &mut QueueIndex,
    status: &MsgStatus,
) -> Result<(), QueueIndexError> {
    index.publish(status.guid, status.seq_id, status.is_persistent)?;
    if status.is_delivered {
        index.deliver(&[status.seq_id])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SystemClock;
    use bytes::Bytes;
    use tempfile::TempDir;

    const SEG: u64 = 16;

    struct World {
        _temp: TempDir,
        persistent: MsgStore,
        transient: MsgStore,
        index_dir: std::path::PathBuf,
        config: Config,
    }

    impl World {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let persistent =
                MsgStore::open(temp.path().join("persistent"), &[], 1024 * 1024).unwrap();
            let transient =
                MsgStore::fresh(temp.path().join("transient"), 1024 * 1024).unwrap();
            let index_dir = temp.path().join("queues");
            let config = Config {
                segment_entry_count: SEG,
                ..Config::default()
            };
            Self {
                _temp: temp,
                persistent,
                transient,
                index_dir,
                config,
            }
        }

        fn queue(&self, durable: bool) -> TieredQueue {
            TieredQueue::init(
                QueueName::new("orders").unwrap(),
                durable,
                None,
                &self.persistent,
                &self.transient,
                &self.index_dir,
                &self.config,
                Arc::new(SystemClock),
            )
            .unwrap()
        }
    }

    fn body(text: &str) -> Bytes {
        Bytes::copy_from_slice(text.as_bytes())
    }

    #[test]
    fn publish_then_fetch_preserves_order() {
        let world = World::new();
        let mut queue = world.queue(false);
        for text in ["a", "b", "c"] {
            queue.publish(Message::new(body(text), false)).unwrap();
        }
        assert_eq!(queue.len(), 3);
        for expected in ["a", "b", "c"] {
            let fetched = queue.fetch(false).unwrap().expect("message present");
            assert_eq!(fetched.message.body, body(expected));
            assert_eq!(fetched.ack_tag, None);
            assert!(!fetched.is_delivered);
        }
        assert!(queue.fetch(false).unwrap().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn ack_required_fetch_parks_in_pending_ack() {
        let world = World::new();
        let mut queue = world.queue(false);
        queue.publish(Message::new(body("m"), false)).unwrap();
        let fetched = queue.fetch(true).unwrap().unwrap();
        let tag = fetched.ack_tag.expect("ack expected");
        assert_eq!(queue.len(), 0);
        queue.ack(&[tag]).unwrap();
        assert!(queue.fetch(true).unwrap().is_none());
    }

    #[test]
    fn requeue_marks_redelivered() {
        let world = World::new();
        let mut queue = world.queue(true);
        queue.publish(Message::new(body("m1"), true)).unwrap();
        let fetched = queue.fetch(true).unwrap().unwrap();
        assert!(!fetched.is_delivered);
        let tag = fetched.ack_tag.unwrap();
        queue.requeue(&[tag]).unwrap();
        assert_eq!(queue.len(), 1);
        let again = queue.fetch(true).unwrap().unwrap();
        assert!(again.is_delivered);
        assert_eq!(again.message.body, body("m1"));
    }

    #[test]
    fn target_zero_demotes_everything_out_of_ram() {
        let world = World::new();
        let mut queue = world.queue(false);
        let total = 5 * SEG as usize;
        for i in 0..total {
            queue
                .publish(Message::new(body(&format!("m{i}")), false))
                .unwrap();
        }
        queue.set_ram_duration_target(Some(0.0)).unwrap();
        for _ in 0..(total / IO_BATCH + 2) {
            queue.idle_timeout().unwrap();
        }
        assert_eq!(queue.ram_msg_count(), 0);
        assert_eq!(queue.len(), total);
        assert!(queue.depths().delta > 0);

        for i in 0..total {
            let fetched = queue.fetch(false).unwrap().expect("message survives");
            assert_eq!(fetched.message.body, body(&format!("m{i}")));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn raising_target_never_touches_disk() {
        let world = World::new();
        let mut queue = world.queue(false);
        for i in 0..10 {
            queue
                .publish(Message::new(body(&format!("m{i}")), false))
                .unwrap();
        }
        // Establish real rates so finite duration targets stay generous.
        let _ = queue.ram_duration().unwrap();
        queue.set_ram_duration_target(Some(1e6)).unwrap();
        queue.set_ram_duration_target(Some(1e9)).unwrap();
        assert_eq!(queue.ram_msg_count(), 10);
        let transient_dir = world._temp.path().join("transient");
        let blobs = std::fs::read_dir(transient_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "blob"))
            .count();
        assert_eq!(blobs, 0);
    }

    #[test]
    fn non_durable_commit_applies_immediately() {
        let world = World::new();
        let mut queue = world.queue(false);
        let txn = TxnId::random();
        queue.tx_publish(txn, Message::new(body("t1"), false)).unwrap();
        let (tx, rx) = crossbeam::channel::unbounded();
        queue
            .tx_commit(txn, Box::new(move || tx.send(()).unwrap()))
            .unwrap();
        assert!(rx.try_recv().is_ok());
        assert_eq!(queue.len(), 1);
        assert!(!queue.needs_idle_timeout());
    }

    #[test]
    fn durable_commit_waits_for_idle_timeout() {
        let world = World::new();
        let mut queue = world.queue(true);
        let txn = TxnId::random();
        queue.tx_publish(txn, Message::new(body("t1"), true)).unwrap();
        let (tx, rx) = crossbeam::channel::unbounded();
        queue
            .tx_commit(txn, Box::new(move || tx.send(()).unwrap()))
            .unwrap();
        // Parked: visible only after the wakeup is drained.
        assert_eq!(queue.len(), 0);
        assert!(rx.try_recv().is_err());
        assert!(queue.needs_idle_timeout());

        queue.idle_timeout().unwrap();
        assert!(rx.try_recv().is_ok());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn tx_rollback_returns_acks_and_drops_bodies() {
        let world = World::new();
        let mut queue = world.queue(true);
        queue.publish(Message::new(body("m"), true)).unwrap();
        let tag = queue.fetch(true).unwrap().unwrap().ack_tag.unwrap();

        let txn = TxnId::random();
        let msg = Message::new(body("t"), true);
        let guid = msg.guid;
        queue.tx_publish(txn, msg).unwrap();
        queue.tx_ack(txn, vec![tag]);
        let acks = queue.tx_rollback(txn).unwrap();
        assert_eq!(acks, vec![tag]);
        assert!(!world.persistent.contains(guid));
        // The fetched message is still pending-acked.
        queue.requeue(&acks).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn purge_returns_count_and_keeps_pending_acks() {
        let world = World::new();
        let mut queue = world.queue(false);
        for i in 0..4 {
            queue
                .publish(Message::new(body(&format!("m{i}")), false))
                .unwrap();
        }
        let tag = queue.fetch(true).unwrap().unwrap().ack_tag.unwrap();
        assert_eq!(queue.purge().unwrap(), 3);
        assert!(queue.is_empty());
        queue.requeue(&[tag]).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn zero_size_index_batch_is_a_no_op() {
        let world = World::new();
        let mut queue = world.queue(false);
        for i in 0..2 * SEG as usize {
            queue
                .publish(Message::new(body(&format!("m{i}")), false))
                .unwrap();
        }
        queue.set_ram_duration_target(Some(0.0)).unwrap();
        let before = queue.depths();
        let before_ram_index = queue.ram_index_count();

        // Below the batch threshold: another pass writes nothing and
        // moves nothing.
        queue.idle_timeout().unwrap();
        assert_eq!(queue.depths(), before);
        assert_eq!(queue.ram_index_count(), before_ram_index);
    }

    #[test]
    fn consecutive_delta_loads_equal_one_bigger_load() {
        let world = World::new();
        let mut queue = world.queue(false);
        let total = 3 * SEG as usize;
        for i in 0..total {
            queue
                .publish(Message::new(body(&format!("m{i}")), false))
                .unwrap();
        }
        queue.set_ram_duration_target(Some(0.0)).unwrap();
        queue.idle_timeout().unwrap();
        let before = queue.depths();
        assert!(before.delta >= 2 * SEG, "delta must span two segments");

        queue.maybe_deltas_to_betas().unwrap();
        let mid = queue.depths();
        assert!(mid.q3 > before.q3);
        queue.maybe_deltas_to_betas().unwrap();
        let after = queue.depths();
        // Two loads with nothing in between drain exactly what one load
        // over both segments would have.
        assert_eq!(after.q3, before.q3 + before.delta as usize);
        assert_eq!(after.delta, 0);
        queue.assert_invariants();

        for i in 0..total {
            let fetched = queue.fetch(false).unwrap().expect("message present");
            assert_eq!(fetched.message.body, body(&format!("m{i}")));
        }
    }

    #[test]
    fn publish_delivered_blank_ack_leaves_state_untouched() {
        let world = World::new();
        let mut queue = world.queue(false);
        let ack = queue
            .publish_delivered(false, Message::new(body("m"), false))
            .unwrap();
        assert_eq!(ack, None);
        assert!(queue.is_empty());

        let tag = queue
            .publish_delivered(true, Message::new(body("n"), false))
            .unwrap()
            .expect("ack tag");
        queue.ack(&[tag]).unwrap();
    }
}
