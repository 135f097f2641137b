//! Segmented journal: buffered appends, range reads, per-segment GC.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::core::{Guid, QueueName, SeqId};

use super::entry::{encode_frame, replay_segment, IndexRecord};
use super::{QueueIndexError, QueueIndexResult, RecoveryTerms, TERMS_FILE};

const SEGMENT_SUFFIX: &str = ".idx";
const MAX_BUFFERED_RECORDS: usize = 4096;

/// One unacked publish, as handed back by a range read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub guid: Guid,
    pub seq_id: SeqId,
    pub is_persistent: bool,
    pub is_delivered: bool,
}

#[derive(Clone, Copy, Debug, Default)]
struct SegmentCounts {
    published: u64,
    acked: u64,
}

#[derive(Clone, Copy, Debug)]
struct LiveEntry {
    guid: Guid,
    is_persistent: bool,
    is_delivered: bool,
}

/// A queue's index. Owned by exactly one queue engine; appends are buffered
/// in memory until `flush`/`sync`, so a publish never blocks on the disk.
pub struct QueueIndex {
    dir: PathBuf,
    segment_entries: u64,
    buffer: Vec<IndexRecord>,
    dirty_segments: BTreeSet<u64>,
    segments: BTreeMap<u64, SegmentCounts>,
    low: SeqId,
    next_seq_id: SeqId,
}

impl QueueIndex {
    /// Open (or create) a queue's index, replaying every surviving segment.
    ///
    /// When `clean` is false the previous shutdown did not go through
    /// terminate: publishes whose GUID the `contains` check rejects are
    /// acked away during the scan. Returns the count of surviving unacked
    /// entries alongside the index.
    pub fn init(
        base_dir: &Path,
        queue_name: &QueueName,
        clean: bool,
        contains: impl Fn(Guid) -> bool,
        segment_entries: u64,
    ) -> QueueIndexResult<(u64, Self)> {
        let dir = base_dir.join(queue_name.escaped());
        fs::create_dir_all(&dir).map_err(|source| QueueIndexError::io(&dir, source))?;

        let mut segments: BTreeMap<u64, SegmentCounts> = BTreeMap::new();
        let mut live: BTreeMap<SeqId, LiveEntry> = BTreeMap::new();
        let mut max_seq: Option<SeqId> = None;

        for path in segment_paths(&dir)? {
            let replay = replay_segment(&path)?;
            if let Some(torn_at) = replay.torn_at {
                debug!(path = %path.display(), torn_at, "truncating torn segment tail");
                let file = OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .map_err(|source| QueueIndexError::io(&path, source))?;
                file.set_len(torn_at)
                    .map_err(|source| QueueIndexError::io(&path, source))?;
            }
            for record in replay.records {
                let seg = record.seq_id().get() / segment_entries;
                let counts = segments.entry(seg).or_default();
                match record {
                    IndexRecord::Publish {
                        seq_id,
                        guid,
                        is_persistent,
                    } => {
                        counts.published += 1;
                        max_seq = Some(max_seq.map_or(seq_id, |m: SeqId| m.max(seq_id)));
                        live.insert(
                            seq_id,
                            LiveEntry {
                                guid,
                                is_persistent,
                                is_delivered: false,
                            },
                        );
                    }
                    IndexRecord::Deliver { seq_id } => {
                        if let Some(entry) = live.get_mut(&seq_id) {
                            entry.is_delivered = true;
                        }
                    }
                    IndexRecord::Ack { seq_id } => {
                        counts.acked += 1;
                        live.remove(&seq_id);
                    }
                }
            }
        }

        let next_seq_id = max_seq.map_or(SeqId::new(0), SeqId::next);
        let mut index = Self {
            dir,
            segment_entries,
            buffer: Vec::new(),
            dirty_segments: BTreeSet::new(),
            segments,
            low: next_seq_id,
            next_seq_id,
        };

        if !clean {
            let orphans: Vec<SeqId> = live
                .iter()
                .filter(|(_, entry)| !contains(entry.guid))
                .map(|(&seq_id, _)| seq_id)
                .collect();
            if !orphans.is_empty() {
                debug!(
                    queue = %queue_name,
                    dropped = orphans.len(),
                    "dirty recovery dropped publishes with no recovered body"
                );
                for &seq_id in &orphans {
                    live.remove(&seq_id);
                }
                index.ack(&orphans)?;
                index.flush()?;
            }
        }

        if let Some((&first, _)) = live.iter().next() {
            index.low = first;
        }
        Ok((live.len() as u64, index))
    }

    /// Recovered `(low, next)` seq-id bounds: the lowest unacked publish
    /// (or `next` when the index is empty) and one past the highest seq id
    /// ever published.
    pub fn bounds(&self) -> (SeqId, SeqId) {
        (self.low, self.next_seq_id)
    }

    pub fn next_segment_boundary(&self, seq_id: SeqId) -> SeqId {
        SeqId::new((seq_id.get() / self.segment_entries + 1) * self.segment_entries)
    }

    pub fn publish(&mut self, guid: Guid, seq_id: SeqId, is_persistent: bool) -> QueueIndexResult<()> {
        self.segments
            .entry(seq_id.get() / self.segment_entries)
            .or_default()
            .published += 1;
        if seq_id >= self.next_seq_id {
            self.next_seq_id = seq_id.next();
        }
        self.append(IndexRecord::Publish {
            seq_id,
            guid,
            is_persistent,
        })
    }

    pub fn deliver(&mut self, seq_ids: &[SeqId]) -> QueueIndexResult<()> {
        for &seq_id in seq_ids {
            self.append(IndexRecord::Deliver { seq_id })?;
        }
        Ok(())
    }

    pub fn ack(&mut self, seq_ids: &[SeqId]) -> QueueIndexResult<()> {
        for &seq_id in seq_ids {
            self.segments
                .entry(seq_id.get() / self.segment_entries)
                .or_default()
                .acked += 1;
            self.append(IndexRecord::Ack { seq_id })?;
        }
        Ok(())
    }

    /// Read the unacked publishes in `[from, to)`, in seq order.
    pub fn read(&mut self, from: SeqId, to: SeqId) -> QueueIndexResult<Vec<IndexEntry>> {
        if from >= to {
            return Ok(Vec::new());
        }
        self.flush()?;

        let first_seg = from.get() / self.segment_entries;
        let last_seg = (to.get() - 1) / self.segment_entries;
        let mut live: BTreeMap<SeqId, LiveEntry> = BTreeMap::new();
        for seg in first_seg..=last_seg {
            let path = self.segment_path(seg);
            if !path.exists() {
                continue;
            }
            for record in replay_segment(&path)?.records {
                match record {
                    IndexRecord::Publish {
                        seq_id,
                        guid,
                        is_persistent,
                    } => {
                        live.insert(
                            seq_id,
                            LiveEntry {
                                guid,
                                is_persistent,
                                is_delivered: false,
                            },
                        );
                    }
                    IndexRecord::Deliver { seq_id } => {
                        if let Some(entry) = live.get_mut(&seq_id) {
                            entry.is_delivered = true;
                        }
                    }
                    IndexRecord::Ack { seq_id } => {
                        live.remove(&seq_id);
                    }
                }
            }
        }

        Ok(live
            .range(from..to)
            .map(|(&seq_id, entry)| IndexEntry {
                guid: entry.guid,
                seq_id,
                is_persistent: entry.is_persistent,
                is_delivered: entry.is_delivered,
            })
            .collect())
    }

    /// Write buffered records through to their segment files.
    pub fn flush(&mut self) -> QueueIndexResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let mut grouped: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
        for record in self.buffer.drain(..) {
            let seg = record.seq_id().get() / self.segment_entries;
            grouped
                .entry(seg)
                .or_default()
                .extend_from_slice(&encode_frame(&record));
        }
        let touched: Vec<u64> = grouped.keys().copied().collect();
        for (seg, bytes) in grouped {
            let path = self.segment_path(seg);
            let mut file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(&path)
                .map_err(|source| QueueIndexError::io(&path, source))?;
            file.write_all(&bytes)
                .map_err(|source| QueueIndexError::io(&path, source))?;
            self.dirty_segments.insert(seg);
        }
        self.collect_dead_segments(&touched)?;
        Ok(())
    }

    /// Flush, then fsync every segment touched since the last sync. The
    /// seq ids are the entries the caller needs durable; syncing the dirty
    /// set covers them.
    pub fn sync(&mut self, _seq_ids: &[SeqId]) -> QueueIndexResult<()> {
        self.flush()?;
        let dirty = std::mem::take(&mut self.dirty_segments);
        for seg in dirty {
            let path = self.segment_path(seg);
            if !path.exists() {
                continue;
            }
            let file = File::open(&path).map_err(|source| QueueIndexError::io(&path, source))?;
            file.sync_all()
                .map_err(|source| QueueIndexError::io(&path, source))?;
        }
        Ok(())
    }

    /// Clean shutdown: make everything durable and leave the checkpoint
    /// terms behind for the next recover.
    pub fn terminate(&mut self, terms: &RecoveryTerms) -> QueueIndexResult<()> {
        self.sync(&[])?;
        let bytes =
            serde_json::to_vec_pretty(terms).map_err(|err| QueueIndexError::TermsInvalid {
                reason: err.to_string(),
            })?;
        let path = self.dir.join(TERMS_FILE);
        let tmp_path = self.dir.join("clean.json.tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|source| QueueIndexError::io(&tmp_path, source))?;
        file.write_all(&bytes)
            .map_err(|source| QueueIndexError::io(&tmp_path, source))?;
        file.sync_all()
            .map_err(|source| QueueIndexError::io(&tmp_path, source))?;
        fs::rename(&tmp_path, &path).map_err(|source| QueueIndexError::io(&path, source))?;
        let dir_file =
            File::open(&self.dir).map_err(|source| QueueIndexError::io(&self.dir, source))?;
        dir_file
            .sync_all()
            .map_err(|source| QueueIndexError::io(&self.dir, source))?;
        debug!(dir = %self.dir.display(), "queue index terminated clean");
        Ok(())
    }

    /// Remove the queue's entire index directory.
    pub fn delete_and_terminate(self) -> QueueIndexResult<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(QueueIndexError::io(&self.dir, source)),
        }
    }

    fn append(&mut self, record: IndexRecord) -> QueueIndexResult<()> {
        self.buffer.push(record);
        if self.buffer.len() >= MAX_BUFFERED_RECORDS {
            self.flush()?;
        }
        Ok(())
    }

    fn collect_dead_segments(&mut self, touched: &[u64]) -> QueueIndexResult<()> {
        for &seg in touched {
            let Some(counts) = self.segments.get(&seg) else {
                continue;
            };
            if counts.published == 0 || counts.acked < counts.published {
                continue;
            }
            let path = self.segment_path(seg);
            if path.exists() {
                fs::remove_file(&path).map_err(|source| QueueIndexError::io(&path, source))?;
            }
            self.segments.remove(&seg);
            self.dirty_segments.remove(&seg);
            trace!(segment = seg, "fully-acked segment removed");
        }
        Ok(())
    }

    fn segment_path(&self, seg: u64) -> PathBuf {
        self.dir.join(format!("{seg}{SEGMENT_SUFFIX}"))
    }
}

pub(super) fn segment_paths(dir: &Path) -> QueueIndexResult<Vec<PathBuf>> {
    let mut segs: Vec<(u64, PathBuf)> = Vec::new();
    let entries = fs::read_dir(dir).map_err(|source| QueueIndexError::io(dir, source))?;
    for entry in entries {
        let entry = entry.map_err(|source| QueueIndexError::io(dir, source))?;
        let name = entry.file_name();
        let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(SEGMENT_SUFFIX)) else {
            continue;
        };
        let Ok(seg) = stem.parse::<u64>() else {
            continue;
        };
        segs.push((seg, entry.path()));
    }
    segs.sort_by_key(|(seg, _)| *seg);
    Ok(segs.into_iter().map(|(_, path)| path).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StoreRef;
    use tempfile::TempDir;

    const SEG: u64 = 8;

    fn name() -> QueueName {
        QueueName::new("orders").unwrap()
    }

    fn fresh(temp: &TempDir) -> QueueIndex {
        let (count, index) =
            QueueIndex::init(temp.path(), &name(), true, |_| true, SEG).expect("init index");
        assert_eq!(count, 0);
        index
    }

    #[test]
    fn publish_read_roundtrip() {
        let temp = TempDir::new().unwrap();
        let mut index = fresh(&temp);
        let guids: Vec<Guid> = (0..3).map(|_| Guid::random()).collect();
        for (i, &guid) in guids.iter().enumerate() {
            index.publish(guid, SeqId::new(i as u64), i % 2 == 0).unwrap();
        }
        index.deliver(&[SeqId::new(1)]).unwrap();

        let entries = index.read(SeqId::new(0), SeqId::new(3)).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].guid, guids[0]);
        assert!(entries[0].is_persistent);
        assert!(!entries[0].is_delivered);
        assert!(entries[1].is_delivered);
    }

    #[test]
    fn acked_entries_disappear_from_reads() {
        let temp = TempDir::new().unwrap();
        let mut index = fresh(&temp);
        for i in 0..4u64 {
            index.publish(Guid::random(), SeqId::new(i), false).unwrap();
        }
        index.ack(&[SeqId::new(1), SeqId::new(2)]).unwrap();
        let entries = index.read(SeqId::new(0), SeqId::new(4)).unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq_id.get()).collect();
        assert_eq!(seqs, vec![0, 3]);
    }

    #[test]
    fn fully_acked_segment_is_deleted() {
        let temp = TempDir::new().unwrap();
        let mut index = fresh(&temp);
        for i in 0..SEG {
            index.publish(Guid::random(), SeqId::new(i), false).unwrap();
        }
        index.flush().unwrap();
        let seg_file = temp.path().join(name().escaped()).join("0.idx");
        assert!(seg_file.exists());

        let seqs: Vec<SeqId> = (0..SEG).map(SeqId::new).collect();
        index.ack(&seqs).unwrap();
        index.flush().unwrap();
        assert!(!seg_file.exists());
    }

    #[test]
    fn bounds_and_count_survive_reinit() {
        let temp = TempDir::new().unwrap();
        {
            let mut index = fresh(&temp);
            for i in 0..10u64 {
                index.publish(Guid::random(), SeqId::new(i), true).unwrap();
            }
            index.ack(&[SeqId::new(0), SeqId::new(1)]).unwrap();
            index.sync(&[]).unwrap();
        }
        let (count, index) =
            QueueIndex::init(temp.path(), &name(), true, |_| true, SEG).unwrap();
        assert_eq!(count, 8);
        assert_eq!(index.bounds(), (SeqId::new(2), SeqId::new(10)));
    }

    #[test]
    fn dirty_init_filters_missing_bodies() {
        let temp = TempDir::new().unwrap();
        let kept = Guid::random();
        {
            let mut index = fresh(&temp);
            index.publish(kept, SeqId::new(0), true).unwrap();
            index.publish(Guid::random(), SeqId::new(1), true).unwrap();
            index.sync(&[]).unwrap();
        }
        let (count, mut index) =
            QueueIndex::init(temp.path(), &name(), false, |g| g == kept, SEG).unwrap();
        assert_eq!(count, 1);
        let entries = index.read(SeqId::new(0), SeqId::new(2)).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].guid, kept);
    }

    #[test]
    fn segment_boundary_math() {
        let temp = TempDir::new().unwrap();
        let index = fresh(&temp);
        assert_eq!(index.next_segment_boundary(SeqId::new(0)), SeqId::new(SEG));
        assert_eq!(
            index.next_segment_boundary(SeqId::new(SEG - 1)),
            SeqId::new(SEG)
        );
        assert_eq!(
            index.next_segment_boundary(SeqId::new(SEG)),
            SeqId::new(2 * SEG)
        );
    }

    #[test]
    fn terminate_then_recover_roundtrips_terms() {
        let temp = TempDir::new().unwrap();
        let terms = RecoveryTerms {
            persistent_ref: StoreRef::fresh(),
            transient_ref: StoreRef::fresh(),
            persistent_count: 5,
        };
        {
            let mut index = fresh(&temp);
            index.publish(Guid::random(), SeqId::new(0), true).unwrap();
            index.terminate(&terms).unwrap();
        }
        let recovered = crate::index::recover(temp.path(), &[name()]).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].1.as_ref(), Some(&terms));

        // Consumed: second recover sees nothing.
        let again = crate::index::recover(temp.path(), &[name()]).unwrap();
        assert_eq!(again[0].1, None);
    }

    #[test]
    fn scan_guid_refs_counts_unacked_persistent() {
        let temp = TempDir::new().unwrap();
        let shared = Guid::random();
        let acked = Guid::random();
        {
            let mut index = fresh(&temp);
            index.publish(shared, SeqId::new(0), true).unwrap();
            index.publish(acked, SeqId::new(1), true).unwrap();
            index.publish(Guid::random(), SeqId::new(2), false).unwrap();
            index.ack(&[SeqId::new(1)]).unwrap();
            index.sync(&[]).unwrap();
        }
        let counts = crate::index::scan_guid_refs(temp.path(), &[name()]).unwrap();
        assert_eq!(counts.get(&shared), Some(&1));
        assert_eq!(counts.get(&acked), None);
        assert_eq!(counts.len(), 1);
    }
}
