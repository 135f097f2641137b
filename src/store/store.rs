//! Store state, recovery marker, and blob file management.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::{Guid, StoreRef};

use super::{MsgStoreError, MsgStoreResult, StoreClient};

pub const CLEAN_MARKER_FILE: &str = "clean.json";
const BLOB_SUFFIX: &str = ".blob";

/// Clean-shutdown marker: which clients were registered and how many
/// references each body held when the store last shut down in order.
#[derive(Debug, Serialize, Deserialize)]
struct CleanMarker {
    refs: Vec<StoreRef>,
    refcounts: HashMap<Guid, u64>,
}

struct StoreState {
    dir: PathBuf,
    max_msg_bytes: usize,
    refcounts: HashMap<Guid, u64>,
    clients: HashSet<StoreRef>,
    recovered_cleanly: bool,
}

/// Shared handle to one message store. Clones are cheap; the store does its
/// own locking so queue engines stay single-threaded actors.
#[derive(Clone)]
pub struct MsgStore {
    state: Arc<Mutex<StoreState>>,
}

impl MsgStore {
    /// Open a store directory, negotiating clean vs. dirty recovery.
    ///
    /// Clean means the marker file is present and covers every ref in
    /// `expected_refs`; the refcount table is restored from it. Otherwise
    /// the store reports a dirty start and expects `seed_refcounts` before
    /// queues begin reading. The marker is consumed either way, so a crash
    /// before the next terminate is dirty by construction.
    pub fn open(
        dir: impl Into<PathBuf>,
        expected_refs: &[StoreRef],
        max_msg_bytes: usize,
    ) -> MsgStoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| MsgStoreError::io(&dir, source))?;

        let marker_path = dir.join(CLEAN_MARKER_FILE);
        let marker = read_marker(&marker_path)?;
        if marker.is_some() {
            fs::remove_file(&marker_path).map_err(|source| MsgStoreError::io(&marker_path, source))?;
        }

        let (refcounts, recovered_cleanly) = match marker {
            Some(marker) if expected_refs.iter().all(|r| marker.refs.contains(r)) => {
                (marker.refcounts, true)
            }
            Some(_) => {
                warn!(dir = %dir.display(), "store marker does not cover presented refs; dirty start");
                (HashMap::new(), false)
            }
            None => {
                debug!(dir = %dir.display(), "no store marker; dirty start");
                (HashMap::new(), false)
            }
        };

        debug!(
            dir = %dir.display(),
            clean = recovered_cleanly,
            bodies = refcounts.len(),
            "message store opened"
        );

        Ok(Self {
            state: Arc::new(Mutex::new(StoreState {
                dir,
                max_msg_bytes,
                refcounts,
                clients: HashSet::new(),
                recovered_cleanly,
            })),
        })
    }

    /// Open an empty store with no recovery expectations (the transient
    /// store after its directory has been cleaned).
    pub fn fresh(dir: impl Into<PathBuf>, max_msg_bytes: usize) -> MsgStoreResult<Self> {
        Self::open(dir, &[], max_msg_bytes).map(|store| {
            store.with_state(|state| state.recovered_cleanly = false);
            store
        })
    }

    /// Wipe a store directory. Run unconditionally on the transient store
    /// at broker startup: transient bodies never survive a restart.
    pub fn clean_dir(dir: &Path) -> MsgStoreResult<()> {
        if dir.exists() {
            fs::remove_dir_all(dir).map_err(|source| MsgStoreError::io(dir, source))?;
        }
        fs::create_dir_all(dir).map_err(|source| MsgStoreError::io(dir, source))?;
        Ok(())
    }

    /// After a dirty start: install refcounts rebuilt from the queue
    /// indexes. Entries whose blob file is gone are dropped (their index
    /// entries will be filtered through `contains`), and blob files nothing
    /// references are unlinked.
    pub fn seed_refcounts(&self, counts: HashMap<Guid, u64>) -> MsgStoreResult<()> {
        let mut state = self.lock();
        let mut seeded = HashMap::new();
        for (guid, count) in counts {
            if state.blob_path(&guid).exists() {
                seeded.insert(guid, count);
            }
        }

        let entries = fs::read_dir(&state.dir)
            .map_err(|source| MsgStoreError::io(&state.dir, source))?;
        let mut dropped = 0usize;
        for entry in entries {
            let entry = entry.map_err(|source| MsgStoreError::io(&state.dir, source))?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(BLOB_SUFFIX)) else {
                continue;
            };
            let Some(guid) = Guid::parse_hex(stem) else {
                continue;
            };
            if !seeded.contains_key(&guid) {
                fs::remove_file(entry.path())
                    .map_err(|source| MsgStoreError::io(entry.path(), source))?;
                dropped += 1;
            }
        }

        debug!(bodies = seeded.len(), dropped, "store refcounts rebuilt from index scan");
        state.refcounts = seeded;
        Ok(())
    }

    pub fn successfully_recovered_state(&self) -> bool {
        self.lock().recovered_cleanly
    }

    /// Register a client ref and hand back a client handle.
    pub fn client_init(&self, store_ref: StoreRef) -> StoreClient {
        self.lock().clients.insert(store_ref);
        StoreClient::new(self.clone(), store_ref)
    }

    /// Forget a client ref entirely (queue deletion). A terminated-but-kept
    /// ref stays registered so the next marker covers it.
    pub fn delete_client(&self, store_ref: StoreRef) {
        self.lock().clients.remove(&store_ref);
    }

    /// Add one reference to `guid`, writing the body out if this is the
    /// first. Content-addressed: re-writing a known GUID only bumps the
    /// count.
    pub fn write(&self, guid: Guid, body: &Bytes) -> MsgStoreResult<()> {
        let mut state = self.lock();
        if body.len() > state.max_msg_bytes {
            return Err(MsgStoreError::MsgTooLarge {
                max_bytes: state.max_msg_bytes,
                got_bytes: body.len(),
            });
        }
        if let Some(count) = state.refcounts.get_mut(&guid) {
            *count += 1;
            return Ok(());
        }
        let path = state.blob_path(&guid);
        let mut file = File::create(&path).map_err(|source| MsgStoreError::io(&path, source))?;
        file.write_all(body)
            .map_err(|source| MsgStoreError::io(&path, source))?;
        state.refcounts.insert(guid, 1);
        Ok(())
    }

    pub fn read(&self, guid: Guid) -> MsgStoreResult<Bytes> {
        let state = self.lock();
        if !state.refcounts.contains_key(&guid) {
            return Err(MsgStoreError::NotFound { guid });
        }
        let path = state.blob_path(&guid);
        let mut file = File::open(&path).map_err(|source| MsgStoreError::io(&path, source))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|source| MsgStoreError::io(&path, source))?;
        Ok(Bytes::from(buf))
    }

    pub fn contains(&self, guid: Guid) -> bool {
        self.lock().refcounts.contains_key(&guid)
    }

    /// Drop one reference per GUID, unlinking bodies that reach zero.
    pub fn remove(&self, guids: &[Guid]) -> MsgStoreResult<()> {
        let mut state = self.lock();
        for &guid in guids {
            match state.refcounts.get_mut(&guid) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    state.refcounts.remove(&guid);
                    let path = state.blob_path(&guid);
                    fs::remove_file(&path).map_err(|source| MsgStoreError::io(&path, source))?;
                }
                None => return Err(MsgStoreError::NotFound { guid }),
            }
        }
        Ok(())
    }

    /// Drop one reference per GUID without unlinking. The requeue path
    /// republishes through `write` and then releases its old reference.
    pub fn release(&self, guids: &[Guid]) -> MsgStoreResult<()> {
        let mut state = self.lock();
        for &guid in guids {
            match state.refcounts.get_mut(&guid) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    state.refcounts.remove(&guid);
                }
                None => return Err(MsgStoreError::NotFound { guid }),
            }
        }
        Ok(())
    }

    /// Make the named bodies durable, then invoke the callback. This is the
    /// commit gate: the callback must not run before every listed body has
    /// reached disk.
    pub fn sync(
        &self,
        guids: &[Guid],
        callback: Box<dyn FnOnce() + Send>,
    ) -> MsgStoreResult<()> {
        {
            let state = self.lock();
            for &guid in guids {
                if !state.refcounts.contains_key(&guid) {
                    return Err(MsgStoreError::NotFound { guid });
                }
                let path = state.blob_path(&guid);
                let file = File::open(&path).map_err(|source| MsgStoreError::io(&path, source))?;
                file.sync_all()
                    .map_err(|source| MsgStoreError::io(&path, source))?;
            }
        }
        callback();
        Ok(())
    }

    /// Clean shutdown: persist the refcount table and the registered refs.
    pub fn terminate(&self) -> MsgStoreResult<()> {
        let state = self.lock();
        let marker = CleanMarker {
            refs: state.clients.iter().copied().collect(),
            refcounts: state.refcounts.clone(),
        };
        let path = state.dir.join(CLEAN_MARKER_FILE);
        write_marker(&state.dir, &path, &marker)?;
        debug!(dir = %state.dir.display(), bodies = marker.refcounts.len(), "message store terminated clean");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().expect("msg store lock poisoned")
    }

    fn with_state(&self, f: impl FnOnce(&mut StoreState)) {
        f(&mut self.lock());
    }
}

impl StoreState {
    fn blob_path(&self, guid: &Guid) -> PathBuf {
        self.dir.join(format!("{}{BLOB_SUFFIX}", guid.to_hex()))
    }
}

fn read_marker(path: &Path) -> MsgStoreResult<Option<CleanMarker>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(MsgStoreError::io(path, source)),
    };
    let marker = serde_json::from_slice(&bytes).map_err(|err| MsgStoreError::MarkerInvalid {
        reason: err.to_string(),
    })?;
    Ok(Some(marker))
}

fn write_marker(dir: &Path, path: &Path, marker: &CleanMarker) -> MsgStoreResult<()> {
    let bytes = serde_json::to_vec_pretty(marker).map_err(|err| MsgStoreError::MarkerInvalid {
        reason: err.to_string(),
    })?;
    let tmp_path = path.with_extension("json.tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|source| MsgStoreError::io(&tmp_path, source))?;
    file.write_all(&bytes)
        .map_err(|source| MsgStoreError::io(&tmp_path, source))?;
    file.sync_all()
        .map_err(|source| MsgStoreError::io(&tmp_path, source))?;
    fs::rename(&tmp_path, path).map_err(|source| MsgStoreError::io(path, source))?;
    let dir_file = File::open(dir).map_err(|source| MsgStoreError::io(dir, source))?;
    dir_file
        .sync_all()
        .map_err(|source| MsgStoreError::io(dir, source))?;
    Ok(())
}
