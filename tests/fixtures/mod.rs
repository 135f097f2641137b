//! Shared helpers for the integration suites.

use std::path::Path;
use std::sync::Arc;

use silt::{Config, Message, NodeStores, QueueName, SystemClock, TieredQueue};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

pub struct Node {
    pub temp: TempDir,
    pub config: Config,
}

impl Node {
    pub fn new(segment_entry_count: u64) -> Self {
        // Honour RUST_LOG; only the first init per test binary wins.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        Self {
            temp: TempDir::new().expect("tempdir"),
            config: Config {
                segment_entry_count,
                ..Config::default()
            },
        }
    }

    pub fn base(&self) -> &Path {
        self.temp.path()
    }

    /// Bring the storage tier up (again); call once per simulated boot.
    pub fn start(&self, durable_queues: &[QueueName]) -> NodeStores {
        silt::recovery::start(self.base(), durable_queues, &self.config).expect("start node")
    }

    pub fn open_queue(&self, stores: &mut NodeStores, name: &QueueName, durable: bool) -> TieredQueue {
        stores
            .open_queue(name, durable, &self.config, Arc::new(SystemClock))
            .expect("open queue")
    }

    /// Blob files currently held by the named store directory.
    pub fn blob_count(&self, store_dir: &str) -> usize {
        let dir = self.base().join(store_dir);
        if !dir.exists() {
            return 0;
        }
        std::fs::read_dir(dir)
            .expect("read store dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "blob"))
            .count()
    }
}

pub fn qname(name: &str) -> QueueName {
    QueueName::new(name).expect("queue name")
}

pub fn msg(text: &str, persistent: bool) -> Message {
    Message::new(text.as_bytes().to_vec(), persistent)
}

/// 1 KiB body stamped with `i` so payloads are distinct and comparable.
pub fn kib_body(i: usize) -> Vec<u8> {
    let mut body = vec![0u8; 1024];
    let stamp = format!("msg-{i}");
    body[..stamp.len()].copy_from_slice(stamp.as_bytes());
    body
}
