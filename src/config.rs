//! Tunables (normative defaults).
//!
//! Values are explicit about their units to avoid confusion.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seq ids per queue-index segment file. Segment boundaries also bound
    /// how much a single delta load pulls back into RAM.
    pub segment_entry_count: u64,

    /// Upper bound on a single message body accepted by the stores.
    pub max_msg_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segment_entry_count: 16_384,
            max_msg_bytes: 16 * 1024 * 1024,
        }
    }
}
