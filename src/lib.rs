#![forbid(unsafe_code)]

//! silt - tiered per-queue backing store for a message broker.
//!
//! Each queue holds its messages across four progressively-colder
//! residency tiers (body and position in RAM; body on disk; body and
//! position on disk; a bare on-disk range) and continuously rebalances
//! them against a caller-supplied target of "seconds of messages in RAM",
//! derived from measured ingress/egress rates. Bodies live in a shared
//! content-addressed message store; positions live in a per-queue
//! segmented index; both cooperate in the crash-recovery protocol.

pub mod config;
pub mod core;
pub mod error;
pub mod index;
pub mod queue;
pub mod recovery;
pub mod store;

pub use config::Config;
pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;

pub use crate::core::{
    ClockSource, Guid, ManualClock, QueueName, SeqId, StoreRef, SystemClock, TxnId,
};
pub use crate::index::RecoveryTerms;
pub use crate::queue::{FetchResult, Message, StageDepths, TieredQueue, IO_BATCH};
pub use crate::recovery::NodeStores;
pub use crate::store::MsgStore;
