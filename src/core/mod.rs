//! Shared primitives: identity atoms and clock injection.

pub mod identity;
pub mod time;

pub use identity::{Guid, IdError, QueueName, SeqId, StoreRef, TxnId};
pub use time::{ClockSource, ManualClock, SystemClock};
