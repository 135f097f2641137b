//! Residency records: where a message's body and index entry live.

use bytes::Bytes;

use crate::core::{Guid, SeqId};
use crate::index::IndexEntry;

/// A message as handed to the queue: identity, body, persistence marking.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub guid: Guid,
    pub body: Bytes,
    pub is_persistent: bool,
}

impl Message {
    /// Mint a fresh GUID for a new body.
    pub fn new(body: impl Into<Bytes>, is_persistent: bool) -> Self {
        Self {
            guid: Guid::random(),
            body: body.into(),
            is_persistent,
        }
    }

    pub fn with_guid(guid: Guid, body: impl Into<Bytes>, is_persistent: bool) -> Self {
        Self {
            guid,
            body: body.into(),
            is_persistent,
        }
    }
}

/// Per-message residency status.
///
/// `seq_id`, `guid` and `is_persistent` are fixed at publish;
/// `is_persistent` is true only if the message was marked persistent and
/// the queue is durable. `body` is dropped when the record demotes to β.
/// Invariant: `index_on_disk` implies `msg_on_disk`.
#[derive(Clone, Debug)]
pub struct MsgStatus {
    pub seq_id: SeqId,
    pub guid: Guid,
    pub body: Option<Bytes>,
    pub is_persistent: bool,
    pub is_delivered: bool,
    pub msg_on_disk: bool,
    pub index_on_disk: bool,
}

impl MsgStatus {
    pub fn new(seq_id: SeqId, msg: &Message, is_persistent: bool) -> Self {
        Self {
            seq_id,
            guid: msg.guid,
            body: Some(msg.body.clone()),
            is_persistent,
            is_delivered: false,
            msg_on_disk: false,
            index_on_disk: false,
        }
    }

    /// Rebuild a residency record from an index entry during a δ→β load:
    /// body and position are both on disk, the body stays unread.
    pub fn from_index_entry(entry: &IndexEntry) -> Self {
        Self {
            seq_id: entry.seq_id,
            guid: entry.guid,
            body: None,
            is_persistent: entry.is_persistent,
            is_delivered: entry.is_delivered,
            msg_on_disk: true,
            index_on_disk: true,
        }
    }
}

/// What the pending-ack map retains for a delivered-but-unacked message:
/// the whole record while the body is only in RAM, or just enough to reach
/// the right store once the body is on disk.
#[derive(Clone, Debug)]
pub enum PendingAck {
    InRam(MsgStatus),
    OnDisk { is_persistent: bool, guid: Guid },
}

impl PendingAck {
    pub fn from_status(status: MsgStatus) -> Self {
        if status.msg_on_disk {
            PendingAck::OnDisk {
                is_persistent: status.is_persistent,
                guid: status.guid,
            }
        } else {
            PendingAck::InRam(status)
        }
    }

    pub fn is_persistent(&self) -> bool {
        match self {
            PendingAck::InRam(status) => status.is_persistent,
            PendingAck::OnDisk { is_persistent, .. } => *is_persistent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_ack_keeps_body_only_when_not_on_disk() {
        let msg = Message::new(&b"body"[..], false);
        let mut status = MsgStatus::new(SeqId::new(1), &msg, false);
        match PendingAck::from_status(status.clone()) {
            PendingAck::InRam(kept) => assert_eq!(kept.body, Some(msg.body.clone())),
            PendingAck::OnDisk { .. } => panic!("body is in RAM"),
        }

        status.msg_on_disk = true;
        match PendingAck::from_status(status) {
            PendingAck::OnDisk { guid, .. } => assert_eq!(guid, msg.guid),
            PendingAck::InRam(_) => panic!("body is on disk"),
        }
    }
}
