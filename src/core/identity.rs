//! Identity atoms.
//!
//! Guid: content identifier for message bodies
//! StoreRef: per-client recovery reference into a message store
//! TxnId: caller-supplied transaction identifier
//! SeqId: per-queue publish sequence number
//! QueueName: validated queue name, filesystem-escapable

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IdError {
    #[error("invalid queue name {raw:?}: {reason}")]
    QueueName { raw: String, reason: String },
}

/// Opaque 16-byte content identifier for a message body.
///
/// The message store files bodies under the hex form of this id, so equal
/// GUIDs share one on-disk copy regardless of which queues reference it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Guid(Uuid);

impl Guid {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// 32-char lowercase hex, used as the blob file stem.
    pub fn to_hex(&self) -> String {
        self.0.simple().to_string()
    }

    pub fn parse_hex(s: &str) -> Option<Self> {
        Uuid::try_parse(s).ok().map(Self)
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", self.0.simple())
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Recovery reference a queue registers with a message store client.
///
/// Matching the refs recorded in the store's clean-shutdown marker against
/// the refs presented at startup is how the store decides clean vs. dirty.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreRef(Uuid);

impl StoreRef {
    /// Mint a fresh reference from the thread RNG.
    pub fn fresh() -> Self {
        let mut rng = rand::rng();
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        Self(Uuid::from_bytes(bytes))
    }
}

impl fmt::Debug for StoreRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreRef({})", self.0.simple())
    }
}

impl fmt::Display for StoreRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Caller-supplied transaction identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxnId(Uuid);

impl TxnId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Debug for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxnId({})", self.0.simple())
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Per-queue publish sequence number, assigned at publish and stable for
/// the lifetime of the message. Also serves as the ack tag.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeqId(u64);

impl SeqId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Debug for SeqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeqId({})", self.0)
    }
}

impl fmt::Display for SeqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Queue name - non-empty string.
///
/// The escaped form is stable across restarts; it names the queue's index
/// directory, so two distinct names must never collide after escaping.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueName(String);

impl QueueName {
    pub fn new(s: impl Into<String>) -> Result<Self, IdError> {
        let s = s.into();
        if s.is_empty() {
            return Err(IdError::QueueName {
                raw: s,
                reason: "empty".into(),
            });
        }
        if s.len() > 255 {
            return Err(IdError::QueueName {
                raw: s,
                reason: "longer than 255 bytes".into(),
            });
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe directory name: `[A-Za-z0-9_-]` kept, everything
    /// else percent-escaped byte-wise. Injective, so distinct queue names
    /// map to distinct directories.
    pub fn escaped(&self) -> String {
        let mut out = String::with_capacity(self.0.len());
        for byte in self.0.bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' => {
                    out.push(byte as char);
                }
                other => {
                    out.push('%');
                    out.push_str(&format!("{other:02x}"));
                }
            }
        }
        out
    }
}

impl fmt::Debug for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueueName({:?})", self.0)
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_hex_roundtrip() {
        let guid = Guid::from_bytes([0xab; 16]);
        let hex = guid.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(Guid::parse_hex(&hex), Some(guid));
    }

    #[test]
    fn queue_name_rejects_empty() {
        assert!(QueueName::new("").is_err());
        assert!(QueueName::new("orders").is_ok());
    }

    #[test]
    fn queue_name_escaping_is_injective_on_separators() {
        let a = QueueName::new("a/b").unwrap();
        let b = QueueName::new("a%2fb").unwrap();
        assert_ne!(a.escaped(), b.escaped());
        assert_eq!(a.escaped(), "a%2fb");
    }

    #[test]
    fn seq_id_ordering() {
        let s = SeqId::new(7);
        assert!(s < s.next());
        assert_eq!(s.next().get(), 8);
    }

    #[test]
    fn fresh_store_refs_differ() {
        assert_ne!(StoreRef::fresh(), StoreRef::fresh());
    }
}
