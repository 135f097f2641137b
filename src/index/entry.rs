//! Index record framing (magic + length + crc32c).
//!
//! A segment file is a bare sequence of frames; each frame carries one
//! record. A torn trailing frame is repaired by truncation at replay, never
//! surfaced as corruption.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crc32c::crc32c;

use crate::core::{Guid, SeqId};

use super::{QueueIndexError, QueueIndexResult};

const FRAME_MAGIC: u32 = 0x5351_4931; // "SQI1"
const FRAME_HEADER_LEN: usize = 12;

const TAG_PUBLISH: u8 = 1;
const TAG_DELIVER: u8 = 2;
const TAG_ACK: u8 = 3;

const PUBLISH_BODY_LEN: usize = 1 + 8 + 16 + 1;
const SEQ_ONLY_BODY_LEN: usize = 1 + 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexRecord {
    Publish {
        seq_id: SeqId,
        guid: Guid,
        is_persistent: bool,
    },
    Deliver {
        seq_id: SeqId,
    },
    Ack {
        seq_id: SeqId,
    },
}

impl IndexRecord {
    pub fn seq_id(&self) -> SeqId {
        match *self {
            IndexRecord::Publish { seq_id, .. }
            | IndexRecord::Deliver { seq_id }
            | IndexRecord::Ack { seq_id } => seq_id,
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        match *self {
            IndexRecord::Publish {
                seq_id,
                guid,
                is_persistent,
            } => {
                let mut body = Vec::with_capacity(PUBLISH_BODY_LEN);
                body.push(TAG_PUBLISH);
                body.extend_from_slice(&seq_id.get().to_le_bytes());
                body.extend_from_slice(guid.as_bytes());
                body.push(is_persistent as u8);
                body
            }
            IndexRecord::Deliver { seq_id } => seq_only_body(TAG_DELIVER, seq_id),
            IndexRecord::Ack { seq_id } => seq_only_body(TAG_ACK, seq_id),
        }
    }

    fn decode_body(body: &[u8]) -> QueueIndexResult<Self> {
        let (&tag, rest) = body.split_first().ok_or_else(|| QueueIndexError::Frame {
            reason: "empty record body".to_string(),
        })?;
        match tag {
            TAG_PUBLISH => {
                if rest.len() != PUBLISH_BODY_LEN - 1 {
                    return Err(QueueIndexError::Frame {
                        reason: "publish record length mismatch".to_string(),
                    });
                }
                let seq_id = SeqId::new(u64::from_le_bytes(
                    rest[..8].try_into().expect("8-byte slice"),
                ));
                let mut guid_bytes = [0u8; 16];
                guid_bytes.copy_from_slice(&rest[8..24]);
                Ok(IndexRecord::Publish {
                    seq_id,
                    guid: Guid::from_bytes(guid_bytes),
                    is_persistent: rest[24] != 0,
                })
            }
            TAG_DELIVER | TAG_ACK => {
                if rest.len() != SEQ_ONLY_BODY_LEN - 1 {
                    return Err(QueueIndexError::Frame {
                        reason: "record length mismatch".to_string(),
                    });
                }
                let seq_id = SeqId::new(u64::from_le_bytes(
                    rest[..8].try_into().expect("8-byte slice"),
                ));
                Ok(match tag {
                    TAG_DELIVER => IndexRecord::Deliver { seq_id },
                    _ => IndexRecord::Ack { seq_id },
                })
            }
            other => Err(QueueIndexError::Frame {
                reason: format!("unknown record tag {other}"),
            }),
        }
    }
}

fn seq_only_body(tag: u8, seq_id: SeqId) -> Vec<u8> {
    let mut body = Vec::with_capacity(SEQ_ONLY_BODY_LEN);
    body.push(tag);
    body.extend_from_slice(&seq_id.get().to_le_bytes());
    body
}

pub fn encode_frame(record: &IndexRecord) -> Vec<u8> {
    let body = record.encode_body();
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32c(&body).to_le_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Replay outcome for one segment file.
pub struct SegmentReplay {
    pub records: Vec<IndexRecord>,
    /// Byte offset of the first torn frame, if the file ends mid-frame.
    pub torn_at: Option<u64>,
}

/// Read every intact frame in a segment. A frame cut short by a crash
/// stops the replay at its start; a bad magic or crc inside the intact
/// prefix is real corruption and fails.
pub fn replay_segment(path: &Path) -> QueueIndexResult<SegmentReplay> {
    let mut file = File::open(path).map_err(|source| QueueIndexError::io(path, source))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .map_err(|source| QueueIndexError::io(path, source))?;

    let mut records = Vec::new();
    let mut offset = 0usize;
    loop {
        if offset == bytes.len() {
            return Ok(SegmentReplay {
                records,
                torn_at: None,
            });
        }
        if bytes.len() - offset < FRAME_HEADER_LEN {
            return Ok(SegmentReplay {
                records,
                torn_at: Some(offset as u64),
            });
        }
        let header = &bytes[offset..offset + FRAME_HEADER_LEN];
        let magic = u32::from_le_bytes(header[..4].try_into().expect("4-byte slice"));
        if magic != FRAME_MAGIC {
            return Err(QueueIndexError::Frame {
                reason: format!("frame magic mismatch at offset {offset}: {magic:#x}"),
            });
        }
        let length = u32::from_le_bytes(header[4..8].try_into().expect("4-byte slice")) as usize;
        let expected_crc = u32::from_le_bytes(header[8..12].try_into().expect("4-byte slice"));
        let body_start = offset + FRAME_HEADER_LEN;
        if bytes.len() - body_start < length {
            return Ok(SegmentReplay {
                records,
                torn_at: Some(offset as u64),
            });
        }
        let body = &bytes[body_start..body_start + length];
        let actual_crc = crc32c(body);
        if actual_crc != expected_crc {
            // A crc mismatch on the final frame is a torn write; anywhere
            // else it is corruption.
            if body_start + length == bytes.len() {
                return Ok(SegmentReplay {
                    records,
                    torn_at: Some(offset as u64),
                });
            }
            return Err(QueueIndexError::Frame {
                reason: format!(
                    "frame crc mismatch at offset {offset}: expected {expected_crc:#x}, got {actual_crc:#x}"
                ),
            });
        }
        records.push(IndexRecord::decode_body(body)?);
        offset = body_start + length;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn sample_records() -> Vec<IndexRecord> {
        let guid = Guid::from_bytes([3u8; 16]);
        vec![
            IndexRecord::Publish {
                seq_id: SeqId::new(0),
                guid,
                is_persistent: true,
            },
            IndexRecord::Deliver {
                seq_id: SeqId::new(0),
            },
            IndexRecord::Ack {
                seq_id: SeqId::new(0),
            },
        ]
    }

    #[test]
    fn frame_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("0.idx");
        let mut file = File::create(&path).unwrap();
        for record in sample_records() {
            file.write_all(&encode_frame(&record)).unwrap();
        }
        drop(file);

        let replay = replay_segment(&path).unwrap();
        assert_eq!(replay.records, sample_records());
        assert_eq!(replay.torn_at, None);
    }

    #[test]
    fn torn_tail_stops_replay() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("0.idx");
        let mut encoded = Vec::new();
        for record in sample_records() {
            encoded.extend_from_slice(&encode_frame(&record));
        }
        let first_len = encode_frame(&sample_records()[0]).len();
        let cut = first_len + 5;
        let mut file = File::create(&path).unwrap();
        file.write_all(&encoded[..cut]).unwrap();
        drop(file);

        let replay = replay_segment(&path).unwrap();
        assert_eq!(replay.records.len(), 1);
        assert_eq!(replay.torn_at, Some(first_len as u64));
    }

    #[test]
    fn corrupt_interior_frame_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("0.idx");
        let mut encoded = Vec::new();
        for record in sample_records() {
            encoded.extend_from_slice(&encode_frame(&record));
        }
        // Flip a byte inside the first frame's body.
        encoded[FRAME_HEADER_LEN + 2] ^= 0xff;
        let mut file = File::create(&path).unwrap();
        file.write_all(&encoded).unwrap();
        drop(file);

        assert!(matches!(
            replay_segment(&path),
            Err(QueueIndexError::Frame { .. })
        ));
    }
}
