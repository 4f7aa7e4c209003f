//! Binary envelope of every entry written to a topic ledger
//!
//! ```text
//! +---------+------+-------+--------------------------+---------+
//! | version | kind | flags | txn id (16 bytes, opt.)  | payload |
//! +---------+------+-------+--------------------------+---------+
//! ```
//!
//! `flags` bit 0 marks the presence of the transaction id.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, StreamlineError};
use crate::transaction::TxnId;

const ENVELOPE_VERSION: u8 = 1;
const FLAG_HAS_TXN: u8 = 0x01;
const HEADER_SIZE: usize = 3;
const TXN_ID_SIZE: usize = 16;

/// What a topic ledger entry carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    /// Message payload
    Data = 1,
    /// Transaction committed; its data entries become visible
    CommitMarker = 2,
    /// Transaction aborted; its data entries are never visible
    AbortMarker = 3,
}

impl TryFrom<u8> for EntryKind {
    type Error = StreamlineError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(EntryKind::Data),
            2 => Ok(EntryKind::CommitMarker),
            3 => Ok(EntryKind::AbortMarker),
            _ => Err(StreamlineError::CorruptedData(format!(
                "Invalid entry kind: {}",
                value
            ))),
        }
    }
}

/// Decoded topic ledger entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub kind: EntryKind,
    pub txn_id: Option<TxnId>,
    pub payload: Bytes,
}

impl MessageEnvelope {
    /// Ordinary message outside any transaction
    pub fn data(payload: Bytes) -> Self {
        Self {
            kind: EntryKind::Data,
            txn_id: None,
            payload,
        }
    }

    /// Message published inside `txn_id`
    pub fn txn_data(txn_id: TxnId, payload: Bytes) -> Self {
        Self {
            kind: EntryKind::Data,
            txn_id: Some(txn_id),
            payload,
        }
    }

    pub fn commit_marker(txn_id: TxnId) -> Self {
        Self {
            kind: EntryKind::CommitMarker,
            txn_id: Some(txn_id),
            payload: Bytes::new(),
        }
    }

    pub fn abort_marker(txn_id: TxnId) -> Self {
        Self {
            kind: EntryKind::AbortMarker,
            txn_id: Some(txn_id),
            payload: Bytes::new(),
        }
    }

    pub fn is_marker(&self) -> bool {
        self.kind != EntryKind::Data
    }

    pub fn encode(&self) -> Bytes {
        let txn_len = if self.txn_id.is_some() { TXN_ID_SIZE } else { 0 };
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + txn_len + self.payload.len());
        buf.put_u8(ENVELOPE_VERSION);
        buf.put_u8(self.kind as u8);
        match self.txn_id {
            Some(txn_id) => {
                buf.put_u8(FLAG_HAS_TXN);
                buf.put_u64(txn_id.most_sig_bits);
                buf.put_u64(txn_id.least_sig_bits);
            }
            None => buf.put_u8(0),
        }
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(StreamlineError::corrupted(
                "envelope",
                format!("{} bytes is shorter than the header", data.len()),
            ));
        }
        let version = data.get_u8();
        if version != ENVELOPE_VERSION {
            return Err(StreamlineError::corrupted(
                "envelope",
                format!("unsupported version {}", version),
            ));
        }
        let kind = EntryKind::try_from(data.get_u8())?;
        let flags = data.get_u8();
        let txn_id = if flags & FLAG_HAS_TXN != 0 {
            if data.remaining() < TXN_ID_SIZE {
                return Err(StreamlineError::corrupted("envelope", "truncated txn id"));
            }
            Some(TxnId::new(data.get_u64(), data.get_u64()))
        } else {
            None
        };
        if kind != EntryKind::Data && txn_id.is_none() {
            return Err(StreamlineError::corrupted(
                "envelope",
                "transaction marker without txn id",
            ));
        }
        Ok(Self {
            kind,
            txn_id,
            payload: data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txn_data_layout() {
        let env = MessageEnvelope::txn_data(TxnId::new(1, 2), Bytes::from_static(b"hi"));
        let bytes = env.encode();
        assert_eq!(bytes.len(), HEADER_SIZE + TXN_ID_SIZE + 2);
        assert_eq!(bytes[1], EntryKind::Data as u8);
        assert_eq!(MessageEnvelope::decode(bytes).unwrap(), env);
    }

    #[test]
    fn test_markers() {
        let commit = MessageEnvelope::decode(MessageEnvelope::commit_marker(TxnId::new(0, 1)).encode())
            .unwrap();
        assert!(commit.is_marker());
        assert_eq!(commit.kind, EntryKind::CommitMarker);
        assert!(!MessageEnvelope::data(Bytes::new()).is_marker());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(MessageEnvelope::decode(Bytes::from_static(b"\x01")).is_err());
        assert!(MessageEnvelope::decode(Bytes::from_static(b"\x09\x01\x00")).is_err());
        assert!(MessageEnvelope::decode(Bytes::from_static(b"\x01\x07\x00")).is_err());
        assert!(MessageEnvelope::decode(Bytes::from_static(b"\x01\x02\x00")).is_err());
        assert!(MessageEnvelope::decode(Bytes::from_static(b"\x01\x01\x01\x00")).is_err());
    }
}
