//! Translog generation file format
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ Header (16 bytes)                │
//! │ - magic: "STLG" (4 bytes)        │
//! │ - version: u8                    │
//! │ - reserved: 3 bytes              │
//! │ - generation: u64 LE             │
//! ├──────────────────────────────────┤
//! │ Entry 0                          │
//! │ - data_length: u32 LE            │
//! │ - seq_no: i64 LE                 │
//! │ - checksum: u32 LE (CRC32)       │
//! │ - data: bincode(Operation)       │
//! ├──────────────────────────────────┤
//! │ Entry 1 ...                      │
//! └──────────────────────────────────┘
//! ```
//!
//! Each entry is checksummed on its own. Readers stop at the first corrupt
//! or truncated entry and keep everything before it.

use super::TranslogError;
use crate::seqno::SeqNo;
use crate::shard::Operation;

pub const TRANSLOG_MAGIC: [u8; 4] = *b"STLG";
pub const TRANSLOG_VERSION: u8 = 1;
pub const TRANSLOG_HEADER_SIZE: usize = 16;
/// data_length(4) + seq_no(8) + checksum(4)
pub const TRANSLOG_ENTRY_OVERHEAD: usize = 16;

pub fn encode_header(generation: u64) -> [u8; TRANSLOG_HEADER_SIZE] {
    let mut header = [0u8; TRANSLOG_HEADER_SIZE];
    header[0..4].copy_from_slice(&TRANSLOG_MAGIC);
    header[4] = TRANSLOG_VERSION;
    header[8..16].copy_from_slice(&generation.to_le_bytes());
    header
}

/// Validate the header and return the generation it names
pub fn decode_header(data: &[u8]) -> Result<u64, TranslogError> {
    if data.len() < TRANSLOG_HEADER_SIZE {
        return Err(TranslogError::Corruption(
            "translog file too short for header".to_string(),
        ));
    }
    if data[0..4] != TRANSLOG_MAGIC {
        return Err(TranslogError::Corruption(format!(
            "invalid translog magic: {:?}",
            &data[0..4]
        )));
    }
    if data[4] != TRANSLOG_VERSION {
        return Err(TranslogError::Corruption(format!(
            "unsupported translog version: {}",
            data[4]
        )));
    }
    let mut generation = [0u8; 8];
    generation.copy_from_slice(&data[8..16]);
    Ok(u64::from_le_bytes(generation))
}

/// One framed operation
#[derive(Debug, Clone)]
pub struct TranslogEntry {
    pub seq_no: SeqNo,
    pub data: Vec<u8>,
    pub checksum: u32,
}

impl TranslogEntry {
    pub fn from_operation(op: &Operation) -> Result<Self, TranslogError> {
        debug_assert!(op.seq_no >= 0, "Precondition: only stamped operations are logged");
        let data = bincode::serialize(op)
            .map_err(|e| TranslogError::Corruption(format!("serialize: {}", e)))?;
        let checksum = crc32fast::hash(&data);
        Ok(TranslogEntry {
            seq_no: op.seq_no,
            data,
            checksum,
        })
    }

    pub fn to_operation(&self) -> Result<Operation, TranslogError> {
        bincode::deserialize(&self.data)
            .map_err(|e| TranslogError::Corruption(format!("deserialize: {}", e)))
    }

    pub fn encode(&self) -> Vec<u8> {
        let total_size = TRANSLOG_ENTRY_OVERHEAD + self.data.len();
        let mut buf = Vec::with_capacity(total_size);
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.seq_no.to_le_bytes());
        buf.extend_from_slice(&self.checksum.to_le_bytes());
        buf.extend_from_slice(&self.data);

        debug_assert_eq!(
            buf.len(),
            total_size,
            "Postcondition: encoded size must match expected"
        );
        buf
    }

    /// Decode one entry. Returns None if the bytes are truncated or corrupt.
    pub fn decode(data: &[u8]) -> Option<(Self, usize)> {
        if data.len() < TRANSLOG_ENTRY_OVERHEAD {
            return None;
        }
        let data_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let mut seq_no = [0u8; 8];
        seq_no.copy_from_slice(&data[4..12]);
        let checksum = u32::from_le_bytes([data[12], data[13], data[14], data[15]]);

        let total_size = TRANSLOG_ENTRY_OVERHEAD.checked_add(data_len)?;
        if data.len() < total_size {
            return None;
        }
        let payload = data[TRANSLOG_ENTRY_OVERHEAD..total_size].to_vec();
        if crc32fast::hash(&payload) != checksum {
            return None;
        }
        Some((
            TranslogEntry {
                seq_no: i64::from_le_bytes(seq_no),
                data: payload,
                checksum,
            },
            total_size,
        ))
    }
}

/// Decode every intact entry after the header
pub fn decode_entries(data: &[u8]) -> Vec<TranslogEntry> {
    let mut entries = Vec::new();
    let mut offset = TRANSLOG_HEADER_SIZE;
    while offset < data.len() {
        match TranslogEntry::decode(&data[offset..]) {
            Some((entry, consumed)) => {
                entries.push(entry);
                offset += consumed;
            }
            None => break,
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_encode_decode() {
        let op = Operation::index("a", &b"{\"n\":1}"[..]).stamped(5, 1);
        let entry = TranslogEntry::from_operation(&op).unwrap();
        let encoded = entry.encode();
        let (decoded, consumed) = TranslogEntry::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.seq_no, 5);
        assert_eq!(decoded.to_operation().unwrap(), op);
    }

    #[test]
    fn test_truncated_and_corrupt_entries_rejected() {
        let op = Operation::delete("a").stamped(1, 1);
        let mut encoded = TranslogEntry::from_operation(&op).unwrap().encode();
        assert!(TranslogEntry::decode(&encoded[..encoded.len() - 1]).is_none());
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        assert!(TranslogEntry::decode(&encoded).is_none());
    }

    #[test]
    fn test_reader_stops_at_torn_tail() {
        let mut file = encode_header(3).to_vec();
        for seq in 0..3 {
            let op = Operation::delete(format!("d{}", seq)).stamped(seq, 1);
            file.extend(TranslogEntry::from_operation(&op).unwrap().encode());
        }
        let torn = TranslogEntry::from_operation(&Operation::delete("x").stamped(3, 1))
            .unwrap()
            .encode();
        file.extend_from_slice(&torn[..torn.len() / 2]);

        assert_eq!(decode_header(&file).unwrap(), 3);
        let entries = decode_entries(&file);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].seq_no, 2);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut header = encode_header(1);
        header[0] = b'X';
        assert!(decode_header(&header).is_err());
    }
}
