//! Fixed-slot, open-addressing hash file format (spec §4.1 / §6).
//!
//! On disk: a 2-word little-endian header `(n_elements, n_deleted)`
//! followed by `size` fixed-width slots, each beginning with a `u32
//! slot_status ∈ {EMPTY=0, DELETED=1, VALID=2}`. Lookup probes linearly
//! from a domain-specific hash of the key, matching the open-addressing
//! scheme prescribed by spec §4.1. This generalises
//! `src/parser/parser_struct.rs`'s hash-file header parsing (there used
//! only for framing RPC messages) into a full on-disk associative table.

use std::io::{self, Read, Seek, SeekFrom, Write};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::error::{ReconcileError, Result};

#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum SlotStatus {
    Empty = 0,
    Deleted = 1,
    Valid = 2,
}

impl SlotStatus {
    fn from_u32(v: u32) -> Result<Self> {
        FromPrimitive::from_u32(v).ok_or(ReconcileError::MetadataError)
    }
}

/// A fixed-width record that can live in a slot of a [`HashFile`].
pub trait Record: Clone {
    /// Serialized slot payload size, excluding the 4-byte status marker.
    const PAYLOAD_LEN: usize;
    fn encode(&self) -> Vec<u8>;
    fn decode(buf: &[u8]) -> Result<Self>;
    /// Domain-specific hash of this record's key fields.
    fn hash(&self) -> u64;
    fn matches_key(&self, other: &Self) -> bool;
}

/// An in-memory, file-backed open-addressing hash table.
///
/// Mirrors the on-disk layout exactly: callers that want crash-consistent
/// persistence call [`HashFile::flush`] after mutation, matching the
/// teacher's "open lazily, write through" idiom used for its RPC framing.
pub struct HashFile<R: Record> {
    slots: Vec<Option<(SlotStatus, R)>>,
    n_elements: u32,
    n_deleted: u32,
}

const HEADER_LEN: usize = 8;
const STATUS_LEN: usize = 4;

impl<R: Record> HashFile<R> {
    /// Create a fresh, empty table with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        HashFile { slots: vec![None; capacity], n_elements: 0, n_deleted: 0 }
    }

    fn slot_len() -> usize {
        STATUS_LEN + R::PAYLOAD_LEN
    }

    /// Load a table from an already-open file.
    pub fn load<F: Read + Seek>(file: &mut F) -> Result<Self> {
        file.seek(SeekFrom::Start(0)).map_err(ReconcileError::from)?;
        let mut header = [0u8; HEADER_LEN];
        file.read_exact(&mut header).map_err(ReconcileError::from)?;
        let n_elements = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let n_deleted = u32::from_le_bytes(header[4..8].try_into().unwrap());

        let mut rest = Vec::new();
        file.read_to_end(&mut rest).map_err(ReconcileError::from)?;
        let slot_len = Self::slot_len();
        if !rest.is_empty() && rest.len() % slot_len != 0 {
            return Err(ReconcileError::MetadataError);
        }
        let mut slots = Vec::with_capacity(rest.len() / slot_len.max(1));
        for chunk in rest.chunks(slot_len) {
            let status = SlotStatus::from_u32(u32::from_le_bytes(chunk[0..4].try_into().unwrap()))?;
            match status {
                SlotStatus::Valid => {
                    let record = R::decode(&chunk[STATUS_LEN..])?;
                    slots.push(Some((status, record)));
                }
                SlotStatus::Deleted => slots.push(Some((SlotStatus::Deleted, R::decode(&chunk[STATUS_LEN..])?))),
                SlotStatus::Empty => slots.push(None),
            }
        }
        Ok(HashFile { slots, n_elements, n_deleted })
    }

    /// Persist the table to an already-open, truncatable file.
    pub fn flush<F: Write + Seek>(&self, file: &mut F) -> Result<()> {
        file.seek(SeekFrom::Start(0)).map_err(ReconcileError::from)?;
        file.write_all(&self.n_elements.to_le_bytes()).map_err(ReconcileError::from)?;
        file.write_all(&self.n_deleted.to_le_bytes()).map_err(ReconcileError::from)?;
        for slot in &self.slots {
            match slot {
                Some((status, record)) => {
                    file.write_all(&(*status as u32).to_le_bytes()).map_err(ReconcileError::from)?;
                    let mut payload = record.encode();
                    payload.resize(R::PAYLOAD_LEN, 0);
                    file.write_all(&payload).map_err(ReconcileError::from)?;
                }
                None => {
                    file.write_all(&[0u8; STATUS_LEN]).map_err(ReconcileError::from)?;
                    file.write_all(&vec![0u8; R::PAYLOAD_LEN]).map_err(ReconcileError::from)?;
                }
            }
        }
        Ok(())
    }

    fn probe_start(&self, key_hash: u64) -> usize {
        if self.slots.is_empty() {
            0
        } else {
            (key_hash as usize) % self.slots.len()
        }
    }

    fn grow_if_needed(&mut self) {
        let used = self.n_elements + self.n_deleted;
        if self.slots.is_empty() || used as usize * 2 >= self.slots.len() {
            let new_len = (self.slots.len().max(8)) * 2;
            let old = std::mem::replace(&mut self.slots, vec![None; new_len]);
            self.n_elements = 0;
            self.n_deleted = 0;
            for slot in old.into_iter().flatten() {
                if slot.0 == SlotStatus::Valid {
                    self.insert_no_grow(slot.1);
                }
            }
        }
    }

    fn insert_no_grow(&mut self, record: R) {
        let start = self.probe_start(record.hash());
        let len = self.slots.len();
        for i in 0..len {
            let idx = (start + i) % len;
            match &self.slots[idx] {
                None => {
                    self.slots[idx] = Some((SlotStatus::Valid, record));
                    self.n_elements += 1;
                    return;
                }
                Some((SlotStatus::Deleted, _)) => {
                    self.slots[idx] = Some((SlotStatus::Valid, record));
                    self.n_elements += 1;
                    self.n_deleted -= 1;
                    return;
                }
                Some((SlotStatus::Valid, existing)) if existing.matches_key(&record) => {
                    self.slots[idx] = Some((SlotStatus::Valid, record));
                    return;
                }
                Some(_) => continue,
            }
        }
    }

    /// Insert or overwrite a record (write-through, matching §4.3 `flush`).
    pub fn insert(&mut self, record: R) {
        self.grow_if_needed();
        self.insert_no_grow(record);
    }

    /// Find a record matching `key`'s key fields.
    pub fn lookup(&self, key: &R) -> Option<&R> {
        if self.slots.is_empty() {
            return None;
        }
        let start = self.probe_start(key.hash());
        let len = self.slots.len();
        for i in 0..len {
            let idx = (start + i) % len;
            match &self.slots[idx] {
                None => return None,
                Some((SlotStatus::Valid, existing)) if existing.matches_key(key) => {
                    return Some(existing);
                }
                _ => continue,
            }
        }
        None
    }

    /// Remove a record matching `key`'s key fields.
    pub fn delete(&mut self, key: &R) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        let start = self.probe_start(key.hash());
        let len = self.slots.len();
        for i in 0..len {
            let idx = (start + i) % len;
            match &self.slots[idx] {
                None => return false,
                Some((SlotStatus::Valid, existing)) if existing.matches_key(key) => {
                    let (_, record) = self.slots[idx].take().unwrap();
                    self.slots[idx] = Some((SlotStatus::Deleted, record));
                    self.n_elements -= 1;
                    self.n_deleted += 1;
                    return true;
                }
                _ => continue,
            }
        }
        false
    }

    pub fn len(&self) -> u32 {
        self.n_elements
    }

    pub fn is_empty(&self) -> bool {
        self.n_elements == 0
    }

    /// Every live record, in slot order — used to rebuild an in-memory
    /// index (e.g. [`crate::metadata::MetadataStore`]) from a freshly
    /// loaded table.
    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.slots.iter().filter_map(|slot| match slot {
            Some((SlotStatus::Valid, record)) => Some(record),
            _ => None,
        })
    }
}

/// Ad hoc open error kind shared by hash-file and sidecar openers.
pub fn map_open_error(err: io::Error) -> ReconcileError {
    ReconcileError::from(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Rec {
        key: u32,
        value: u64,
    }

    impl Record for Rec {
        const PAYLOAD_LEN: usize = 12;

        fn encode(&self) -> Vec<u8> {
            let mut out = self.key.to_le_bytes().to_vec();
            out.extend_from_slice(&self.value.to_le_bytes());
            out
        }

        fn decode(buf: &[u8]) -> Result<Self> {
            Ok(Rec {
                key: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
                value: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
            })
        }

        fn hash(&self) -> u64 {
            self.key as u64
        }

        fn matches_key(&self, other: &Self) -> bool {
            self.key == other.key
        }
    }

    #[test]
    fn insert_then_lookup() {
        let mut hf: HashFile<Rec> = HashFile::new(4);
        hf.insert(Rec { key: 1, value: 100 });
        hf.insert(Rec { key: 2, value: 200 });
        assert_eq!(hf.lookup(&Rec { key: 1, value: 0 }), Some(&Rec { key: 1, value: 100 }));
        assert_eq!(hf.len(), 2);
    }

    #[test]
    fn delete_then_reinsert_reuses_slot() {
        let mut hf: HashFile<Rec> = HashFile::new(4);
        hf.insert(Rec { key: 1, value: 1 });
        assert!(hf.delete(&Rec { key: 1, value: 0 }));
        assert_eq!(hf.lookup(&Rec { key: 1, value: 0 }), None);
        hf.insert(Rec { key: 1, value: 2 });
        assert_eq!(hf.lookup(&Rec { key: 1, value: 0 }), Some(&Rec { key: 1, value: 2 }));
    }

    #[test]
    fn grows_past_load_factor() {
        let mut hf: HashFile<Rec> = HashFile::new(2);
        for i in 0..10 {
            hf.insert(Rec { key: i, value: i as u64 });
        }
        assert_eq!(hf.len(), 10);
        for i in 0..10 {
            assert!(hf.lookup(&Rec { key: i, value: 0 }).is_some());
        }
    }

    #[test]
    fn flush_then_load_round_trips() {
        let mut hf: HashFile<Rec> = HashFile::new(4);
        hf.insert(Rec { key: 1, value: 9 });
        hf.insert(Rec { key: 2, value: 8 });
        hf.delete(&Rec { key: 2, value: 0 });

        let mut buf = io::Cursor::new(Vec::new());
        hf.flush(&mut buf).unwrap();
        buf.set_position(0);
        let loaded: HashFile<Rec> = HashFile::load(&mut buf).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.lookup(&Rec { key: 1, value: 0 }), Some(&Rec { key: 1, value: 9 }));
        assert_eq!(loaded.lookup(&Rec { key: 2, value: 0 }), None);
    }
}
