//! Per-directory journals of pending ADD/DEL entries (spec §3/§4.7.4).
//!
//! A directory accumulates journal entries while disconnected from the
//! master; `reintegrate_dir` (C7) replays them in order. Kept as an
//! append-only `Vec` per directory FH behind a `dashmap`, matching the
//! teacher's per-handle state maps (e.g. `vfs_task.rs`).

use std::path::Path;

use dashmap::DashMap;

use crate::error::{ReconcileError, Result};
use crate::model::{Fh, JournalEntry, JournalOper};

#[derive(Default)]
pub struct JournalStore {
    journals: DashMap<Fh, Vec<JournalEntry>>,
}

fn encode_fh(out: &mut Vec<u8>, fh: &Fh) {
    for v in [fh.sid, fh.vid, fh.dev, fh.ino, fh.gen] {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

fn decode_fh(buf: &[u8], p: &mut usize) -> Fh {
    let mut next = || {
        let v = u32::from_le_bytes(buf[*p..*p + 4].try_into().unwrap());
        *p += 4;
        v
    };
    Fh { sid: next(), vid: next(), dev: next(), ino: next(), gen: next() }
}

fn encode_entry(out: &mut Vec<u8>, entry: &JournalEntry) {
    encode_fh(out, &entry.local_fh);
    out.push(match entry.oper {
        JournalOper::Add => 0,
        JournalOper::Del => 1,
    });
    let name = entry.name.as_bytes();
    out.extend_from_slice(&(name.len() as u32).to_le_bytes());
    out.extend_from_slice(name);
    encode_fh(out, &entry.master_fh);
    out.extend_from_slice(&entry.master_version.to_le_bytes());
}

fn decode_entry(buf: &[u8], p: &mut usize) -> Result<JournalEntry> {
    if *p + 20 + 1 + 4 > buf.len() {
        return Err(ReconcileError::MetadataError);
    }
    let local_fh = decode_fh(buf, p);
    let oper = match buf[*p] {
        0 => JournalOper::Add,
        1 => JournalOper::Del,
        _ => return Err(ReconcileError::MetadataError),
    };
    *p += 1;
    let name_len = u32::from_le_bytes(buf[*p..*p + 4].try_into().unwrap()) as usize;
    *p += 4;
    if *p + name_len + 20 + 8 > buf.len() {
        return Err(ReconcileError::MetadataError);
    }
    let name = String::from_utf8_lossy(&buf[*p..*p + name_len]).into_owned();
    *p += name_len;
    let master_fh = decode_fh(buf, p);
    let master_version = u64::from_le_bytes(buf[*p..*p + 8].try_into().unwrap());
    *p += 8;
    Ok(JournalEntry { local_fh, oper, name, master_fh, master_version })
}

impl JournalStore {
    pub fn new() -> Self {
        JournalStore { journals: DashMap::new() }
    }

    /// Persist `dir`'s journal to `path` in entry order (spec §4.3
    /// `write_journal`), using the same append-or-rewrite sidecar
    /// convention as the interval trees.
    pub fn write_journal(&self, dir: &Fh, path: &Path) -> Result<()> {
        let entries = self.read(dir);
        let mut buf = Vec::new();
        for entry in &entries {
            encode_entry(&mut buf, entry);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, buf)?;
        Ok(())
    }

    /// Load `dir`'s journal from `path`, replacing whatever is currently
    /// in memory, preserving on-disk entry order (spec §4.3 `read_journal`).
    /// A missing file means an empty journal, not an error.
    pub fn read_journal(&self, dir: Fh, path: &Path) -> Result<()> {
        let buf = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.journals.remove(&dir);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        let mut p = 0;
        while p < buf.len() {
            entries.push(decode_entry(&buf, &mut p)?);
        }
        self.journals.insert(dir, entries);
        Ok(())
    }

    /// Append one entry; a `Del` immediately following an `Add` of the
    /// same name cancels both out, since the master never needs to see
    /// an object that was created and removed purely locally.
    pub fn add_entry(&self, dir: Fh, entry: JournalEntry) {
        let mut log = self.journals.entry(dir).or_default();
        if entry.oper == JournalOper::Del {
            if let Some(pos) = log.iter().rposition(|e| e.oper == JournalOper::Add && e.name == entry.name) {
                log.remove(pos);
                return;
            }
        }
        log.push(entry);
    }

    pub fn read(&self, dir: &Fh) -> Vec<JournalEntry> {
        self.journals.get(dir).map(|v| v.clone()).unwrap_or_default()
    }

    pub fn clear(&self, dir: &Fh) {
        self.journals.remove(dir);
    }

    pub fn is_empty(&self, dir: &Fh) -> bool {
        self.journals.get(dir).map(|v| v.is_empty()).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fh(ino: u32) -> Fh {
        Fh { sid: 0, vid: 0, dev: 1, ino, gen: 0 }
    }

    fn entry(oper: JournalOper, name: &str) -> JournalEntry {
        JournalEntry { local_fh: fh(99), oper, name: name.to_string(), master_fh: Fh::UNDEFINED, master_version: 0 }
    }

    #[test]
    fn add_then_del_same_name_cancels() {
        let store = JournalStore::new();
        store.add_entry(fh(1), entry(JournalOper::Add, "a"));
        store.add_entry(fh(1), entry(JournalOper::Del, "a"));
        assert!(store.is_empty(&fh(1)));
    }

    #[test]
    fn unrelated_entries_accumulate_in_order() {
        let store = JournalStore::new();
        store.add_entry(fh(1), entry(JournalOper::Add, "a"));
        store.add_entry(fh(1), entry(JournalOper::Add, "b"));
        let log = store.read(&fh(1));
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].name, "a");
        assert_eq!(log[1].name, "b");
    }

    #[test]
    fn clear_drops_journal() {
        let store = JournalStore::new();
        store.add_entry(fh(1), entry(JournalOper::Add, "a"));
        store.clear(&fh(1));
        assert!(store.is_empty(&fh(1)));
    }

    #[test]
    fn write_then_read_journal_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.journal");

        let store = JournalStore::new();
        store.add_entry(fh(1), entry(JournalOper::Add, "a"));
        store.add_entry(fh(1), entry(JournalOper::Add, "b"));
        store.write_journal(&fh(1), &path).unwrap();

        let reloaded = JournalStore::new();
        reloaded.read_journal(fh(1), &path).unwrap();
        assert_eq!(reloaded.read(&fh(1)), store.read(&fh(1)));
    }

    #[test]
    fn read_journal_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::new();
        store.read_journal(fh(1), &dir.path().join("nope.journal")).unwrap();
        assert!(store.is_empty(&fh(1)));
    }
}
