//! Per-object hardlink lists (spec §3).
//!
//! Most objects have exactly one hardlink and store it inline in their
//! [`crate::model::Metadata`] record (`parent_dev`/`parent_ino`/`name`).
//! This sidecar only holds entries for objects with more than one
//! hardlink, matching the spec's inline-fast-path / sidecar-slow-path
//! split and the teacher's habit of keeping a small map for the
//! uncommon case rather than always paying for a `Vec`. Tracked as a
//! multiset, not a deduped set: nothing prevents two directory entries
//! resolving to the same `(parent_dev, parent_ino, name)` key transiently
//! during reintegration replay, and collapsing them would lose a link.

use dashmap::DashMap;

use crate::error::{ReconcileError, Result};
use crate::metadata::MetadataStore;
use crate::model::{Fh, HardlinkKey, UNDEFINED};

#[derive(Default)]
pub struct HardlinkStore {
    links: DashMap<Fh, Vec<HardlinkKey>>,
}

impl HardlinkStore {
    pub fn new() -> Self {
        HardlinkStore { links: DashMap::new() }
    }

    /// Push one more hardlink entry for `fh`, regardless of whether an
    /// identical key is already present (multiset semantics).
    pub fn insert(&self, fh: Fh, key: HardlinkKey) {
        self.links.entry(fh).or_default().push(key);
    }

    /// Replace one hardlink entry with another, e.g. on `rename` (spec §4.3).
    pub fn replace(&self, fh: Fh, old: &HardlinkKey, new: HardlinkKey) {
        let mut entry = self.links.entry(fh).or_default();
        if let Some(slot) = entry.iter_mut().find(|k| *k == old) {
            *slot = new;
        } else {
            entry.push(new);
        }
    }

    /// Overwrite the entire hardlink list for `fh`.
    pub fn set(&self, fh: Fh, keys: Vec<HardlinkKey>) {
        self.links.insert(fh, keys);
    }

    /// Remove a single occurrence of `key`, leaving any duplicates in place.
    pub fn remove(&self, fh: &Fh, key: &HardlinkKey) -> bool {
        if let Some(mut entry) = self.links.get_mut(fh) {
            if let Some(pos) = entry.iter().position(|k| k == key) {
                entry.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn clear(&self, fh: &Fh) {
        self.links.remove(fh);
    }

    pub fn n_hardlinks(&self, fh: &Fh) -> usize {
        self.links.get(fh).map(|v| v.len()).unwrap_or(0)
    }

    pub fn read(&self, fh: &Fh) -> Vec<HardlinkKey> {
        self.links.get(fh).map(|v| v.clone()).unwrap_or_default()
    }
}

/// Record a new hardlink `key` pointing at `fh`, keeping `Metadata`'s
/// inline `parent_dev`/`parent_ino`/`name` in sync with the sidecar across
/// the one-link / many-link threshold (spec §3 invariant, §8 scenario 6
/// "hardlink split"). The first link is stored inline with no sidecar at
/// all; the second link folds the inline entry into the sidecar alongside
/// the new one and clears the inline fields.
pub fn link_created(hardlinks: &HardlinkStore, metadata: &MetadataStore, fh: Fh, key: HardlinkKey) -> Result<()> {
    let mut meta = metadata.lookup(&fh).ok_or(ReconcileError::Stale)?;
    if meta.parent_dev == UNDEFINED && hardlinks.n_hardlinks(&fh) == 0 {
        meta.parent_dev = key.parent_dev;
        meta.parent_ino = key.parent_ino;
        meta.name = key.name;
        metadata.set_metadata(fh, meta);
        return Ok(());
    }
    if meta.parent_dev != UNDEFINED {
        let inline_key = HardlinkKey { parent_dev: meta.parent_dev, parent_ino: meta.parent_ino, name: meta.name.clone() };
        hardlinks.insert(fh, inline_key);
        meta.parent_dev = UNDEFINED;
        meta.parent_ino = UNDEFINED;
        meta.name.clear();
        metadata.set_metadata(fh, meta);
    }
    hardlinks.insert(fh, key);
    Ok(())
}

/// Drop one hardlink `key` from `fh`, folding the sidecar back inline once
/// exactly one entry remains (the inverse of [`link_created`]).
pub fn link_removed(hardlinks: &HardlinkStore, metadata: &MetadataStore, fh: Fh, key: &HardlinkKey) -> Result<()> {
    let mut meta = metadata.lookup(&fh).ok_or(ReconcileError::Stale)?;
    if meta.parent_dev != UNDEFINED {
        if meta.parent_dev == key.parent_dev && meta.parent_ino == key.parent_ino && meta.name == key.name {
            meta.parent_dev = UNDEFINED;
            meta.parent_ino = UNDEFINED;
            meta.name.clear();
            metadata.set_metadata(fh, meta);
        }
        return Ok(());
    }
    hardlinks.remove(&fh, key);
    if hardlinks.n_hardlinks(&fh) == 1 {
        if let Some(only) = hardlinks.read(&fh).into_iter().next() {
            meta.parent_dev = only.parent_dev;
            meta.parent_ino = only.parent_ino;
            meta.name = only.name;
            metadata.set_metadata(fh, meta);
        }
        hardlinks.clear(&fh);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Metadata;

    fn fh(ino: u32) -> Fh {
        Fh { sid: 0, vid: 0, dev: 1, ino, gen: 0 }
    }

    fn key(name: &str) -> HardlinkKey {
        HardlinkKey { parent_dev: 1, parent_ino: 2, name: name.to_string() }
    }

    #[test]
    fn insert_is_a_multiset() {
        let store = HardlinkStore::new();
        store.insert(fh(1), key("a"));
        store.insert(fh(1), key("a"));
        assert_eq!(store.n_hardlinks(&fh(1)), 2);
    }

    #[test]
    fn replace_swaps_in_place() {
        let store = HardlinkStore::new();
        store.insert(fh(1), key("a"));
        store.replace(fh(1), &key("a"), key("b"));
        assert_eq!(store.read(&fh(1)), vec![key("b")]);
    }

    #[test]
    fn remove_drops_one_occurrence() {
        let store = HardlinkStore::new();
        store.insert(fh(1), key("a"));
        store.insert(fh(1), key("a"));
        assert!(store.remove(&fh(1), &key("a")));
        assert_eq!(store.n_hardlinks(&fh(1)), 1);
    }

    #[test]
    fn first_link_goes_inline_with_no_sidecar() {
        let metadata = MetadataStore::new("/tmp/vol");
        let hardlinks = HardlinkStore::new();
        metadata.set_metadata(fh(1), Metadata::fresh(1, 1, false));

        link_created(&hardlinks, &metadata, fh(1), key("a")).unwrap();

        let meta = metadata.lookup(&fh(1)).unwrap();
        assert_eq!(meta.name, "a");
        assert_eq!(meta.parent_dev, 1);
        assert_eq!(hardlinks.n_hardlinks(&fh(1)), 0);
    }

    #[test]
    fn second_link_moves_both_entries_into_sidecar() {
        let metadata = MetadataStore::new("/tmp/vol");
        let hardlinks = HardlinkStore::new();
        metadata.set_metadata(fh(1), Metadata::fresh(1, 1, false));

        link_created(&hardlinks, &metadata, fh(1), key("a")).unwrap();
        link_created(&hardlinks, &metadata, fh(1), key("b")).unwrap();

        let meta = metadata.lookup(&fh(1)).unwrap();
        assert_eq!(meta.parent_dev, UNDEFINED);
        assert_eq!(hardlinks.n_hardlinks(&fh(1)), 2);
    }

    #[test]
    fn dropping_back_to_one_link_folds_inline_again() {
        let metadata = MetadataStore::new("/tmp/vol");
        let hardlinks = HardlinkStore::new();
        metadata.set_metadata(fh(1), Metadata::fresh(1, 1, false));
        link_created(&hardlinks, &metadata, fh(1), key("a")).unwrap();
        link_created(&hardlinks, &metadata, fh(1), key("b")).unwrap();

        link_removed(&hardlinks, &metadata, fh(1), &key("b")).unwrap();

        let meta = metadata.lookup(&fh(1)).unwrap();
        assert_eq!(meta.name, "a");
        assert_eq!(meta.parent_dev, 1);
        assert_eq!(hardlinks.n_hardlinks(&fh(1)), 0);
    }
}
