//! Conflict directories (spec §4.7.5).
//!
//! When a create-create or modify-modify clash is found while
//! reintegrating, the dentry that used to sit at the contested namespace
//! position is replaced by a synthetic *conflict directory*: a node with
//! two or three children — the local copy, the remote copy (carrying the
//! master's `sid`), and, for a delete-vs-modify clash, a `.nonexistent`
//! tombstone child marking the side that has no object at all. No direct
//! teacher analogue; modelled directly from spec §4.7.5's description
//! since none of the example repos in the pack resolve name clashes.

use dashmap::DashMap;

use crate::error::{ReconcileError, Result};
use crate::metadata::MetadataStore;
use crate::model::Fh;

pub const NONEXISTENT_CHILD_NAME: &str = ".nonexistent";

/// A materialised conflict: the namespace position `at` used to hold a
/// single object and now holds this synthetic directory instead.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictDirectory {
    /// The name the conflicting object had in its parent before the
    /// conflict was materialised — restored verbatim by `cancel`.
    pub original_name: String,
    /// Local copy's FH (unchanged from before the conflict).
    pub local_child: Fh,
    /// Remote copy's FH, always carrying the master's `sid` (spec §4.7.5
    /// "a remote child ... with `sid = master`").
    pub remote_child: Fh,
    /// Set for a delete-modify conflict where one side has nothing to
    /// show but a `.nonexistent` tombstone (spec §4.7.5).
    pub nonexistent: bool,
}

impl ConflictDirectory {
    pub fn child_names(&self) -> Vec<&'static str> {
        let mut names = vec!["local", "remote"];
        if self.nonexistent {
            names.push(NONEXISTENT_CHILD_NAME);
        }
        names
    }
}

pub fn conflict_name(dev: u32, ino: u32) -> String {
    format!(".zfs-conflict-{dev:08x}-{ino:08x}")
}

/// Tracks every currently-materialised conflict, keyed by the namespace
/// position (the local FH the conflict directory stands in for).
#[derive(Default)]
pub struct ConflictStore {
    conflicts: DashMap<Fh, ConflictDirectory>,
}

impl ConflictStore {
    pub fn new() -> Self {
        ConflictStore { conflicts: DashMap::new() }
    }

    /// Materialise a conflict: the position's name is rewritten to the
    /// synthetic conflict name so both children remain independently
    /// addressable until resolved (spec §4.7.5).
    pub fn mark(&self, store: &MetadataStore, at: Fh, local_child: Fh, remote_child: Fh, nonexistent: bool) -> Result<()> {
        let mut meta = store.lookup(&at).ok_or(ReconcileError::Stale)?;
        let original_name = meta.name.clone();
        meta.name = conflict_name(meta.dev, meta.ino);
        store.set_metadata(at, meta);
        self.conflicts.insert(at, ConflictDirectory { original_name, local_child, remote_child, nonexistent });
        Ok(())
    }

    pub fn get(&self, at: &Fh) -> Option<ConflictDirectory> {
        self.conflicts.get(at).map(|c| c.clone())
    }

    pub fn is_conflicted(&self, at: &Fh) -> bool {
        self.conflicts.contains_key(at)
    }

    /// Restore the original dentry at `at`, discarding the conflict
    /// record without deciding a winner — used e.g. when a rename must
    /// go through a conflicted directory (spec §8 "rename...must cancel
    /// the conflict before renaming").
    pub fn cancel(&self, store: &MetadataStore, at: &Fh) -> Result<()> {
        let (_, conflict) = self.conflicts.remove(at).ok_or(ReconcileError::Stale)?;
        let mut meta = store.lookup(at).ok_or(ReconcileError::Stale)?;
        meta.name = conflict.original_name;
        store.set_metadata(*at, meta);
        Ok(())
    }

    /// Resolve by keeping the local copy: tombstone the remote child's
    /// local record (if we have one cached for it) and restore the
    /// position's name, then bump both versions to `max+1` per spec
    /// §4.7.5 so the next scheduler pass reintegrates the winner.
    pub fn resolve_discard_remote(&self, store: &MetadataStore, at: &Fh) -> Result<()> {
        let (_, conflict) = self.conflicts.remove(at).ok_or(ReconcileError::Stale)?;
        let mut meta = store.lookup(at).ok_or(ReconcileError::Stale)?;
        meta.name = conflict.original_name;
        let winner = meta.local_version.max(meta.master_version) + 1;
        meta.local_version = winner;
        meta.master_version = winner;
        store.set_metadata(*at, meta);
        if conflict.remote_child != conflict.local_child {
            if let Some(mut remote_meta) = store.lookup(&conflict.remote_child) {
                remote_meta.tombstone();
                store.set_metadata(conflict.remote_child, remote_meta);
            }
        }
        Ok(())
    }

    /// Resolve by keeping the master's copy: adopt the remote child's
    /// content attributes onto the position and restore its name, then
    /// bump both versions to `max+1` (spec §4.7.5).
    pub fn resolve_discard_local(&self, store: &MetadataStore, at: &Fh) -> Result<()> {
        let (_, conflict) = self.conflicts.remove(at).ok_or(ReconcileError::Stale)?;
        let remote_meta = store.lookup(&conflict.remote_child).ok_or(ReconcileError::Stale)?;
        let mut meta = store.lookup(at).ok_or(ReconcileError::Stale)?;
        meta.name = conflict.original_name;
        meta.modetype = remote_meta.modetype;
        meta.uid = remote_meta.uid;
        meta.gid = remote_meta.gid;
        let winner = meta.local_version.max(meta.master_version) + 1;
        meta.local_version = winner;
        meta.master_version = winner;
        store.set_metadata(*at, meta);
        Ok(())
    }

    /// Resolve a delete-modify conflict by accepting that the *local*
    /// side deleted the object: the position is tombstoned and the
    /// remote child, which held the surviving modification, is dropped
    /// along with it (spec §4.7.5 `resolve_conflict_delete_local`).
    pub fn resolve_delete_local(&self, store: &MetadataStore, at: &Fh) -> Result<()> {
        let (_, conflict) = self.conflicts.remove(at).ok_or(ReconcileError::Stale)?;
        if conflict.remote_child != *at {
            let _ = store.delete_metadata(&conflict.remote_child);
        }
        store.delete_metadata(at)
    }

    /// Resolve a delete-modify conflict by accepting that the *remote*
    /// side deleted the object: the local child's content is discarded
    /// and the position is tombstoned (spec §4.7.5
    /// `resolve_conflict_delete_remote`).
    pub fn resolve_delete_remote(&self, store: &MetadataStore, at: &Fh) -> Result<()> {
        let (_, conflict) = self.conflicts.remove(at).ok_or(ReconcileError::Stale)?;
        if conflict.local_child != *at {
            let _ = store.delete_metadata(&conflict.local_child);
        }
        store.delete_metadata(at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Metadata;

    fn fh(ino: u32) -> Fh {
        Fh { sid: 0, vid: 0, dev: 1, ino, gen: 0 }
    }

    fn remote_fh(ino: u32) -> Fh {
        Fh { sid: 9, vid: 0, dev: 1, ino, gen: 0 }
    }

    #[test]
    fn mark_then_cancel_round_trips_name() {
        let store = MetadataStore::new("/tmp/vol");
        let conflicts = ConflictStore::new();
        let mut meta = Metadata::fresh(1, 1, false);
        meta.name = "original".into();
        store.set_metadata(fh(1), meta);

        conflicts.mark(&store, fh(1), fh(1), remote_fh(2), false).unwrap();
        assert_eq!(store.lookup(&fh(1)).unwrap().name, conflict_name(1, 1));
        assert!(conflicts.is_conflicted(&fh(1)));

        conflicts.cancel(&store, &fh(1)).unwrap();
        assert_eq!(store.lookup(&fh(1)).unwrap().name, "original");
        assert!(!conflicts.is_conflicted(&fh(1)));
    }

    #[test]
    fn resolve_discard_local_adopts_remote_attrs_and_bumps_versions() {
        let store = MetadataStore::new("/tmp/vol");
        let conflicts = ConflictStore::new();
        let mut meta = Metadata::fresh(1, 1, false);
        meta.modetype = 0o100644;
        meta.name = "f".into();
        meta.local_version = 2;
        meta.master_version = 1;
        store.set_metadata(fh(1), meta);
        let mut remote = Metadata::fresh(1, 2, false);
        remote.modetype = 0o100755;
        store.set_metadata(remote_fh(2), remote);
        conflicts.mark(&store, fh(1), fh(1), remote_fh(2), false).unwrap();

        conflicts.resolve_discard_local(&store, &fh(1)).unwrap();
        let resolved = store.lookup(&fh(1)).unwrap();
        assert_eq!(resolved.name, "f");
        assert_eq!(resolved.modetype, 0o100755);
        assert_eq!(resolved.local_version, 3);
        assert_eq!(resolved.master_version, 3);
        assert!(!conflicts.is_conflicted(&fh(1)));
    }

    #[test]
    fn resolve_discard_remote_tombstones_the_remote_child() {
        let store = MetadataStore::new("/tmp/vol");
        let conflicts = ConflictStore::new();
        let mut local = Metadata::fresh(1, 1, false);
        local.modetype = 0o100644;
        local.name = "f".into();
        store.set_metadata(fh(1), local);
        let mut remote = Metadata::fresh(1, 2, false);
        remote.modetype = 0o100644;
        store.set_metadata(remote_fh(2), remote);
        conflicts.mark(&store, fh(1), fh(1), remote_fh(2), false).unwrap();

        conflicts.resolve_discard_remote(&store, &fh(1)).unwrap();
        assert!(store.lookup(&remote_fh(2)).unwrap().is_tombstoned());
        assert!(!store.lookup(&fh(1)).unwrap().is_tombstoned());
    }

    #[test]
    fn resolve_delete_local_tombstones_position_and_remote_child() {
        let store = MetadataStore::new("/tmp/vol");
        let conflicts = ConflictStore::new();
        let mut meta = Metadata::fresh(1, 1, false);
        meta.modetype = 0o100644;
        store.set_metadata(fh(1), meta);
        let mut remote = Metadata::fresh(1, 2, false);
        remote.modetype = 0o100644;
        store.set_metadata(remote_fh(2), remote);
        conflicts.mark(&store, fh(1), fh(1), remote_fh(2), true).unwrap();

        conflicts.resolve_delete_local(&store, &fh(1)).unwrap();
        assert!(store.lookup(&fh(1)).unwrap().is_tombstoned());
        assert!(store.lookup(&remote_fh(2)).unwrap().is_tombstoned());
    }

    #[test]
    fn resolve_delete_remote_tombstones_position_and_local_child() {
        let store = MetadataStore::new("/tmp/vol");
        let conflicts = ConflictStore::new();
        let mut meta = Metadata::fresh(1, 1, false);
        meta.modetype = 0o100644;
        store.set_metadata(fh(1), meta);
        conflicts.mark(&store, fh(1), fh(1), remote_fh(2), true).unwrap();

        conflicts.resolve_delete_remote(&store, &fh(1)).unwrap();
        assert!(store.lookup(&fh(1)).unwrap().is_tombstoned());
    }

    #[test]
    fn nonexistent_child_is_named_per_spec() {
        let conflict = ConflictDirectory {
            original_name: "f".into(),
            local_child: fh(1),
            remote_child: remote_fh(2),
            nonexistent: true,
        };
        assert!(conflict.child_names().contains(&NONEXISTENT_CHILD_NAME));
    }
}
