//! Pushing local writes back up to the master (spec §4.7.3–§4.7.4).

use async_trait::async_trait;

use crate::error::Result;
use crate::interval::Interval;
use crate::metadata::MetadataStore;
use crate::model::{Fh, JournalEntry, JournalOper};
use crate::reconcile::conflict::ConflictStore;
use crate::reconcile::update::{LocalFile, ZFS_MAXDATA};

/// Outcome of asking the master to create a directory entry (spec §4.7.4
/// ADD replay): either it went through, or the master already holds a
/// different object under that name — a create-create clash the caller
/// must turn into a conflict directory rather than silently overwrite.
pub enum CreateOutcome {
    Created(Fh),
    Conflict(Fh),
}

/// Outcome of asking the master to remove a directory entry (spec §4.7.4
/// DEL replay): either it went through, or the master's object no longer
/// matches what we journaled the deletion against — a delete-modify
/// clash.
pub enum RemoveOutcome {
    Removed,
    Conflict(Fh),
}

/// The reconciliation engine's outbound view of the master: pushing
/// bytes and directory operations rather than pulling them (the write
/// side of [`crate::reconcile::update::MasterLink`]).
#[async_trait]
pub trait MasterWriteLink: Send + Sync {
    async fn push_data(&self, master_fh: Fh, offset: u64, data: &[u8], local_version: u64) -> Result<u64>;
    async fn push_create(&self, parent_master_fh: Fh, name: &str) -> Result<CreateOutcome>;
    async fn push_remove(&self, parent_master_fh: Fh, name: &str) -> Result<RemoveOutcome>;
    /// Request exclusive reintegration privilege for `master_fh` (spec
    /// §4.7.3 `remote_reintegrate(1)`). `Err(ReconcileError::Busy)` means
    /// another node already holds it; the caller requeues rather than
    /// spin-retrying here.
    async fn request_reintegrate(&self, master_fh: Fh) -> Result<()>;
    /// Release reintegration privilege. `version_diff` is `Some(n)` for
    /// the metadata-only release (`remote_reintegrate_ver`, spec §4.7.3
    /// step 5 "modified empty, local ahead of master") and `None` for the
    /// ordinary `remote_reintegrate(0)` release after a data push.
    async fn release_reintegrate(&self, master_fh: Fh, version_diff: Option<u64>) -> Result<()>;
    /// Push a size-only attribute change once block pushes complete but
    /// the file shrank or grew without a corresponding byte range (spec
    /// §4.7.3 step 4).
    async fn push_setattr(&self, master_fh: Fh, size: u64) -> Result<()>;
}

/// Push every range in `fh`'s modified tree up to the master in
/// [`ZFS_MAXDATA`]-sized writes, deleting each sub-range from the tree as
/// it's acknowledged so a failure partway through leaves only the
/// unpushed remainder marked dirty (spec §4.7.3). Bumps `master_version`
/// to match `local_version` and clears `MODIFIED_TREE` once the tree is
/// empty, then persists both the metadata record and the interval log.
pub async fn reintegrate_file_blocks(master: &dyn MasterWriteLink, local: &dyn LocalFile, metadata: &MetadataStore, fh: Fh, master_fh: Fh) -> Result<()> {
    master.request_reintegrate(master_fh).await?;

    let mut meta = metadata.lookup(&fh).ok_or(crate::error::ReconcileError::Stale)?;
    let ranges: Vec<_> = metadata.with_modified_tree(&fh, |t| t.iter().collect());
    let mut pushed_any = false;

    for range in ranges {
        let mut offset = range.start;
        while offset < range.end {
            let len = ((range.end - offset).min(ZFS_MAXDATA as u64)) as u32;
            let data = local.read_local(offset, len)?;
            if data.is_empty() {
                break;
            }
            master.push_data(master_fh, offset, &data, meta.local_version).await?;
            pushed_any = true;
            let pushed_end = offset + data.len() as u64;
            metadata.with_modified_tree(&fh, |t| t.delete(offset, pushed_end));
            offset = pushed_end;
        }
    }

    let modified_empty = metadata.with_modified_tree(&fh, |t| t.is_empty());
    let version_ahead = meta.local_version.saturating_sub(meta.master_version);

    if !pushed_any && modified_empty && version_ahead > 0 {
        master.push_setattr(master_fh, meta.size).await?;
        master.release_reintegrate(master_fh, Some(version_ahead)).await?;
    } else {
        master.release_reintegrate(master_fh, None).await?;
    }

    meta.master_version = meta.local_version;
    if modified_empty {
        meta.flags.remove(crate::model::MetaFlags::MODIFIED_TREE);
    }
    metadata.set_metadata(fh, meta);
    metadata.save_interval_trees(&fh)?;
    Ok(())
}

/// Replay a directory's journal against the master in order, dropping
/// each entry once acknowledged so a crash mid-replay resumes correctly
/// (spec §4.7.4). An ADD whose local file has since disappeared is
/// skipped outright; an ADD the master already satisfies with a
/// different object, or a DEL the master no longer agrees with, is
/// turned into a conflict directory via `conflicts.mark` instead of
/// silently clobbering the master's state. Stops and returns the error on
/// the first transport failure, leaving the remaining entries queued.
pub async fn reintegrate_dir(master: &dyn MasterWriteLink, conflicts: &ConflictStore, store: &MetadataStore, parent_master_fh: Fh, journal: &[JournalEntry]) -> Result<usize> {
    let mut done = 0;
    for entry in journal {
        match entry.oper {
            JournalOper::Add => {
                if store.lookup(&entry.local_fh).is_some() {
                    match master.push_create(parent_master_fh, &entry.name).await? {
                        CreateOutcome::Created(_) => {}
                        CreateOutcome::Conflict(remote_fh) => {
                            conflicts.mark(store, entry.local_fh, entry.local_fh, remote_fh, false)?;
                        }
                    }
                }
            }
            JournalOper::Del => match master.push_remove(parent_master_fh, &entry.name).await? {
                RemoveOutcome::Removed => {}
                RemoveOutcome::Conflict(remote_fh) => {
                    conflicts.mark(store, entry.local_fh, entry.local_fh, remote_fh, true)?;
                }
            },
        }
        done += 1;
    }
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Metadata;
    use std::sync::Mutex;

    struct FakeLocal {
        buf: Vec<u8>,
    }

    impl LocalFile for FakeLocal {
        fn read_local(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
            let start = offset as usize;
            let end = (start + len as usize).min(self.buf.len());
            Ok(self.buf[start..end].to_vec())
        }
        fn write_local(&self, _offset: u64, _data: &[u8]) -> Result<()> {
            Ok(())
        }
        fn truncate_local(&self, _size: u64) -> Result<()> {
            Ok(())
        }
    }

    struct FakeMaster {
        pushed: Mutex<Vec<(u64, usize)>>,
        create_conflict: bool,
        remove_conflict: bool,
    }

    impl FakeMaster {
        fn new() -> Self {
            FakeMaster { pushed: Mutex::new(vec![]), create_conflict: false, remove_conflict: false }
        }
    }

    #[async_trait]
    impl MasterWriteLink for FakeMaster {
        async fn push_data(&self, _master_fh: Fh, offset: u64, data: &[u8], _local_version: u64) -> Result<u64> {
            self.pushed.lock().unwrap().push((offset, data.len()));
            Ok(offset + data.len() as u64)
        }
        async fn push_create(&self, _parent_master_fh: Fh, _name: &str) -> Result<CreateOutcome> {
            if self.create_conflict {
                Ok(CreateOutcome::Conflict(Fh { sid: 9, vid: 0, dev: 1, ino: 5, gen: 0 }))
            } else {
                Ok(CreateOutcome::Created(Fh::UNDEFINED))
            }
        }
        async fn push_remove(&self, _parent_master_fh: Fh, _name: &str) -> Result<RemoveOutcome> {
            if self.remove_conflict {
                Ok(RemoveOutcome::Conflict(Fh { sid: 9, vid: 0, dev: 1, ino: 6, gen: 0 }))
            } else {
                Ok(RemoveOutcome::Removed)
            }
        }
        async fn request_reintegrate(&self, _master_fh: Fh) -> Result<()> {
            Ok(())
        }
        async fn release_reintegrate(&self, _master_fh: Fh, _version_diff: Option<u64>) -> Result<()> {
            Ok(())
        }
        async fn push_setattr(&self, _master_fh: Fh, _size: u64) -> Result<()> {
            Ok(())
        }
    }

    fn fh(ino: u32) -> Fh {
        Fh { sid: 0, vid: 0, dev: 1, ino, gen: 0 }
    }

    #[tokio::test]
    async fn reintegrate_file_blocks_clears_tree_and_bumps_master_version() {
        let local = FakeLocal { buf: vec![1u8; 2000] };
        let master = FakeMaster::new();
        let metadata = MetadataStore::new("/tmp/vol");
        let handle = fh(1);
        let mut meta = Metadata::fresh(1, 1, false);
        meta.local_version = 5;
        meta.master_version = 4;
        metadata.set_metadata(handle, meta);
        metadata.with_modified_tree(&handle, |t| t.insert(Interval::new(0, 2000)));

        reintegrate_file_blocks(&master, &local, &metadata, handle, handle).await.unwrap();

        assert!(metadata.with_modified_tree(&handle, |t| t.is_empty()));
        assert!(!master.pushed.lock().unwrap().is_empty());
        let meta = metadata.lookup(&handle).unwrap();
        assert_eq!(meta.master_version, 5);
        assert!(!meta.flags.contains(crate::model::MetaFlags::MODIFIED_TREE));
    }

    #[tokio::test]
    async fn reintegrate_dir_replays_in_order() {
        let master = FakeMaster::new();
        let store = MetadataStore::new("/tmp/vol");
        let conflicts = ConflictStore::new();
        store.set_metadata(fh(1), Metadata::fresh(1, 1, false));
        let entries = vec![
            JournalEntry { local_fh: fh(1), oper: JournalOper::Add, name: "a".into(), master_fh: Fh::UNDEFINED, master_version: 0 },
            JournalEntry { local_fh: fh(1), oper: JournalOper::Del, name: "b".into(), master_fh: Fh::UNDEFINED, master_version: 0 },
        ];
        let done = reintegrate_dir(&master, &conflicts, &store, Fh::UNDEFINED, &entries).await.unwrap();
        assert_eq!(done, 2);
        assert!(!conflicts.is_conflicted(&fh(1)));
    }

    #[tokio::test]
    async fn reintegrate_dir_marks_create_create_conflict() {
        let master = FakeMaster { create_conflict: true, ..FakeMaster::new() };
        let store = MetadataStore::new("/tmp/vol");
        let conflicts = ConflictStore::new();
        store.set_metadata(fh(1), Metadata::fresh(1, 1, false));
        let entries = vec![JournalEntry { local_fh: fh(1), oper: JournalOper::Add, name: "a".into(), master_fh: Fh::UNDEFINED, master_version: 0 }];

        reintegrate_dir(&master, &conflicts, &store, Fh::UNDEFINED, &entries).await.unwrap();

        assert!(conflicts.is_conflicted(&fh(1)));
    }

    #[tokio::test]
    async fn reintegrate_dir_marks_delete_modify_conflict() {
        let master = FakeMaster { remove_conflict: true, ..FakeMaster::new() };
        let store = MetadataStore::new("/tmp/vol");
        let conflicts = ConflictStore::new();
        store.set_metadata(fh(1), Metadata::fresh(1, 1, false));
        let entries = vec![JournalEntry { local_fh: fh(1), oper: JournalOper::Del, name: "b".into(), master_fh: Fh::UNDEFINED, master_version: 0 }];

        reintegrate_dir(&master, &conflicts, &store, Fh::UNDEFINED, &entries).await.unwrap();

        let conflict = conflicts.get(&fh(1)).unwrap();
        assert!(conflict.nonexistent);
    }

    #[tokio::test]
    async fn reintegrate_dir_skips_add_for_vanished_local_file() {
        let master = FakeMaster::new();
        let store = MetadataStore::new("/tmp/vol");
        let conflicts = ConflictStore::new();
        let entries = vec![JournalEntry { local_fh: fh(99), oper: JournalOper::Add, name: "gone".into(), master_fh: Fh::UNDEFINED, master_version: 0 }];

        let done = reintegrate_dir(&master, &conflicts, &store, Fh::UNDEFINED, &entries).await.unwrap();

        assert_eq!(done, 1);
        assert!(master.pushed.lock().unwrap().is_empty());
    }
}
