//! Pulling fresh data/metadata down from the master (spec §4.7.1–§4.7.2).

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::{ReconcileError, Result};
use crate::conn::LinkSpeed;
use crate::fh_table::FhTable;
use crate::interval::Interval;
use crate::metadata::MetadataStore;
use crate::model::{Fh, FileAttr, FileType, MetaFlags, OpenFlags};
use crate::reconcile::reintegrate::{reintegrate_file_blocks, MasterWriteLink};
use crate::reconcile::{update_p, IfhFlags};
use crate::rpc::SlowLinkCounter;

/// Largest single data fetch, carried over from
/// `original_source/zfsd/data-coding.h`'s `ZFS_MAXDATA`.
pub const ZFS_MAXDATA: usize = 8192;

/// Granularity at which the "modified" interval tree is maintained —
/// matches `original_source/zfsd/data-coding.h`'s `ZFS_MODIFIED_BLOCK_SIZE`.
pub const ZFS_MODIFIED_BLOCK_SIZE: u64 = 1024;

/// Granularity at which the "updated" interval tree grows; tied to the
/// max data fetch size so one successful read always closes one gap.
pub const ZFS_UPDATED_BLOCK_SIZE: u64 = ZFS_MAXDATA as u64;

/// How many block MD5s are requested per round-trip when diffing a
/// partially-local file against its master copy (spec §4.7.2).
pub const ZFS_MAX_MD5_CHUNKS: usize = 64;

/// The reconciliation engine's view of the master node: a thin RPC
/// facade so `update_file`/`update_file_blocks` stay free of wire
/// framing, mirroring how `vfs::Vfs` decouples NFS procedures from
/// transport in the teacher.
#[async_trait]
pub trait MasterLink: Send + Sync {
    async fn fetch_attr(&self, master_fh: Fh) -> Result<FileAttr>;
    async fn fetch_data(&self, master_fh: Fh, offset: u64, len: u32) -> Result<Vec<u8>>;
    async fn fetch_md5(&self, master_fh: Fh, offset: u64, chunk_size: u32, count: u32) -> Result<Vec<[u8; 16]>>;
}

/// A local file's data + interval bookkeeping, as seen by the updater.
pub trait LocalFile: Send + Sync {
    fn read_local(&self, offset: u64, len: u32) -> Result<Vec<u8>>;
    fn write_local(&self, offset: u64, data: &[u8]) -> Result<()>;
    fn truncate_local(&self, size: u64) -> Result<()>;
}

/// Disk-backed [`LocalFile`] rooted at a single local path — the concrete
/// backend the scheduler's worker loop opens for the `fh` it's currently
/// updating or reintegrating.
pub struct DiskLocalFile {
    path: PathBuf,
}

impl DiskLocalFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DiskLocalFile { path: path.into() }
    }
}

impl LocalFile for DiskLocalFile {
    fn read_local(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let mut file = std::fs::File::open(&self.path).map_err(ReconcileError::from)?;
        file.seek(SeekFrom::Start(offset)).map_err(ReconcileError::from)?;
        let mut buf = vec![0u8; len as usize];
        let n = file.read(&mut buf).map_err(ReconcileError::from)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn write_local(&self, offset: u64, data: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(ReconcileError::from)?;
        }
        let mut file = std::fs::OpenOptions::new().create(true).write(true).open(&self.path).map_err(ReconcileError::from)?;
        file.seek(SeekFrom::Start(offset)).map_err(ReconcileError::from)?;
        file.write_all(data).map_err(ReconcileError::from)?;
        Ok(())
    }

    fn truncate_local(&self, size: u64) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(ReconcileError::from)?;
        }
        let file = std::fs::OpenOptions::new().create(true).write(true).open(&self.path).map_err(ReconcileError::from)?;
        file.set_len(size).map_err(ReconcileError::from)?;
        Ok(())
    }
}

/// Result of one [`update_file`] pass (spec §4.7.1 step 9): whether the
/// scheduler should consider the file done or put it back on a queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The `updated` tree now covers `[0, size)` — nothing more to do.
    Complete,
    /// Work remains (the pass only reduced the gap) — requeue.
    Incomplete,
    /// Declined to start this pass at all (slow link already saturated)
    /// — requeue without having touched any state.
    Requeued,
}

/// Run one full update-or-reintegrate pass over `fh` against its master
/// copy (spec §4.7.1): lock the dentry shared, classify what's owed via
/// [`update_p`], back off if the slow link is already saturated, then
/// reintegrate pending local writes and/or pull down missing master data,
/// finally marking the record `COMPLETE` once `updated` spans the whole
/// file.
#[allow(clippy::too_many_arguments)]
pub async fn update_file(
    fh_table: &FhTable,
    metadata: &MetadataStore,
    master: &dyn MasterLink,
    write_master: &dyn MasterWriteLink,
    local: &dyn LocalFile,
    slow_link: &SlowLinkCounter,
    link_speed: LinkSpeed,
    fh: Fh,
) -> Result<UpdateOutcome> {
    let _dentry = fh_table.lock_shared(&fh).await;

    let meta = metadata.lookup(&fh).ok_or(ReconcileError::Stale)?;
    if meta.is_tombstoned() || !meta.master_fh.is_defined() {
        return Ok(UpdateOutcome::Complete);
    }
    let master_fh = meta.master_fh;

    let attr = master.fetch_attr(master_fh).await?;
    if attr.file_type != FileType::Regular {
        return Ok(UpdateOutcome::Complete);
    }

    let bits = update_p(&meta, &attr).bits();
    let wants_update = bits & IfhFlags::UPDATE != 0;
    let wants_reintegrate = bits & IfhFlags::REINTEGRATE != 0;
    if !wants_update && !wants_reintegrate {
        return Ok(UpdateOutcome::Complete);
    }

    // A slow link already carrying a pending request gets no more piled
    // on; back off and let the scheduler try again later (spec §4.7.1
    // step 5 / §4.8 slow-link throttle).
    if link_speed == LinkSpeed::Slow && slow_link.pending() > 0 {
        return Ok(UpdateOutcome::Requeued);
    }

    let open_flags = match (wants_update, wants_reintegrate) {
        (true, true) => OpenFlags::ReadWrite,
        (false, true) => OpenFlags::WriteOnly,
        _ => OpenFlags::ReadOnly,
    };

    slow_link.acquire();
    let cap = fh_table.get_capability(fh, open_flags);
    metadata.load_interval_trees(&fh)?;

    let pass: Result<()> = async {
        if wants_reintegrate {
            reintegrate_file_blocks(write_master, local, metadata, fh, master_fh).await?;
        }
        if wants_update {
            let modified_max = metadata.with_modified_tree(&fh, |t| t.iter().map(|iv| iv.end).max().unwrap_or(0));
            let target_size = attr.size.max(modified_max);
            local.truncate_local(target_size)?;
            let mut meta = metadata.lookup(&fh).ok_or(ReconcileError::Stale)?;
            meta.size = target_size;
            metadata.set_metadata(fh, meta);

            update_file_blocks(master, local, metadata, fh, master_fh).await?;
        }
        Ok(())
    }
    .await;

    fh_table.put_capability(&cap).ok();
    slow_link.release();
    pass?;

    let mut meta = metadata.lookup(&fh).ok_or(ReconcileError::Stale)?;
    let complete = metadata.with_updated_tree(&fh, |t| t.is_complete(meta.size));
    if complete {
        meta.flags.insert(MetaFlags::COMPLETE);
    }
    meta.master_version = attr.version;
    metadata.set_metadata(fh, meta);
    metadata.save_interval_trees(&fh)?;

    if complete {
        Ok(UpdateOutcome::Complete)
    } else {
        Ok(UpdateOutcome::Incomplete)
    }
}

/// Fetch every gap in `fh`'s `updated` tree (up to the master's current
/// size), skipping ranges already pending reintegration in `modified` and
/// skipping ranges an MD5 diff shows already match, writing only what
/// actually differs into `local` (spec §4.7.2).
///
/// Batches the MD5 comparison at [`ZFS_MAX_MD5_CHUNKS`] blocks of
/// [`ZFS_MODIFIED_BLOCK_SIZE`] bytes per round-trip via [`diff_by_md5`].
/// If the master's version has moved since the attrs fetched at the top
/// of a pass, the whole pass restarts from a fresh gap set rather than
/// committing half-diffed data against a version that no longer exists
/// (spec §4.7.2 "silent master change").
pub async fn update_file_blocks(master: &dyn MasterLink, local: &dyn LocalFile, metadata: &MetadataStore, fh: Fh, master_fh: Fh) -> Result<()> {
    loop {
        let attr = master.fetch_attr(master_fh).await?;
        let mut meta = metadata.lookup(&fh).ok_or(ReconcileError::Stale)?;

        if attr.size != meta.size {
            local.truncate_local(attr.size)?;
            meta.size = attr.size;
            metadata.set_metadata(fh, meta.clone());
        }

        let modified: Vec<Interval> = metadata.with_modified_tree(&fh, |t| t.iter().collect());
        let gaps = metadata.with_updated_tree(&fh, |t| t.complement(attr.size));
        let to_fetch: Vec<Interval> = gaps.into_iter().flat_map(|gap| subtract_ranges(gap, &modified)).collect();

        if to_fetch.is_empty() {
            return Ok(());
        }

        // Re-check the master hasn't silently moved on before spending a
        // round-trip diffing against the `attr` snapshot above.
        let reverify = master.fetch_attr(master_fh).await?;
        if reverify.version != attr.version {
            let mut meta = metadata.lookup(&fh).ok_or(ReconcileError::Stale)?;
            meta.master_version = reverify.version;
            metadata.with_updated_tree(&fh, |t| t.clear());
            for range in &modified {
                metadata.with_updated_tree(&fh, |t| t.insert(*range));
            }
            metadata.set_metadata(fh, meta);
            continue;
        }

        let batch_bytes = ZFS_MODIFIED_BLOCK_SIZE * ZFS_MAX_MD5_CHUNKS as u64;
        for range in to_fetch {
            let mut offset = range.start;
            while offset < range.end {
                let batch_end = (offset + batch_bytes).min(range.end);
                let batch = Interval::new(offset, batch_end);
                let differing = diff_by_md5(master, local, master_fh, batch).await?;
                for chunk in &differing {
                    let want = (chunk.end - chunk.start) as u32;
                    let data = master.fetch_data(master_fh, chunk.start, want).await?;
                    if !data.is_empty() {
                        local.write_local(chunk.start, &data)?;
                    }
                }
                metadata.with_updated_tree(&fh, |t| t.insert(batch));
                offset = batch_end;
            }
        }

        return Ok(());
    }
}

/// Subtract every interval in `subtrahends` that overlaps `range`,
/// returning the sub-ranges of `range` left over — used to keep
/// [`update_file_blocks`] from refetching bytes a pending local write
/// already covers (spec §4.7.1 step 8 "fetch ranges").
fn subtract_ranges(range: Interval, subtrahends: &[Interval]) -> Vec<Interval> {
    let mut pieces = vec![range];
    for sub in subtrahends {
        let mut next = Vec::with_capacity(pieces.len());
        for piece in pieces {
            if sub.end <= piece.start || sub.start >= piece.end {
                next.push(piece);
                continue;
            }
            if sub.start > piece.start {
                next.push(Interval::new(piece.start, sub.start));
            }
            if sub.end < piece.end {
                next.push(Interval::new(sub.end, piece.end));
            }
        }
        pieces = next;
    }
    pieces
}

/// Compare a partially-local region against the master's block MD5s and
/// return the sub-ranges that actually differ, so a reconnect after a
/// long disconnection doesn't refetch bytes that never changed (spec
/// §4.7.2 "MD5 diff" path, batched at [`ZFS_MAX_MD5_CHUNKS`] per round-trip).
pub async fn diff_by_md5(
    master: &dyn MasterLink,
    local: &dyn LocalFile,
    master_fh: Fh,
    range: Interval,
) -> Result<Vec<Interval>> {
    let chunk_size = ZFS_MODIFIED_BLOCK_SIZE;
    let mut differing = Vec::new();
    let mut offset = range.start;
    while offset < range.end {
        let batch_bytes = chunk_size * ZFS_MAX_MD5_CHUNKS as u64;
        let batch_end = (offset + batch_bytes).min(range.end);
        let count = ((batch_end - offset) as f64 / chunk_size as f64).ceil() as u32;
        let remote_sums = master.fetch_md5(master_fh, offset, chunk_size as u32, count).await?;
        let mut cursor = offset;
        for sum in remote_sums {
            let len = (chunk_size).min(range.end - cursor) as u32;
            let local_data = local.read_local(cursor, len)?;
            let digest = md5::compute(&local_data);
            if digest.0 != sum {
                differing.push(Interval::new(cursor, cursor + len as u64));
            }
            cursor += len as u64;
        }
        offset = batch_end;
    }
    Ok(differing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileTime, Metadata};
    use crate::reconcile::reintegrate::{CreateOutcome, RemoveOutcome};
    use std::sync::Mutex;

    struct FakeMaster {
        data: Mutex<Vec<u8>>,
        version: Mutex<u64>,
    }

    impl FakeMaster {
        fn new(data: Vec<u8>, version: u64) -> Self {
            FakeMaster { data: Mutex::new(data), version: Mutex::new(version) }
        }
    }

    #[async_trait]
    impl MasterLink for FakeMaster {
        async fn fetch_attr(&self, _master_fh: Fh) -> Result<FileAttr> {
            Ok(FileAttr {
                file_type: FileType::Regular,
                mode: 0o644,
                nlink: 1,
                uid: 0,
                gid: 0,
                rdev: 0,
                size: self.data.lock().unwrap().len() as u64,
                blocks: 0,
                blksize: 4096,
                version: *self.version.lock().unwrap(),
                atime: FileTime::now(),
                mtime: FileTime::now(),
                ctime: FileTime::now(),
            })
        }

        async fn fetch_data(&self, _master_fh: Fh, offset: u64, len: u32) -> Result<Vec<u8>> {
            let data = self.data.lock().unwrap();
            let start = offset as usize;
            if start >= data.len() {
                return Ok(vec![]);
            }
            let end = (start + len as usize).min(data.len());
            Ok(data[start..end].to_vec())
        }

        async fn fetch_md5(&self, _master_fh: Fh, offset: u64, chunk_size: u32, count: u32) -> Result<Vec<[u8; 16]>> {
            let data = self.data.lock().unwrap();
            let mut sums = Vec::new();
            let mut cursor = offset as usize;
            for _ in 0..count {
                let end = (cursor + chunk_size as usize).min(data.len());
                if cursor >= data.len() {
                    break;
                }
                sums.push(md5::compute(&data[cursor..end]).0);
                cursor = end;
            }
            Ok(sums)
        }
    }

    #[async_trait]
    impl MasterWriteLink for FakeMaster {
        async fn push_data(&self, _master_fh: Fh, _offset: u64, _data: &[u8], _local_version: u64) -> Result<u64> {
            Ok(0)
        }
        async fn push_create(&self, _parent_master_fh: Fh, _name: &str) -> Result<CreateOutcome> {
            Ok(CreateOutcome::Created(Fh::UNDEFINED))
        }
        async fn push_remove(&self, _parent_master_fh: Fh, _name: &str) -> Result<RemoveOutcome> {
            Ok(RemoveOutcome::Removed)
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

    struct FakeLocal {
        buf: Mutex<Vec<u8>>,
    }

    impl LocalFile for FakeLocal {
        fn read_local(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
            let buf = self.buf.lock().unwrap();
            let start = offset as usize;
            let end = (start + len as usize).min(buf.len());
            Ok(buf[start..end].to_vec())
        }

        fn write_local(&self, offset: u64, data: &[u8]) -> Result<()> {
            let mut buf = self.buf.lock().unwrap();
            let end = offset as usize + data.len();
            if buf.len() < end {
                buf.resize(end, 0);
            }
            buf[offset as usize..end].copy_from_slice(data);
            Ok(())
        }

        fn truncate_local(&self, size: u64) -> Result<()> {
            self.buf.lock().unwrap().resize(size as usize, 0);
            Ok(())
        }
    }

    fn fh(ino: u32) -> Fh {
        Fh { sid: 0, vid: 0, dev: 1, ino, gen: 0 }
    }

    #[tokio::test]
    async fn update_file_blocks_fills_every_gap() {
        let master = FakeMaster::new(vec![7u8; (ZFS_UPDATED_BLOCK_SIZE as usize) + 10], 1);
        let local = FakeLocal { buf: Mutex::new(vec![]) };
        let metadata = MetadataStore::new("/tmp/vol");
        let handle = fh(1);
        let size = master.data.lock().unwrap().len() as u64;
        let mut meta = Metadata::fresh(1, 1, true);
        meta.size = size;
        metadata.set_metadata(handle, meta);

        update_file_blocks(&master, &local, &metadata, handle, handle).await.unwrap();

        assert!(metadata.with_updated_tree(&handle, |t| t.is_complete(size)));
        assert_eq!(local.buf.lock().unwrap().len(), size as usize);
    }

    #[tokio::test]
    async fn update_file_blocks_skips_ranges_already_matching_master() {
        let data = vec![3u8; 2000];
        let master = FakeMaster::new(data.clone(), 1);
        let local = FakeLocal { buf: Mutex::new(data) };
        let metadata = MetadataStore::new("/tmp/vol");
        let handle = fh(2);
        let mut meta = Metadata::fresh(1, 2, true);
        meta.size = 2000;
        metadata.set_metadata(handle, meta);

        update_file_blocks(&master, &local, &metadata, handle, handle).await.unwrap();

        assert!(metadata.with_updated_tree(&handle, |t| t.is_complete(2000)));
    }

    #[tokio::test]
    async fn update_file_pulls_missing_data_and_marks_complete() {
        let data = vec![9u8; 500];
        let master = FakeMaster::new(data, 3);
        let local = FakeLocal { buf: Mutex::new(vec![]) };
        let dir = tempfile::tempdir().unwrap();
        let metadata = MetadataStore::new(dir.path());
        let fh_table = FhTable::new();
        let slow_link = SlowLinkCounter::new();
        let handle = fh(3);
        let master_fh = Fh { sid: 7, vid: 0, dev: 9, ino: 9, gen: 0 };
        let mut meta = Metadata::fresh(1, 3, true);
        meta.master_fh = master_fh;
        metadata.set_metadata(handle, meta);

        let outcome = update_file(&fh_table, &metadata, &master, &master, &local, &slow_link, LinkSpeed::Fast, handle)
            .await
            .unwrap();

        assert_eq!(outcome, UpdateOutcome::Complete);
        assert_eq!(local.buf.lock().unwrap().len(), 500);
        let meta = metadata.lookup(&handle).unwrap();
        assert!(meta.flags.contains(MetaFlags::COMPLETE));
    }

    #[tokio::test]
    async fn update_file_backs_off_when_slow_link_already_pending() {
        let master = FakeMaster::new(vec![1u8; 10], 1);
        let local = FakeLocal { buf: Mutex::new(vec![]) };
        let metadata = MetadataStore::new("/tmp/vol");
        let fh_table = FhTable::new();
        let slow_link = SlowLinkCounter::new();
        slow_link.acquire();
        let handle = fh(4);
        let master_fh = Fh { sid: 7, vid: 0, dev: 9, ino: 4, gen: 0 };
        let mut meta = Metadata::fresh(1, 4, true);
        meta.master_fh = master_fh;
        metadata.set_metadata(handle, meta);

        let outcome = update_file(&fh_table, &metadata, &master, &master, &local, &slow_link, LinkSpeed::Slow, handle)
            .await
            .unwrap();

        assert_eq!(outcome, UpdateOutcome::Requeued);
    }
}
