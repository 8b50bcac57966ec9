//! Reconciliation engine (C7 — spec §4.7).
//!
//! Decides, per local file, what background work is owed to bring it
//! back in sync with its master copy once a connection exists: fetching
//! missing/stale data (`update`), pushing local writes back
//! (`reintegrate`), or resolving a name clash that showed up while
//! disconnected (`conflict`). Grounded on `original_source/zfsd/update.h`'s
//! `update_p`/`IFH_*` bitset and the `update_file`/`reintegrate_file`
//! family of entry points, expressed in the teacher's `async_trait`
//! collaborator-trait style (`vfs::Vfs`) rather than direct socket calls.

pub mod conflict;
pub mod reintegrate;
pub mod update;

use crate::model::{FileAttr, MetaFlags, Metadata};
use update::UpdateOutcome;

/// Bitset of outstanding reconciliation work for a file (spec §4.7,
/// `original_source/zfsd/update.h`'s `IFH_*` constants).
pub struct IfhFlags(u32);

impl IfhFlags {
    pub const UPDATE: u32 = 1 << 0;
    pub const REINTEGRATE: u32 = 1 << 1;
    pub const METADATA: u32 = 1 << 2;
    /// Already queued on a scheduler thread; set to make `schedule_*`
    /// idempotent (spec §4.8).
    pub const ENQUEUED: u32 = 1 << 3;

    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// Classify what a record needs done by comparing cached metadata against
/// the master's live attributes (spec §4.7 `update_p(vol, dentry, attr)`).
pub fn update_p(meta: &Metadata, attr: &FileAttr) -> IfhFlags {
    let mut bits = 0u32;
    let master_moved = attr.version != meta.master_version;
    if !meta.flags.contains(MetaFlags::COMPLETE) || (master_moved && meta.local_version == meta.master_version) {
        bits |= IfhFlags::UPDATE;
    }
    if (meta.flags.contains(MetaFlags::MODIFIED_TREE) || meta.local_version > meta.master_version) && !master_moved {
        bits |= IfhFlags::REINTEGRATE;
    }
    let size_mismatch = attr.file_type == crate::model::FileType::Regular && attr.size != meta.size;
    if meta.modetype != attr.mode || meta.uid != attr.uid || meta.gid != attr.gid || master_moved || size_mismatch {
        bits |= IfhFlags::METADATA;
    }
    IfhFlags(bits)
}

/// Drive one scheduler-popped `fh` through a full update pass, using
/// whichever master link is registered for its master node (spec §4.7/
/// §4.8). A `fh` whose node has no link registered yet — no transport
/// configured for that peer — is simply dropped; the next `schedule`
/// call re-queues it once a link shows up.
pub async fn run_one(ctx: &crate::Context, fh: crate::model::Fh) {
    let Some(meta) = ctx.metadata.lookup(&fh) else { return };
    if meta.is_tombstoned() || !meta.master_fh.is_defined() {
        return;
    }
    let node = meta.master_fh.sid;
    let Some(link) = ctx.master_links.get(&node).map(|e| e.clone()) else {
        tracing::debug!(node, "no master link registered, dropping update pass");
        return;
    };
    let Some(write_link) = ctx.master_write_links.get(&node).map(|e| e.clone()) else {
        tracing::debug!(node, "no master write link registered, dropping update pass");
        return;
    };

    let local_path = match ctx.metadata.get_local_path_from_metadata(&meta) {
        Ok(path) => path,
        Err(err) => {
            tracing::warn!(?err, ?fh, "could not resolve local path for update");
            return;
        }
    };
    let local = update::DiskLocalFile::new(local_path);
    let link_speed = ctx.connections.peer_speed(node);

    let outcome = update::update_file(&ctx.fh_table, &ctx.metadata, link.as_ref(), write_link.as_ref(), &local, &ctx.slow_link, link_speed, fh).await;
    match outcome {
        Ok(UpdateOutcome::Incomplete) | Ok(UpdateOutcome::Requeued) => {
            ctx.scheduler.schedule(fh, 0, link_speed == crate::conn::LinkSpeed::Fast);
        }
        Ok(UpdateOutcome::Complete) => {}
        Err(err) => {
            tracing::warn!(?err, ?fh, "update pass failed");
            if err.is_transient() {
                ctx.scheduler.schedule(fh, 0, link_speed == crate::conn::LinkSpeed::Fast);
            }
        }
    }
}
