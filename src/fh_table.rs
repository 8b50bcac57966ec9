//! File-handle and capability table (C4 — spec §3/§4.4).
//!
//! Tracks, per local [`Fh`], the dentry lock state (unlocked/shared/
//! exclusive) and the outstanding [`Cap`] capabilities issued against it.
//! Built on `dashmap` plus `tokio::sync::RwLock`, generalising the
//! teacher's per-connection handle map (`vfs_task.rs`'s `DashMap<Fh, ...>`
//! idiom) from "one NFS filehandle → one open file" to "one local FH →
//! shared/exclusive dentry lock + reference-counted capabilities".

use dashmap::DashMap;
use rand::RngCore;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use std::sync::Arc;

use crate::error::{ReconcileError, Result};
use crate::metadata::MetadataStore;
use crate::model::{Cap, Fh, LockLevel, OpenFlags};

struct Dentry {
    lock: Arc<RwLock<()>>,
    caps: DashMap<[u8; 16], (Cap, u32)>,
}

impl Dentry {
    fn new() -> Self {
        Dentry { lock: Arc::new(RwLock::new(())), caps: DashMap::new() }
    }
}

/// A held dentry lock; dropping it releases the lock.
pub enum DentryGuard {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

impl DentryGuard {
    pub fn level(&self) -> LockLevel {
        match self {
            DentryGuard::Shared(_) => LockLevel::Shared,
            DentryGuard::Exclusive(_) => LockLevel::Exclusive,
        }
    }
}

/// Table of dentries and their capabilities, one per volume.
pub struct FhTable {
    dentries: DashMap<Fh, Arc<Dentry>>,
}

impl Default for FhTable {
    fn default() -> Self {
        FhTable::new()
    }
}

impl FhTable {
    pub fn new() -> Self {
        FhTable { dentries: DashMap::new() }
    }

    fn dentry(&self, fh: &Fh) -> Arc<Dentry> {
        self.dentries.entry(*fh).or_insert_with(|| Arc::new(Dentry::new())).clone()
    }

    /// Acquire a shared (read) lock on `fh`'s dentry (spec §4.4 lookup path).
    pub async fn lock_shared(&self, fh: &Fh) -> DentryGuard {
        let dentry = self.dentry(fh);
        let guard = dentry.lock.clone().read_owned().await;
        DentryGuard::Shared(guard)
    }

    /// Acquire an exclusive (write) lock on `fh`'s dentry (spec §4.4
    /// mutation path — create/remove/rename/etc).
    pub async fn lock_exclusive(&self, fh: &Fh) -> DentryGuard {
        let dentry = self.dentry(fh);
        let guard = dentry.lock.clone().write_owned().await;
        DentryGuard::Exclusive(guard)
    }

    /// Issue a new capability for `fh`/`flags`, generating a fresh random
    /// `verify` token (spec §3 `Cap`). Reference-counts identical
    /// `(fh, flags, verify)` triples so repeated opens from the same
    /// caller don't leak slots.
    pub fn get_capability(&self, fh: Fh, flags: OpenFlags) -> Cap {
        let dentry = self.dentry(&fh);
        let mut verify = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut verify);
        let cap = Cap { fh, flags, verify };
        dentry.caps.insert(verify, (cap.clone(), 1));
        cap
    }

    /// Drop one reference to a capability; the slot is freed once the
    /// count reaches zero.
    pub fn put_capability(&self, cap: &Cap) -> Result<()> {
        let dentry = self.dentry(&cap.fh);
        let mut remove = false;
        if let Some(mut entry) = dentry.caps.get_mut(&cap.verify) {
            entry.1 = entry.1.saturating_sub(1);
            remove = entry.1 == 0;
        } else {
            return Err(ReconcileError::Stale);
        }
        if remove {
            dentry.caps.remove(&cap.verify);
        }
        Ok(())
    }

    /// Validate that `cap` is still live and that its `fh` generation
    /// still matches the live metadata record — a capability issued
    /// against a since-unlinked-and-recreated `(dev, ino)` must fail even
    /// though its `verify` token is still sitting in the map (spec §3/§8
    /// capability-generation invariant).
    pub fn verify_capability(&self, cap: &Cap, metadata: &MetadataStore) -> Result<()> {
        let dentry = self.dentry(&cap.fh);
        if !dentry.caps.contains_key(&cap.verify) {
            return Err(ReconcileError::Stale);
        }
        let meta = metadata.lookup(&cap.fh).ok_or(ReconcileError::Stale)?;
        if meta.gen != cap.fh.gen {
            return Err(ReconcileError::Stale);
        }
        Ok(())
    }

    /// Drop all state for `fh`, e.g. once its metadata record is tombstoned.
    pub fn forget(&self, fh: &Fh) {
        self.dentries.remove(fh);
    }
}
