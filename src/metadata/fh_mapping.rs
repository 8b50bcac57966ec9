//! Local-FH ↔ master-FH mapping (spec §3/§4.3).
//!
//! A local object's FH is stable across reconnects to different masters,
//! so the engine keeps a separate bidirectional map rather than reusing
//! `Metadata::master_fh` alone — the reverse direction (master FH seen on
//! the wire → local FH to dispatch against) is looked up far more often
//! than the forward one, so it gets its own `dashmap` index.

use dashmap::DashMap;

use crate::model::Fh;

#[derive(Default)]
pub struct FhMapping {
    local_to_master: DashMap<Fh, Fh>,
    master_to_local: DashMap<Fh, Fh>,
}

impl FhMapping {
    pub fn new() -> Self {
        FhMapping { local_to_master: DashMap::new(), master_to_local: DashMap::new() }
    }

    pub fn insert(&self, local: Fh, master: Fh) {
        if let Some(old_master) = self.local_to_master.insert(local, master) {
            if old_master != master {
                self.master_to_local.remove(&old_master);
            }
        }
        self.master_to_local.insert(master, local);
    }

    pub fn local_to_master(&self, local: &Fh) -> Option<Fh> {
        self.local_to_master.get(local).map(|v| *v)
    }

    pub fn master_to_local(&self, master: &Fh) -> Option<Fh> {
        self.master_to_local.get(master).map(|v| *v)
    }

    pub fn remove_local(&self, local: &Fh) {
        if let Some((_, master)) = self.local_to_master.remove(local) {
            self.master_to_local.remove(&master);
        }
    }
}
