//! Local filesystem backend trait (spec §1/§6).
//!
//! The reconciliation engine never touches local storage directly; it
//! calls through this trait, the same seam the teacher puts between
//! `nfsv3.rs`'s procedure handlers and its `vfs::Vfs` trait so a backend
//! (real disk, shadow/passthrough, or an in-memory test double) can be
//! swapped without touching protocol or reconciliation code.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Fh, FileAttr};

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub fh: Fh,
    pub file_type: crate::model::FileType,
}

/// Local backend operations the reconciliation engine and RPC dispatcher
/// need serviced, independent of any particular on-disk layout.
#[async_trait]
pub trait LocalVfs: Send + Sync {
    async fn get_attr(&self, fh: Fh) -> Result<FileAttr>;
    async fn set_attr(&self, fh: Fh, attr: FileAttr) -> Result<FileAttr>;
    async fn lookup(&self, parent: Fh, name: &str) -> Result<Fh>;
    async fn read(&self, fh: Fh, offset: u64, len: u32) -> Result<Vec<u8>>;
    async fn write(&self, fh: Fh, offset: u64, data: &[u8]) -> Result<u32>;
    async fn create(&self, parent: Fh, name: &str, mode: u32) -> Result<Fh>;
    async fn make_dir(&self, parent: Fh, name: &str, mode: u32) -> Result<Fh>;
    async fn remove(&self, parent: Fh, name: &str) -> Result<()>;
    async fn remove_dir(&self, parent: Fh, name: &str) -> Result<()>;
    async fn rename(&self, old_parent: Fh, old_name: &str, new_parent: Fh, new_name: &str) -> Result<()>;
    async fn link(&self, fh: Fh, new_parent: Fh, new_name: &str) -> Result<()>;
    async fn read_dir(&self, fh: Fh) -> Result<Vec<DirEntry>>;
    async fn read_link(&self, fh: Fh) -> Result<String>;
    async fn symlink(&self, parent: Fh, name: &str, target: &str) -> Result<Fh>;
}
