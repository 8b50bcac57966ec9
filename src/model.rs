//! Core data model shared by every component (spec §3).

use std::time::{SystemTime, UNIX_EPOCH};

/// Marker a field is set to when unused; `u32::MAX` per spec §3.
pub const UNDEFINED: u32 = u32::MAX;

/// Global file handle: `(sid, vid, dev, ino, gen)`.
///
/// Equality is componentwise. The "undefined" sentinel has every field
/// equal to `UNDEFINED`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fh {
    pub sid: u32,
    pub vid: u32,
    pub dev: u32,
    pub ino: u32,
    pub gen: u32,
}

impl Fh {
    pub const UNDEFINED: Fh = Fh { sid: UNDEFINED, vid: UNDEFINED, dev: UNDEFINED, ino: UNDEFINED, gen: UNDEFINED };

    pub fn is_defined(&self) -> bool {
        *self != Fh::UNDEFINED
    }
}

impl Default for Fh {
    fn default() -> Self {
        Fh::UNDEFINED
    }
}

/// Capability flags: open mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OpenFlags {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Capability `(fh, flags, verify[16])` (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cap {
    pub fh: Fh,
    pub flags: OpenFlags,
    pub verify: [u8; 16],
}

/// File type discriminant, mirrored from the teacher's `vfs::FileType`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FileType {
    Bad,
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharacterDevice,
    Fifo,
    Socket,
}

/// Full file attributes (spec §3 fattr).
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct FileAttr {
    pub file_type: FileType,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub version: u64,
    pub atime: FileTime,
    pub mtime: FileTime,
    pub ctime: FileTime,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FileTime {
    pub seconds: i64,
    pub nanos: u32,
}

impl FileTime {
    pub fn now() -> Self {
        let dur = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        FileTime { seconds: dur.as_secs() as i64, nanos: dur.subsec_nanos() }
    }
}

/// Bitset of per-metadata-record flags (spec §3).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct MetaFlags(u32);

impl MetaFlags {
    pub const COMPLETE: u32 = 1 << 0;
    pub const UPDATED_TREE: u32 = 1 << 1;
    pub const MODIFIED_TREE: u32 = 1 << 2;
    pub const SHADOW: u32 = 1 << 3;
    pub const SHADOW_TREE: u32 = 1 << 4;

    pub fn empty() -> Self {
        MetaFlags(0)
    }

    pub fn contains(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn insert(&mut self, bit: u32) {
        self.0 |= bit;
    }

    pub fn remove(&mut self, bit: u32) {
        self.0 &= !bit;
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        MetaFlags(bits)
    }
}

/// Maximum inline name length in a metadata record (spec §3).
pub const METADATA_NAME_SIZE: usize = 256;

/// Per-local-FH metadata record (spec §3). `parent_dev`/`parent_ino`/`name`
/// hold the single inlined hardlink, or the [`UNDEFINED`] sentinel when the
/// object has zero or more-than-one hardlink (sidecar file used instead).
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub flags: MetaFlags,
    pub dev: u32,
    pub ino: u32,
    pub gen: u32,
    pub master_fh: Fh,
    pub local_version: u64,
    pub master_version: u64,
    pub modetype: u32,
    pub uid: u32,
    pub gid: u32,
    /// Last locally-observed file size, kept in step with the `updated`/
    /// `modified` trees so `update_p` (spec §4.7) can compare it against
    /// the master's live `attr.size` without a separate stat call.
    pub size: u64,
    pub parent_dev: u32,
    pub parent_ino: u32,
    pub name: String,
}

impl Metadata {
    /// A fresh record for a just-referenced `(dev, ino)`.
    pub fn fresh(dev: u32, ino: u32, is_copy: bool) -> Self {
        Metadata {
            flags: MetaFlags::empty(),
            dev,
            ino,
            gen: 0,
            master_fh: Fh::UNDEFINED,
            local_version: 1,
            master_version: if is_copy { 0 } else { 1 },
            modetype: 0,
            uid: 0,
            gid: 0,
            size: 0,
            parent_dev: UNDEFINED,
            parent_ino: UNDEFINED,
            name: String::new(),
        }
    }

    /// True once the hardlink list is empty and the object is tombstoned
    /// (spec §3 invariant: "Hardlink list is empty ⇔ the object is
    /// tombstoned (mode=0,type=BAD)").
    pub fn is_tombstoned(&self) -> bool {
        self.modetype == 0
    }

    /// Tombstone this record in place: clear type/mode, bump `gen`, drop
    /// version bookkeeping and the master link.
    pub fn tombstone(&mut self) {
        self.modetype = 0;
        self.gen = self.gen.wrapping_add(1);
        self.local_version = 0;
        self.master_version = 0;
        self.master_fh = Fh::UNDEFINED;
        self.size = 0;
        self.parent_dev = UNDEFINED;
        self.parent_ino = UNDEFINED;
        self.name.clear();
        self.flags = MetaFlags::empty();
    }
}

/// One `(parent_dev, parent_ino, name)` hardlink triple (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HardlinkKey {
    pub parent_dev: u32,
    pub parent_ino: u32,
    pub name: String,
}

/// Directory journal entry operator (spec §3).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JournalOper {
    Add,
    Del,
}

/// One pending directory mutation awaiting reintegration (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub local_fh: Fh,
    pub oper: JournalOper,
    pub name: String,
    pub master_fh: Fh,
    pub master_version: u64,
}

/// Locking level held on a dentry (spec §3/§4.4).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LockLevel {
    Unlocked,
    Shared,
    Exclusive,
}
