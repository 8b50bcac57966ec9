//! Interval trees over byte ranges of a file (C2 — spec §3/§4.2).
//!
//! Tracks which byte ranges of a file are "updated" (present locally but
//! not yet known-synced) or "modified" (dirty, awaiting reintegration).
//! Grounded on `original_source/zfsd/interval.h`'s node layout
//! (`start`, `end`, left/right child, subtree `max`); deletions remove
//! and re-merge nodes immediately rather than tombstoning them in place.
//!
//! Persistence follows spec §4.2: a sidecar log of appended `(start,
//! end)` pairs, with a tree-level `deleted`-since-last-rewrite flag
//! forcing a full `.new`-then-rename rewrite instead of a cheap append
//! once a delete or split has happened.

use std::io::{Read, Write};
use std::path::Path;

use crate::error::Result;

/// One half-open byte range `[start, end)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

impl Interval {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Interval { start, end }
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn touches(&self, other: &Interval) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

struct Node {
    interval: Interval,
    max: u64,
    left: Option<Box<Node>>,
    right: Option<Box<Node>>,
}

impl Node {
    fn new(interval: Interval) -> Self {
        let max = interval.end;
        Node { interval, max, left: None, right: None }
    }

    fn recompute_max(&mut self) {
        let mut m = self.interval.end;
        if let Some(l) = &self.left {
            m = m.max(l.max);
        }
        if let Some(r) = &self.right {
            m = m.max(r.max);
        }
        self.max = m;
    }
}

/// An interval tree merging touching/overlapping ranges on insert.
///
/// Merging on insert keeps the tree's size bounded by the number of
/// disjoint covered regions rather than the number of write calls,
/// matching the "coalesce adjacent updates" behaviour implied by spec
/// §4.2 (`update_file_blocks` extends a single covering interval as
/// contiguous blocks arrive).
pub struct IntervalTree {
    root: Option<Box<Node>>,
    count: usize,
    /// Set by [`IntervalTree::delete`] (a delete or split happened since
    /// the last [`IntervalTree::rewrite`]); once set, `append_entry` must
    /// not be used until the next full rewrite (spec §4.2).
    deleted: bool,
}

impl Default for IntervalTree {
    fn default() -> Self {
        IntervalTree::new()
    }
}

impl IntervalTree {
    pub fn new() -> Self {
        IntervalTree { root: None, count: 0, deleted: false }
    }

    /// Whether a delete/split has happened since the last rewrite —
    /// callers must call [`IntervalTree::rewrite`] rather than
    /// [`IntervalTree::append_entry`] while this is set (spec §4.2).
    pub fn needs_rewrite(&self) -> bool {
        self.deleted
    }

    /// Remove `[start, end)` from the tree, splitting any interval that
    /// only partially overlaps it (spec §4.2 `delete(start,end)`).
    pub fn delete(&mut self, start: u64, end: u64) {
        let target = Interval::new(start, end);
        if target.is_empty() {
            return;
        }
        let overlapping = self.collect_overlapping(&target);
        if overlapping.is_empty() {
            return;
        }
        self.deleted = true;
        for iv in overlapping {
            self.remove_exact(iv);
            if iv.start < target.start {
                self.root = Self::insert_node(self.root.take(), Interval::new(iv.start, target.start));
                self.count += 1;
            }
            if iv.end > target.end {
                self.root = Self::insert_node(self.root.take(), Interval::new(target.end, iv.end));
                self.count += 1;
            }
        }
    }

    fn collect_overlapping(&self, target: &Interval) -> Vec<Interval> {
        let mut out = Vec::new();
        Self::collect_overlapping_rec(&self.root, target, &mut out);
        out
    }

    fn collect_overlapping_rec(node: &Option<Box<Node>>, target: &Interval, out: &mut Vec<Interval>) {
        let Some(n) = node else { return };
        if let Some(l) = &n.left {
            if l.max > target.start {
                Self::collect_overlapping_rec(&n.left, target, out);
            }
        }
        if n.interval.overlaps(target) {
            out.push(n.interval);
        }
        if n.interval.start < target.end {
            Self::collect_overlapping_rec(&n.right, target, out);
        }
    }

    /// The interval containing `pos`, if any (spec §4.2 `lookup(pos)`).
    pub fn lookup(&self, pos: u64) -> Option<Interval> {
        let mut node = &self.root;
        while let Some(n) = node {
            if pos >= n.interval.start && pos < n.interval.end {
                return Some(n.interval);
            }
            node = if pos < n.interval.start { &n.left } else { &n.right };
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Insert `interval`, merging with any touching or overlapping
    /// existing intervals so the tree stays in normal form.
    pub fn insert(&mut self, interval: Interval) {
        if interval.is_empty() {
            return;
        }
        let mut merged = interval;
        let overlapping = self.collect_touching(&merged);
        for iv in &overlapping {
            merged.start = merged.start.min(iv.start);
            merged.end = merged.end.max(iv.end);
        }
        for iv in &overlapping {
            self.remove_exact(*iv);
        }
        self.root = Self::insert_node(self.root.take(), merged);
        self.count += 1;
    }

    fn collect_touching(&self, target: &Interval) -> Vec<Interval> {
        let mut out = Vec::new();
        Self::collect_touching_rec(&self.root, target, &mut out);
        out
    }

    fn collect_touching_rec(node: &Option<Box<Node>>, target: &Interval, out: &mut Vec<Interval>) {
        let Some(n) = node else { return };
        if let Some(l) = &n.left {
            if l.max >= target.start {
                Self::collect_touching_rec(&n.left, target, out);
            }
        }
        if n.interval.touches(target) {
            out.push(n.interval);
        }
        if n.interval.start <= target.end {
            Self::collect_touching_rec(&n.right, target, out);
        }
    }

    fn insert_node(node: Option<Box<Node>>, interval: Interval) -> Option<Box<Node>> {
        match node {
            None => Some(Box::new(Node::new(interval))),
            Some(mut n) => {
                if interval.start < n.interval.start {
                    n.left = Self::insert_node(n.left.take(), interval);
                } else {
                    n.right = Self::insert_node(n.right.take(), interval);
                }
                n.recompute_max();
                Some(n)
            }
        }
    }

    /// Remove the node exactly matching `interval` (used internally to
    /// splice out intervals being merged; not a public byte-range delete).
    fn remove_exact(&mut self, interval: Interval) {
        self.root = Self::remove_node(self.root.take(), interval);
        self.count = self.count.saturating_sub(1);
    }

    fn remove_node(node: Option<Box<Node>>, target: Interval) -> Option<Box<Node>> {
        let mut n = node?;
        if n.interval == target {
            return match (n.left.take(), n.right.take()) {
                (None, None) => None,
                (Some(l), None) => Some(l),
                (None, Some(r)) => Some(r),
                (Some(l), Some(r)) => {
                    let (succ, new_r) = Self::take_min(r);
                    let mut replacement = succ;
                    replacement.left = Some(l);
                    replacement.right = new_r;
                    replacement.recompute_max();
                    Some(replacement)
                }
            };
        }
        if target.start < n.interval.start {
            n.left = Self::remove_node(n.left.take(), target);
        } else {
            n.right = Self::remove_node(n.right.take(), target);
        }
        n.recompute_max();
        Some(n)
    }

    fn take_min(node: Box<Node>) -> (Box<Node>, Option<Box<Node>>) {
        let mut n = node;
        match n.left.take() {
            None => (n, n.right.take()),
            Some(l) => {
                let (min, new_left) = Self::take_min(l);
                n.left = new_left;
                n.recompute_max();
                (min, Some(n))
            }
        }
    }

    /// True if `interval` is fully covered by the union of stored ranges.
    pub fn covers(&self, interval: Interval) -> bool {
        let mut cursor = interval.start;
        for iv in self.iter() {
            if iv.start > cursor {
                return false;
            }
            if iv.end > cursor {
                cursor = iv.end;
            }
            if cursor >= interval.end {
                return true;
            }
        }
        cursor >= interval.end
    }

    /// Highest `end` across all stored intervals, or 0 if empty.
    pub fn max_end(&self) -> u64 {
        self.root.as_ref().map_or(0, |n| n.max)
    }

    /// In-order iteration over the disjoint covered intervals.
    pub fn iter(&self) -> impl Iterator<Item = Interval> + '_ {
        let mut out = Vec::with_capacity(self.count);
        Self::inorder(&self.root, &mut out);
        out.into_iter()
    }

    fn inorder(node: &Option<Box<Node>>, out: &mut Vec<Interval>) {
        if let Some(n) = node {
            Self::inorder(&n.left, out);
            out.push(n.interval);
            Self::inorder(&n.right, out);
        }
    }

    /// The gaps in `[0, upto)` not covered by any stored interval —
    /// the complement needed to decide what remains to fetch (spec §4.2).
    pub fn complement(&self, upto: u64) -> Vec<Interval> {
        let mut gaps = Vec::new();
        let mut cursor = 0u64;
        for iv in self.iter() {
            if iv.start > cursor {
                gaps.push(Interval::new(cursor, iv.start.min(upto)));
            }
            cursor = cursor.max(iv.end);
            if cursor >= upto {
                return gaps;
            }
        }
        if cursor < upto {
            gaps.push(Interval::new(cursor, upto));
        }
        gaps
    }

    /// True when a single interval covers `[0, file_size)` exactly —
    /// the `COMPLETE` condition for the updated-tree (spec §3/§4.2).
    pub fn is_complete(&self, file_size: u64) -> bool {
        self.covers(Interval::new(0, file_size))
    }

    pub fn clear(&mut self) {
        self.root = None;
        self.count = 0;
        self.deleted = false;
    }

    /// Append one `(start, end)` pair to an open log file (spec §4.2
    /// `append-to-log(fd,start,end)`). Callers must not append once
    /// [`IntervalTree::needs_rewrite`] is true — do a full `rewrite` first.
    pub fn append_entry<W: Write>(writer: &mut W, interval: Interval) -> Result<()> {
        let mut buf = [0u8; 16];
        buf[0..8].copy_from_slice(&interval.start.to_le_bytes());
        buf[8..16].copy_from_slice(&interval.end.to_le_bytes());
        writer.write_all(&buf)?;
        Ok(())
    }

    /// Read up to `n` `(start, end)` pairs off an already-positioned log
    /// file, merging them into a fresh tree the way replaying append log
    /// entries at startup must (spec §4.2 `read-from-log(fd,n)`).
    pub fn read_from_log<R: Read>(reader: &mut R, n: usize) -> Result<Self> {
        let mut tree = IntervalTree::new();
        let mut buf = [0u8; 16];
        for _ in 0..n {
            if reader.read_exact(&mut buf).is_err() {
                break;
            }
            let start = u64::from_le_bytes(buf[0..8].try_into().unwrap());
            let end = u64::from_le_bytes(buf[8..16].try_into().unwrap());
            tree.insert(Interval::new(start, end));
        }
        tree.deleted = false;
        Ok(tree)
    }

    /// Write every disjoint interval to `path` via a `.new` temp file
    /// then an atomic rename, clearing [`IntervalTree::needs_rewrite`]
    /// (spec §4.2 `rewrite(fd)` — "once set, callers MUST rewrite rather
    /// than append").
    pub fn rewrite(&mut self, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("new");
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            for iv in self.iter() {
                Self::append_entry(&mut file, iv)?;
            }
            file.flush()?;
        }
        std::fs::rename(&tmp_path, path)?;
        self.deleted = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserts_merge_touching_ranges() {
        let mut t = IntervalTree::new();
        t.insert(Interval::new(0, 10));
        t.insert(Interval::new(10, 20));
        let all: Vec<_> = t.iter().collect();
        assert_eq!(all, vec![Interval::new(0, 20)]);
    }

    #[test]
    fn inserts_merge_overlapping_ranges() {
        let mut t = IntervalTree::new();
        t.insert(Interval::new(5, 15));
        t.insert(Interval::new(0, 8));
        let all: Vec<_> = t.iter().collect();
        assert_eq!(all, vec![Interval::new(0, 15)]);
    }

    #[test]
    fn disjoint_ranges_stay_separate() {
        let mut t = IntervalTree::new();
        t.insert(Interval::new(0, 5));
        t.insert(Interval::new(10, 15));
        let all: Vec<_> = t.iter().collect();
        assert_eq!(all, vec![Interval::new(0, 5), Interval::new(10, 15)]);
    }

    #[test]
    fn covers_and_complement() {
        let mut t = IntervalTree::new();
        t.insert(Interval::new(0, 5));
        t.insert(Interval::new(8, 10));
        assert!(!t.covers(Interval::new(0, 10)));
        assert_eq!(t.complement(10), vec![Interval::new(5, 8)]);
        assert!(!t.is_complete(10));
        t.insert(Interval::new(5, 8));
        assert!(t.is_complete(10));
    }

    #[test]
    fn max_end_tracks_subtree() {
        let mut t = IntervalTree::new();
        t.insert(Interval::new(20, 30));
        t.insert(Interval::new(0, 5));
        assert_eq!(t.max_end(), 30);
    }

    #[test]
    fn delete_splits_an_overlapping_interval() {
        let mut t = IntervalTree::new();
        t.insert(Interval::new(0, 20));
        t.delete(5, 10);
        let all: Vec<_> = t.iter().collect();
        assert_eq!(all, vec![Interval::new(0, 5), Interval::new(10, 20)]);
        assert!(t.needs_rewrite());
    }

    #[test]
    fn delete_then_reinsert_restores_state() {
        let mut t = IntervalTree::new();
        t.insert(Interval::new(0, 20));
        t.delete(5, 10);
        t.insert(Interval::new(5, 10));
        let all: Vec<_> = t.iter().collect();
        assert_eq!(all, vec![Interval::new(0, 20)]);
    }

    #[test]
    fn lookup_finds_containing_interval() {
        let mut t = IntervalTree::new();
        t.insert(Interval::new(0, 5));
        t.insert(Interval::new(10, 15));
        assert_eq!(t.lookup(12), Some(Interval::new(10, 15)));
        assert_eq!(t.lookup(7), None);
    }

    #[test]
    fn log_round_trips_through_a_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.updated");

        let mut t = IntervalTree::new();
        t.insert(Interval::new(0, 5));
        t.insert(Interval::new(100, 200));
        t.rewrite(&path).unwrap();
        assert!(!t.needs_rewrite());

        let mut file = std::fs::File::open(&path).unwrap();
        let reloaded = IntervalTree::read_from_log(&mut file, 2).unwrap();
        assert_eq!(reloaded.iter().collect::<Vec<_>>(), t.iter().collect::<Vec<_>>());
    }

    #[test]
    fn append_entry_extends_an_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.modified");
        {
            let mut file = std::fs::File::create(&path).unwrap();
            IntervalTree::append_entry(&mut file, Interval::new(0, 5)).unwrap();
        }
        {
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            IntervalTree::append_entry(&mut file, Interval::new(10, 15)).unwrap();
        }
        let mut file = std::fs::File::open(&path).unwrap();
        let tree = IntervalTree::read_from_log(&mut file, 2).unwrap();
        assert_eq!(tree.iter().collect::<Vec<_>>(), vec![Interval::new(0, 5), Interval::new(10, 15)]);
    }
}
