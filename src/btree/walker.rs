//! Depth-first B+-tree traversal over a page source (component C5).
//!
//! Keys are front-coded: on a `COMMON_KEY` page, every cell after the first stores only
//! the bytes that differ from that page's own first reconstructed key (`common_key_size`
//! bytes are shared with it) — the prefix source is constant across the whole page, not
//! the immediately preceding cell. The first cell's own prefix source is whatever key
//! context the traversal arrived with (the branch separator key that led here), which is
//! threaded as `current_key` across page boundaries so the very first cell on a page can
//! still share a prefix with it.

use std::collections::HashSet;
use std::sync::Arc;

use super::cell::{self, BranchCell, LeafCell};
use crate::page::{Page, PageFlags, PageNum};

/// Maximum path depth before a cycle is assumed. ESE trees are shallow (a handful of
/// levels even for multi-gigabyte databases); anything deeper than this points at
/// corrupt or maliciously crafted page links.
const MAX_DEPTH: usize = 64;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Page(#[from] crate::page::Error),
    #[error(transparent)]
    Cell(#[from] cell::Error),
    #[error("B-tree traversal revisited page {0}, which indicates a cycle.")]
    Cycle(PageNum),
    #[error("B-tree traversal exceeded the maximum supported depth ({MAX_DEPTH}).")]
    TooDeep,
    #[error("Page {0} is empty and has no root metadata cell to descend from.")]
    EmptyRoot(PageNum),
    #[error("Page {0} is not a root page; it cannot anchor a tree traversal.")]
    NotARoot(PageNum),
    #[error("Traversal was cancelled.")]
    Cancelled,
}

/// Supplies pages by number, backed by whatever page cache the caller maintains.
/// Implemented by `crate::db::File` in the public façade; decoupled here so the walker
/// can be exercised against an in-memory fixture in tests.
pub trait PageSource {
    fn fetch(&self, page_number: PageNum) -> Result<Arc<Page>, crate::page::Error>;
}

/// Receives (key, value) pairs during a full or seeked traversal. Returning `false`
/// from `visit` stops the walk early without it being an error.
pub trait Visitor {
    fn visit(&mut self, key: &[u8], value: &[u8]) -> bool;
}

/// A single decoded entry in a branch page, with its fully reconstructed key.
struct ReconstructedBranch {
    key: Vec<u8>,
    child_page: PageNum,
}

fn reconstruct_branch_cells(page: &Page, current_key: &mut Vec<u8>) -> Result<Vec<ReconstructedBranch>, Error> {
    let has_common_key = page.header.flags.contains(PageFlags::COMMON_KEY);
    let mut out = Vec::with_capacity(page.cell_count());
    let mut page_key: Option<Vec<u8>> = None;
    for i in 0..page.cell_count() {
        let tag_idx = page.cell_tag_index(i);
        let bytes = page.tag_bytes(tag_idx)?;
        let BranchCell { common_key_size, local_key, child_page } = cell::decode_branch(bytes, has_common_key)?;
        let prefix_source = page_key.as_deref().unwrap_or(current_key.as_slice());
        let full_key = cell::reconstruct_key(prefix_source, common_key_size, &local_key);
        if i == 0 {
            page_key = Some(full_key.clone());
        }
        *current_key = full_key.clone();
        out.push(ReconstructedBranch { key: full_key, child_page });
    }
    Ok(out)
}

fn reconstruct_leaf_cells(page: &Page, current_key: &mut Vec<u8>) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
    let has_common_key = page.header.flags.contains(PageFlags::COMMON_KEY);
    let mut out = Vec::with_capacity(page.cell_count());
    let mut page_key: Option<Vec<u8>> = None;
    for i in 0..page.cell_count() {
        let tag_idx = page.cell_tag_index(i);
        let bytes = page.tag_bytes(tag_idx)?;
        let LeafCell { common_key_size, local_key, value } = cell::decode_leaf(bytes, has_common_key)?;
        let prefix_source = page_key.as_deref().unwrap_or(current_key.as_slice());
        let full_key = cell::reconstruct_key(prefix_source, common_key_size, &local_key);
        if i == 0 {
            page_key = Some(full_key.clone());
        }
        *current_key = full_key.clone();
        out.push((full_key, value));
    }
    Ok(out)
}

/// Drives traversal of one B+-tree rooted at a given page, against a `PageSource`.
pub struct TreeWalker<'a> {
    source: &'a dyn PageSource,
    root: PageNum,
    cancel: Option<&'a dyn Fn() -> bool>,
}

impl<'a> TreeWalker<'a> {
    pub fn new(source: &'a dyn PageSource, root: PageNum) -> Self {
        TreeWalker { source, root, cancel: None }
    }

    pub fn with_cancellation(mut self, cancel: &'a dyn Fn() -> bool) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn check_cancelled(&self) -> Result<(), Error> {
        if let Some(f) = self.cancel {
            if f() {
                log::debug!("traversal of root page {} cancelled", self.root);
                return Err(Error::Cancelled);
            }
        }
        Ok(())
    }

    /// Visits every (key, value) pair in the tree in key order via a full depth-first
    /// descent. Stops early, without error, if `visitor.visit` returns `false`.
    pub fn walk_all(&self, visitor: &mut dyn Visitor) -> Result<(), Error> {
        self.check_root()?;
        let mut current_key = Vec::new();
        let mut visiting = HashSet::new();
        self.walk_page(self.root, 0, &mut current_key, &mut visiting, visitor)
    }

    fn check_root(&self) -> Result<(), Error> {
        let root_page = self.source.fetch(self.root)?;
        if !root_page.header.is_root() {
            return Err(Error::NotARoot(self.root));
        }
        Ok(())
    }

    fn walk_page(
        &self,
        page_number: PageNum,
        depth: usize,
        current_key: &mut Vec<u8>,
        visiting: &mut HashSet<PageNum>,
        visitor: &mut dyn Visitor,
    ) -> Result<(), Error> {
        self.check_cancelled()?;
        if depth > MAX_DEPTH {
            return Err(Error::TooDeep);
        }
        if !visiting.insert(page_number) {
            log::warn!("page {page_number}: revisited mid-traversal, treating as a cycle");
            return Err(Error::Cycle(page_number));
        }

        let page = self.source.fetch(page_number)?;
        if page.header.is_branch() {
            let branches = reconstruct_branch_cells(&page, current_key)?;
            for b in branches {
                self.check_cancelled()?;
                self.walk_page(b.child_page, depth + 1, current_key, visiting, visitor)?;
            }
        } else if page.header.is_leaf() {
            let leaves = reconstruct_leaf_cells(&page, current_key)?;
            for (key, value) in leaves {
                if !visitor.visit(&key, &value) {
                    visiting.remove(&page_number);
                    return Ok(());
                }
            }
        } else {
            // Space-tree, long-value, or other non-record pages carry no record cells
            // to visit; callers that need those walk them with a dedicated reader.
        }

        visiting.remove(&page_number);
        Ok(())
    }

    /// Locates the leaf page and reconstructed key nearest `target` (the least key
    /// greater than or equal to it), descending branch pages via binary search over
    /// their fully reconstructed keys. Returns `None` if the tree has no key `>= target`.
    pub fn seek(&self, target: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, Error> {
        self.check_root()?;
        let mut current_key = Vec::new();
        let mut visiting = HashSet::new();
        let mut page_number = self.root;
        let mut depth = 0;

        loop {
            self.check_cancelled()?;
            if depth > MAX_DEPTH {
                return Err(Error::TooDeep);
            }
            if !visiting.insert(page_number) {
                return Err(Error::Cycle(page_number));
            }
            let page = self.source.fetch(page_number)?;

            if page.header.is_branch() {
                let branches = reconstruct_branch_cells(&page, &mut current_key)?;
                if branches.is_empty() {
                    return Err(Error::EmptyRoot(page_number));
                }
                let idx = match branches.binary_search_by(|b| b.key.as_slice().cmp(target)) {
                    Ok(i) => i,
                    Err(i) => i.min(branches.len() - 1),
                };
                page_number = branches[idx].child_page;
                current_key = branches[idx].key.clone();
                depth += 1;
                continue;
            }

            if page.header.is_leaf() {
                let leaves = reconstruct_leaf_cells(&page, &mut current_key)?;
                let found = leaves.into_iter().find(|(k, _)| k.as_slice() >= target);
                if let Some(pair) = found {
                    return Ok(Some(pair));
                }
                // Not on this leaf: best-effort follow the forward sibling link rather
                // than treating a missing/cyclical link as fatal.
                if page.header.next_page == 0 || page.header.next_page == page_number {
                    return Ok(None);
                }
                page_number = page.header.next_page;
                depth += 1;
                continue;
            }

            return Err(Error::EmptyRoot(page_number));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Revision;
    use crate::page;
    use std::cell::RefCell;
    use std::collections::HashMap;

    fn leaf_cell_bytes(common: Option<u16>, local_key: &[u8], value: &[u8]) -> Vec<u8> {
        let mut b = Vec::new();
        if let Some(c) = common {
            b.extend_from_slice(&c.to_le_bytes());
        }
        b.extend_from_slice(&(local_key.len() as u16).to_le_bytes());
        b.extend_from_slice(local_key);
        b.extend_from_slice(value);
        b
    }

    fn branch_cell_bytes(common: Option<u16>, local_key: &[u8], child: PageNum) -> Vec<u8> {
        let mut b = Vec::new();
        if let Some(c) = common {
            b.extend_from_slice(&c.to_le_bytes());
        }
        b.extend_from_slice(&(local_key.len() as u16).to_le_bytes());
        b.extend_from_slice(local_key);
        b.extend_from_slice(&child.to_le_bytes());
        b
    }

    fn build_page(page_size: u32, number: PageNum, flags: page::PageFlags, next_page: PageNum, tag_payloads: &[&[u8]]) -> Vec<u8> {
        let mut buf = vec![0u8; page_size as usize];
        let mut cursor = 40usize;
        let mut tags = Vec::new();
        for p in tag_payloads {
            buf[cursor..cursor + p.len()].copy_from_slice(p);
            tags.push((cursor as u16, p.len() as u16));
            cursor += p.len();
        }
        buf[16..20].copy_from_slice(&0u32.to_le_bytes()); // previous_page
        buf[20..24].copy_from_slice(&next_page.to_le_bytes());
        buf[28..30].copy_from_slice(&(cursor as u16).to_le_bytes());
        buf[32..34].copy_from_slice(&(cursor as u16).to_le_bytes());
        buf[34..36].copy_from_slice(&(tags.len() as u16).to_le_bytes());
        buf[36..40].copy_from_slice(&flags.bits().to_le_bytes());

        let tag_area_start = page_size as usize - tags.len() * 4;
        for (i, (off, size)) in tags.iter().enumerate() {
            let rec_off = tag_area_start + (tags.len() - 1 - i) * 4;
            buf[rec_off..rec_off + 2].copy_from_slice(&size.to_le_bytes());
            buf[rec_off + 2..rec_off + 4].copy_from_slice(&off.to_le_bytes());
        }
        let sum = {
            let mut acc: u32 = 0x89ab_cdef;
            for w in buf[4..].chunks_exact(4) {
                acc ^= u32::from_le_bytes([w[0], w[1], w[2], w[3]]);
            }
            acc
        };
        buf[0..4].copy_from_slice(&sum.to_le_bytes());
        buf[0..4].copy_from_slice(&sum.to_le_bytes());
        let _ = number;
        buf
    }

    struct FakeSource {
        pages: RefCell<HashMap<PageNum, Vec<u8>>>,
        page_size: u32,
    }

    impl PageSource for FakeSource {
        fn fetch(&self, page_number: PageNum) -> Result<Arc<Page>, page::Error> {
            let buf = self
                .pages
                .borrow()
                .get(&page_number)
                .cloned()
                .ok_or(page::Error::Truncated(page_number))?;
            let page = page::decode(buf, page_number, self.page_size, Revision::Legacy)?;
            Ok(Arc::new(page))
        }
    }

    struct CollectVisitor {
        out: Vec<(Vec<u8>, Vec<u8>)>,
    }
    impl Visitor for CollectVisitor {
        fn visit(&mut self, key: &[u8], value: &[u8]) -> bool {
            self.out.push((key.to_vec(), value.to_vec()));
            true
        }
    }

    #[test]
    fn test_walk_single_leaf_front_coded() {
        // Two cells: "foo" with no shared prefix, then "foobar" sharing the 3-byte
        // prefix "foo" with the previous key. Tag 0 is the root metadata slot.
        let root_meta = b"root-meta".as_slice();
        let c1 = leaf_cell_bytes(Some(0), b"foo", b"v1");
        let c2 = leaf_cell_bytes(Some(3), b"bar", b"v2");
        let buf = build_page(
            4096,
            5,
            page::PageFlags::LEAF | page::PageFlags::ROOT | page::PageFlags::COMMON_KEY,
            0,
            &[root_meta, &c1, &c2],
        );
        let mut pages = HashMap::new();
        pages.insert(5, buf);
        let source = FakeSource { pages: RefCell::new(pages), page_size: 4096 };

        let walker = TreeWalker::new(&source, 5);
        let mut visitor = CollectVisitor { out: Vec::new() };
        walker.walk_all(&mut visitor).unwrap();

        assert_eq!(visitor.out.len(), 2);
        assert_eq!(visitor.out[0].0, b"foo");
        assert_eq!(visitor.out[1].0, b"foobar");
        assert_eq!(visitor.out[1].1, b"v2");
    }

    #[test]
    fn test_walk_branch_then_leaf() {
        let leaf_cell = leaf_cell_bytes(Some(0), b"key1", b"val1");
        let leaf_buf = build_page(4096, 10, page::PageFlags::LEAF, 0, &[&leaf_cell]);

        // Tag 0 on a root page is reserved for root metadata, not a cell — see
        // `Page::cell_count`. Real root pages always carry it regardless of whether
        // the page is a branch or a leaf.
        let root_meta = b"root-meta".as_slice();
        let branch_cell = branch_cell_bytes(Some(0), b"", 10);
        let branch_buf = build_page(4096, 1, page::PageFlags::PARENT | page::PageFlags::ROOT, 0, &[root_meta, &branch_cell]);

        let mut pages = HashMap::new();
        pages.insert(1, branch_buf);
        pages.insert(10, leaf_buf);
        let source = FakeSource { pages: RefCell::new(pages), page_size: 4096 };

        let walker = TreeWalker::new(&source, 1);
        let mut visitor = CollectVisitor { out: Vec::new() };
        walker.walk_all(&mut visitor).unwrap();

        assert_eq!(visitor.out.len(), 1);
        assert_eq!(visitor.out[0].0, b"key1");
        assert_eq!(visitor.out[0].1, b"val1");
    }

    #[test]
    fn test_cycle_detection() {
        // A branch page whose single cell points back at itself. Tag 0 is the root
        // metadata slot, as on any root page.
        let root_meta = b"root-meta".as_slice();
        let branch_cell = branch_cell_bytes(Some(0), b"", 1);
        let branch_buf = build_page(4096, 1, page::PageFlags::PARENT | page::PageFlags::ROOT, 0, &[root_meta, &branch_cell]);
        let mut pages = HashMap::new();
        pages.insert(1, branch_buf);
        let source = FakeSource { pages: RefCell::new(pages), page_size: 4096 };

        let walker = TreeWalker::new(&source, 1);
        let mut visitor = CollectVisitor { out: Vec::new() };
        let err = walker.walk_all(&mut visitor).unwrap_err();
        assert!(matches!(err, Error::Cycle(1)));
    }

    #[test]
    fn test_walk_all_rejects_non_root_page() {
        let c1 = leaf_cell_bytes(Some(0), b"foo", b"v1");
        let buf = build_page(4096, 5, page::PageFlags::LEAF, 0, &[&c1]);
        let mut pages = HashMap::new();
        pages.insert(5, buf);
        let source = FakeSource { pages: RefCell::new(pages), page_size: 4096 };

        let walker = TreeWalker::new(&source, 5);
        let mut visitor = CollectVisitor { out: Vec::new() };
        let err = walker.walk_all(&mut visitor).unwrap_err();
        assert!(matches!(err, Error::NotARoot(5)));
    }

    #[test]
    fn test_cancellation_is_observed() {
        let root_meta = b"root-meta".as_slice();
        let c1 = leaf_cell_bytes(Some(0), b"foo", b"v1");
        let buf = build_page(4096, 5, page::PageFlags::LEAF | page::PageFlags::ROOT, 0, &[root_meta, &c1]);
        let mut pages = HashMap::new();
        pages.insert(5, buf);
        let source = FakeSource { pages: RefCell::new(pages), page_size: 4096 };

        let cancelled = || true;
        let walker = TreeWalker::new(&source, 5).with_cancellation(&cancelled);
        let mut visitor = CollectVisitor { out: Vec::new() };
        let err = walker.walk_all(&mut visitor).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_seek_finds_first_key_greater_or_equal() {
        let root_meta = b"root-meta".as_slice();
        let c1 = leaf_cell_bytes(Some(0), b"apple", b"1");
        let c2 = leaf_cell_bytes(Some(0), b"banana", b"2");
        let c3 = leaf_cell_bytes(Some(0), b"cherry", b"3");
        let buf = build_page(4096, 5, page::PageFlags::LEAF | page::PageFlags::ROOT, 0, &[root_meta, &c1, &c2, &c3]);
        let mut pages = HashMap::new();
        pages.insert(5, buf);
        let source = FakeSource { pages: RefCell::new(pages), page_size: 4096 };

        let walker = TreeWalker::new(&source, 5);
        let (key, value) = walker.seek(b"banana").unwrap().unwrap();
        assert_eq!(key, b"banana");
        assert_eq!(value, b"2");

        let (key, _) = walker.seek(b"b").unwrap().unwrap();
        assert_eq!(key, b"banana");

        assert!(walker.seek(b"zzz").unwrap().is_none());
    }
}
