//! Long-value (LV) resolution (component C8).
//!
//! Keys in an LV tree are 8 bytes: a 4-byte long-value id followed by a 4-byte
//! segment number. Segment 0 holds a header declaring the total size (and a
//! compression flag); segments 1.. hold the payload, concatenated in order.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::Cursor;

use crate::btree::{PageSource, TreeWalker, Visitor};
use crate::compress;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Walk(#[from] crate::btree::walker::Error),
    #[error("Long value {0} has no header record in its LV tree.")]
    LongValueMissing(u32),
    #[error("Long value {0} ended after {1} bytes; header declared {2}.")]
    LongValueShort(u32, usize, u64),
    #[error("Long value {0}'s reassembled size ({1}) does not match its header ({2}).")]
    LongValueSizeMismatch(u32, usize, u64),
    #[error(transparent)]
    Decompress(#[from] compress::Error),
}

/// Long-value keys are stored big-endian (ESE orders LV keys so a plain byte
/// comparison sorts by id then segment, matching the tree's b-tree collation).
fn lv_key(lvid: u32, segment: u32) -> [u8; 8] {
    let mut key = [0u8; 8];
    key[0..4].copy_from_slice(&lvid.to_be_bytes());
    key[4..8].copy_from_slice(&segment.to_be_bytes());
    key
}

fn key_matches(found: &[u8], lvid: u32, segment: u32) -> bool {
    found == lv_key(lvid, segment)
}

/// Reassembles the byte stream for `lvid` from the LV tree rooted at `root_page`.
/// Whether to decompress is read from the header record's trailing flag byte (the
/// byte immediately after the 8-byte total-size field), not passed by the caller: the
/// LV tree is the sole owner of that bit, per the format's header-record layout.
pub fn resolve(source: &dyn PageSource, root_page: crate::page::PageNum, lvid: u32) -> Result<Vec<u8>, Error> {
    let walker = TreeWalker::new(source, root_page);

    let header_key = lv_key(lvid, 0);
    let (found_key, header_value) = walker.seek(&header_key)?.ok_or(Error::LongValueMissing(lvid))?;
    if !key_matches(&found_key, lvid, 0) {
        return Err(Error::LongValueMissing(lvid));
    }
    let total_size = Cursor::new(&header_value[..]).read_u64::<BigEndian>().unwrap_or(header_value.len() as u64);
    let compressed = header_value.get(8).map(|b| b & 0x1 != 0).unwrap_or(false);

    let mut assembled = Vec::with_capacity(total_size as usize);
    let mut segment = 1u32;
    loop {
        let seek_key = lv_key(lvid, segment);
        let next = walker.seek(&seek_key)?;
        match next {
            Some((k, v)) if key_matches(&k, lvid, segment) => {
                assembled.extend_from_slice(&v);
                segment += 1;
                if assembled.len() as u64 >= total_size {
                    break;
                }
            }
            _ => break,
        }
    }

    if (assembled.len() as u64) < total_size {
        return Err(Error::LongValueShort(lvid, assembled.len(), total_size));
    }
    assembled.truncate(total_size as usize);

    if compressed {
        return Ok(compress::decompress(&assembled)?);
    }
    Ok(assembled)
}

/// Collects every `(lvid, segment, value)` triple in an LV tree; used by the catalog
/// loader's consistency checks and by tests, not by the hot resolution path.
pub struct CollectAll {
    pub out: Vec<(u32, u32, Vec<u8>)>,
}

impl Visitor for CollectAll {
    fn visit(&mut self, key: &[u8], value: &[u8]) -> bool {
        if key.len() == 8 {
            let lvid = u32::from_be_bytes([key[0], key[1], key[2], key[3]]);
            let segment = u32::from_be_bytes([key[4], key[5], key[6], key[7]]);
            self.out.push((lvid, segment, value.to_vec()));
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Revision;
    use crate::page::{self, PageFlags, PageNum};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn leaf_cell(local_key: &[u8], value: &[u8]) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&(local_key.len() as u16).to_le_bytes());
        b.extend_from_slice(local_key);
        b.extend_from_slice(value);
        b
    }

    fn build_leaf_page(page_size: u32, tag_payloads: &[&[u8]]) -> Vec<u8> {
        let mut buf = vec![0u8; page_size as usize];
        let mut cursor = 40usize;
        let mut tags = Vec::new();
        let root_meta = b"root-meta".as_slice();
        for p in std::iter::once(&root_meta).chain(tag_payloads) {
            buf[cursor..cursor + p.len()].copy_from_slice(p);
            tags.push((cursor as u16, p.len() as u16));
            cursor += p.len();
        }
        buf[28..30].copy_from_slice(&(cursor as u16).to_le_bytes());
        buf[32..34].copy_from_slice(&(cursor as u16).to_le_bytes());
        buf[34..36].copy_from_slice(&(tags.len() as u16).to_le_bytes());
        buf[36..40].copy_from_slice(&(PageFlags::LEAF | PageFlags::ROOT).bits().to_le_bytes());
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
        buf
    }

    struct FakeSource {
        pages: RefCell<HashMap<PageNum, Vec<u8>>>,
        page_size: u32,
    }

    impl PageSource for FakeSource {
        fn fetch(&self, page_number: PageNum) -> Result<Arc<page::Page>, page::Error> {
            let buf = self.pages.borrow().get(&page_number).cloned().ok_or(page::Error::Truncated(page_number))?;
            Ok(Arc::new(page::decode(buf, page_number, self.page_size, Revision::Legacy)?))
        }
    }

    #[test]
    fn test_resolve_reassembles_segments_in_order() {
        let lvid = 7u32;
        let header_key = lv_key(lvid, 0);
        let seg1_key = lv_key(lvid, 1);
        let seg2_key = lv_key(lvid, 2);

        let mut header_value = Vec::new();
        header_value.extend_from_slice(&10u64.to_be_bytes());
        let c0 = leaf_cell(&header_key, &header_value);
        let c1 = leaf_cell(&seg1_key, b"hello");
        let c2 = leaf_cell(&seg2_key, b"world");

        let buf = build_leaf_page(4096, &[&c0, &c1, &c2]);
        let mut pages = HashMap::new();
        pages.insert(1, buf);
        let source = FakeSource { pages: RefCell::new(pages), page_size: 4096 };

        let result = resolve(&source, 1, lvid).unwrap();
        assert_eq!(result, b"helloworld");
    }

    #[test]
    fn test_resolve_missing_header_is_reported() {
        let buf = build_leaf_page(4096, &[]);
        let mut pages = HashMap::new();
        pages.insert(1, buf);
        let source = FakeSource { pages: RefCell::new(pages), page_size: 4096 };
        let err = resolve(&source, 1, 99).unwrap_err();
        assert!(matches!(err, Error::LongValueMissing(99)));
    }
}
