//! Decodes the bytes of a single page-tag into a branch or leaf cell.
//!
//! Cell layout (both roles): `[common_key_size:u16 if COMMON_KEY]`, `local_key_size:u16`,
//! `local_key_size` bytes of local key, then role-specific payload (a 4-byte child page
//! number for branch cells, or the raw value bytes for leaf cells).

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("Cell is too short to contain its declared local key.")]
    Truncated,
}

#[derive(Debug, Clone)]
pub struct BranchCell {
    pub common_key_size: u16,
    pub local_key: Vec<u8>,
    pub child_page: crate::page::PageNum,
}

#[derive(Debug, Clone)]
pub struct LeafCell {
    pub common_key_size: u16,
    pub local_key: Vec<u8>,
    pub value: Vec<u8>,
}

fn read_common_and_local_key(c: &mut Cursor<&[u8]>, has_common_key: bool) -> Result<(u16, Vec<u8>), Error> {
    let common_key_size = if has_common_key {
        c.read_u16::<LittleEndian>().map_err(|_| Error::Truncated)?
    } else {
        0
    };
    let local_key_size = c.read_u16::<LittleEndian>().map_err(|_| Error::Truncated)? as usize;
    let mut local_key = vec![0u8; local_key_size];
    c.read_exact(&mut local_key).map_err(|_| Error::Truncated)?;
    Ok((common_key_size, local_key))
}

pub fn decode_branch(bytes: &[u8], has_common_key: bool) -> Result<BranchCell, Error> {
    let mut c = Cursor::new(bytes);
    let (common_key_size, local_key) = read_common_and_local_key(&mut c, has_common_key)?;
    let child_page = c.read_u32::<LittleEndian>().map_err(|_| Error::Truncated)?;
    Ok(BranchCell { common_key_size, local_key, child_page })
}

pub fn decode_leaf(bytes: &[u8], has_common_key: bool) -> Result<LeafCell, Error> {
    let mut c = Cursor::new(bytes);
    let (common_key_size, local_key) = read_common_and_local_key(&mut c, has_common_key)?;
    let pos = c.position() as usize;
    let value = bytes[pos..].to_vec();
    Ok(LeafCell { common_key_size, local_key, value })
}

/// Reconstructs a cell's full key given the full key of the page's reference key
/// (either the preceding cell's full key, front-coding style, or the page's stored
/// first-cell key). `prefix_source` is the key bytes the `common_key_size` indexes
/// into.
pub fn reconstruct_key(prefix_source: &[u8], common_key_size: u16, local_key: &[u8]) -> Vec<u8> {
    let n = (common_key_size as usize).min(prefix_source.len());
    let mut full = Vec::with_capacity(n + local_key.len());
    full.extend_from_slice(&prefix_source[..n]);
    full.extend_from_slice(local_key);
    full
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconstruct_key_common_prefix_foo_bar() {
        let full = reconstruct_key(b"foozzz", 3, b"bar");
        assert_eq!(full, b"foobar");
    }

    #[test]
    fn test_decode_leaf_cell_without_common_key() {
        let mut bytes = vec![];
        bytes.extend_from_slice(&3u16.to_le_bytes()); // local_key_size
        bytes.extend_from_slice(b"abc");
        bytes.extend_from_slice(b"payload");
        let leaf = decode_leaf(&bytes, false).unwrap();
        assert_eq!(leaf.common_key_size, 0);
        assert_eq!(leaf.local_key, b"abc");
        assert_eq!(leaf.value, b"payload");
    }

    #[test]
    fn test_decode_branch_cell_with_common_key() {
        let mut bytes = vec![];
        bytes.extend_from_slice(&2u16.to_le_bytes()); // common_key_size
        bytes.extend_from_slice(&3u16.to_le_bytes()); // local_key_size
        bytes.extend_from_slice(b"xyz");
        bytes.extend_from_slice(&42u32.to_le_bytes());
        let branch = decode_branch(&bytes, true).unwrap();
        assert_eq!(branch.common_key_size, 2);
        assert_eq!(branch.local_key, b"xyz");
        assert_eq!(branch.child_page, 42);
    }
}
