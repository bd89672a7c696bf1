//! Table/Index/Record handles: the borrow-like, read-only views the façade hands out
//! over a `File`'s catalog and data trees (component C9).

use crate::btree::{TreeWalker, Visitor};
use crate::catalog;
use crate::column::Column;
use crate::db::{self, File};
use crate::record::{self, LongValueResolver, Record as DecodedRecord};
use crate::value::Value;

/// A read-only handle onto one catalog-declared table. Borrows from the `File` it was
/// built from, so it cannot outlive it.
pub struct Table<'f> {
    file: &'f File,
    entry: &'f catalog::Table,
}

/// A read-only handle onto one of a table's secondary indexes.
pub struct Index<'f> {
    file: &'f File,
    table: &'f catalog::Table,
    entry: &'f catalog::Index,
}

/// One decoded row. Column order matches `Table::column`, independent of how the
/// catalog declared fixed/variable/tagged columns internally.
pub struct Record {
    inner: DecodedRecord,
}

impl Record {
    pub fn value_at(&self, column_index: usize) -> Result<Option<&Value>, db::Error> {
        self.inner.value_at(column_index).map_err(db::Error::from)
    }
}

/// Adapts a table's long-value tree onto the codec's `LongValueResolver` seam. The
/// tagged entry's 8-byte reference carries the long-value id as its first four bytes,
/// big-endian, matching how the LV tree keys its own rows.
struct TableLongValueResolver<'f> {
    file: &'f File,
    lv_root: Option<crate::page::PageNum>,
}

impl<'f> LongValueResolver for TableLongValueResolver<'f> {
    fn resolve(&self, key: &[u8]) -> Result<Vec<u8>, record::Error> {
        let lvid = if key.len() >= 4 { u32::from_be_bytes([key[0], key[1], key[2], key[3]]) } else { 0 };
        let root = self
            .lv_root
            .ok_or_else(|| record::Error::MalformedRecord("referenced a long value but table has no LV tree".into()))?;
        crate::longvalue::resolve(self.file, root, lvid).map_err(|e| record::Error::MalformedRecord(e.to_string()))
    }
}

struct RawRowCollector {
    rows: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Visitor for RawRowCollector {
    fn visit(&mut self, key: &[u8], value: &[u8]) -> bool {
        self.rows.push((key.to_vec(), value.to_vec()));
        true
    }
}

fn decode_row(file: &File, entry: &catalog::Table, bytes: &[u8]) -> Result<Record, db::Error> {
    let resolver = TableLongValueResolver { file, lv_root: entry.long_value_root_page };
    let inner = record::decode(bytes, &entry.columns, file.revision, &resolver, file.text_mode)?;
    Ok(Record { inner })
}

impl<'f> Table<'f> {
    pub(crate) fn new(file: &'f File, entry: &'f catalog::Table) -> Self {
        Table { file, entry }
    }

    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn number_of_columns(&self) -> usize {
        self.entry.columns.len()
    }

    pub fn column(&self, index: usize) -> Option<&Column> {
        self.entry.columns.get(index)
    }

    pub fn columns(&self) -> &[Column] {
        &self.entry.columns
    }

    pub fn indexes(&self) -> impl Iterator<Item = Index<'f>> + '_ {
        self.entry.indexes.iter().map(|idx| Index { file: self.file, table: self.entry, entry: idx })
    }

    /// Walks the table's data tree once and returns every row in leaf order. Callers
    /// wanting restartable iteration should call this again; a fresh walk is cheap next
    /// to the I/O it performs, and it keeps the walker's lifetime self-contained.
    fn all_rows(&self) -> Result<Vec<Vec<u8>>, db::Error> {
        let mut collector = RawRowCollector { rows: Vec::new() };
        let walker = TreeWalker::new(self.file, self.entry.data_root_page);
        walker.walk_all(&mut collector)?;
        Ok(collector.rows.into_iter().map(|(_, v)| v).collect())
    }

    pub fn number_of_records(&self) -> Result<u64, db::Error> {
        Ok(self.all_rows()?.len() as u64)
    }

    pub fn record(&self, index: u64) -> Result<Record, db::Error> {
        let rows = self.all_rows()?;
        let bytes = rows.get(index as usize).ok_or(db::Error::RecordIndexOutOfRange(index))?;
        decode_row(self.file, self.entry, bytes)
    }

    /// A pull-based, restartable iterator over every record in the table.
    pub fn records(&self) -> Result<RecordIter<'f>, db::Error> {
        Ok(RecordIter { file: self.file, entry: self.entry, rows: self.all_rows()?.into_iter() })
    }
}

impl<'f> Index<'f> {
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    /// Returns the `index`-th row in index order. A secondary index's leaf value is a
    /// reference back into the table's primary data tree (its bookmark); this resolves
    /// that reference the same way the engine does, by walking the primary tree for a
    /// matching key rather than decoding the index leaf bytes directly.
    pub fn record(&self, index: u64) -> Result<Record, db::Error> {
        let mut collector = RawRowCollector { rows: Vec::new() };
        let walker = TreeWalker::new(self.file, self.entry.root_page);
        walker.walk_all(&mut collector)?;
        let (_, bookmark) = collector.rows.get(index as usize).ok_or(db::Error::RecordIndexOutOfRange(index))?;

        let data_walker = TreeWalker::new(self.file, self.table.data_root_page);
        let (_, value) = data_walker.seek(bookmark)?.ok_or(db::Error::RecordIndexOutOfRange(index))?;
        decode_row(self.file, self.table, &value)
    }
}

/// A pull-based, restartable iterator over a table's decoded records.
pub struct RecordIter<'f> {
    file: &'f File,
    entry: &'f catalog::Table,
    rows: std::vec::IntoIter<Vec<u8>>,
}

impl<'f> Iterator for RecordIter<'f> {
    type Item = Result<Record, db::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let bytes = self.rows.next()?;
        Some(decode_row(self.file, self.entry, &bytes))
    }
}
