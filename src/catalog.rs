//! Catalog loader (component C6): walks the self-describing MSysObjects B-tree and
//! builds an in-memory directory of tables, columns, indexes, and long-value trees.

use std::collections::HashMap;

use crate::btree::{PageSource, TreeWalker, Visitor};
use crate::column::{Column, ColumnFlags, ColumnType};
use crate::header::Revision;
use crate::page::PageNum;
use crate::record::{self, NoLongValues};
use crate::value::Value;

/// The well-known object id of the catalog's own describing table.
pub const MSYSOBJECTS_OBJECT_ID: u32 = 4;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Walk(#[from] crate::btree::walker::Error),
    #[error(transparent)]
    Record(#[from] record::Error),
    #[error("Catalog row has object type {0}, which is not a known catalog entry kind.")]
    UnknownEntryType(i16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Table,
    Column,
    Index,
    LongValue,
    Callback,
}

impl EntryKind {
    fn from_code(code: i16) -> Result<Self, Error> {
        Ok(match code {
            1 => EntryKind::Table,
            2 => EntryKind::Column,
            3 => EntryKind::Index,
            4 => EntryKind::LongValue,
            5 => EntryKind::Callback,
            other => return Err(Error::UnknownEntryType(other)),
        })
    }
}

/// One raw row of the catalog, before being grouped into `Table`s.
struct CatalogRow {
    kind: EntryKind,
    father_data_page_object_id: u32,
    id: u32,
    coltyp_or_pgno_fdp: u32,
    space_usage: u32,
    flags: u32,
    codepage_or_locale: u32,
    name: String,
}

/// A fully assembled table: its own metadata plus the columns, indexes, and
/// long-value tree root the catalog declared for it.
#[derive(Debug, Clone)]
pub struct Table {
    pub object_id: u32,
    pub name: String,
    pub data_root_page: PageNum,
    pub columns: Vec<Column>,
    pub indexes: Vec<Index>,
    pub long_value_root_page: Option<PageNum>,
}

#[derive(Debug, Clone)]
pub struct Index {
    pub name: String,
    pub root_page: PageNum,
}

pub struct Catalog {
    pub tables: Vec<Table>,
}

impl Catalog {
    pub fn table_by_name(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }
}

/// Hard-coded fixed/variable layout of the MSysObjects table itself, since the
/// catalog is self-describing but its own row layout cannot be looked up in itself.
/// Field numbering follows the published ESE catalog schema.
fn catalog_columns() -> Vec<Column> {
    vec![
        fixed_col(1, "ObjidTable", ColumnType::Int32Signed),
        fixed_col(2, "Type", ColumnType::Int16Signed),
        fixed_col(3, "Id", ColumnType::Int32Signed),
        fixed_col(4, "ColtypOrPgnoFDP", ColumnType::Int32Signed),
        fixed_col(5, "SpaceUsage", ColumnType::Int32Signed),
        fixed_col(6, "Flags", ColumnType::Int32Signed),
        fixed_col(7, "PagesOrLocale", ColumnType::Int32Signed),
        fixed_col(8, "RootFlag", ColumnType::Boolean),
        fixed_col(9, "RecordOffset", ColumnType::Int16Signed),
        fixed_col(10, "LCMapFlags", ColumnType::Int32Signed),
        fixed_col(11, "KeyMost", ColumnType::Int16Signed),
        variable_col(128, "Name", ColumnType::Text, 1200),
        variable_col(130, "TemplateTable", ColumnType::Text, 1200),
    ]
}

fn fixed_col(id: u32, name: &str, ty: ColumnType) -> Column {
    Column {
        column_id: id,
        name: name.to_string(),
        column_type: ty,
        codepage: 0,
        length: ty.fixed_width().unwrap_or(0) as u32,
        flags: ColumnFlags::FIXED,
    }
}

fn variable_col(id: u32, name: &str, ty: ColumnType, codepage: u16) -> Column {
    Column { column_id: id, name: name.to_string(), column_type: ty, codepage, length: 0, flags: ColumnFlags::empty() }
}

fn region_rank(c: &Column) -> u8 {
    if c.is_fixed() {
        0
    } else if c.is_variable() {
        1
    } else {
        2
    }
}

fn as_i32(v: &Option<Value>) -> i32 {
    match v {
        Some(Value::Int32Signed(i)) => *i,
        _ => 0,
    }
}
fn as_i16(v: &Option<Value>) -> i16 {
    match v {
        Some(Value::Int16Signed(i)) => *i,
        _ => 0,
    }
}
fn as_text(v: &Option<Value>) -> String {
    match v {
        Some(Value::Text(s)) => s.clone(),
        _ => String::new(),
    }
}

struct RowCollector<'a> {
    columns: &'a [Column],
    revision: Revision,
    text_mode: record::TextMode,
    rows: Vec<CatalogRow>,
    error: Option<Error>,
}

impl<'a> Visitor for RowCollector<'a> {
    fn visit(&mut self, _key: &[u8], value: &[u8]) -> bool {
        let record = match record::decode(value, self.columns, self.revision, &NoLongValues, self.text_mode) {
            Ok(r) => r,
            Err(e) => {
                self.error = Some(Error::Record(e));
                return false;
            }
        };
        let kind_code = as_i16(&record.values[1]);
        let kind = match EntryKind::from_code(kind_code) {
            Ok(k) => k,
            Err(e) => {
                self.error = Some(e);
                return false;
            }
        };
        self.rows.push(CatalogRow {
            kind,
            father_data_page_object_id: as_i32(&record.values[0]) as u32,
            id: as_i32(&record.values[2]) as u32,
            coltyp_or_pgno_fdp: as_i32(&record.values[3]) as u32,
            space_usage: as_i32(&record.values[4]) as u32,
            flags: as_i32(&record.values[5]) as u32,
            codepage_or_locale: as_i32(&record.values[6]) as u32,
            name: as_text(&record.values[11]),
        });
        true
    }
}

/// Loads the full catalog by walking the MSysObjects B-tree rooted at `root_page`.
pub fn load(
    source: &dyn PageSource,
    root_page: PageNum,
    revision: Revision,
    text_mode: record::TextMode,
) -> Result<Catalog, Error> {
    let columns = catalog_columns();
    let walker = TreeWalker::new(source, root_page);
    let mut collector = RowCollector { columns: &columns, revision, text_mode, rows: Vec::new(), error: None };
    walker.walk_all(&mut collector)?;
    if let Some(e) = collector.error {
        return Err(e);
    }
    log::debug!("catalog: loaded {} rows from page {root_page}", collector.rows.len());

    let mut tables: HashMap<u32, Table> = HashMap::new();
    let mut table_order: Vec<u32> = Vec::new();

    for row in &collector.rows {
        if row.kind == EntryKind::Table {
            table_order.push(row.id);
            tables.insert(
                row.id,
                Table {
                    object_id: row.id,
                    name: row.name.clone(),
                    data_root_page: row.coltyp_or_pgno_fdp,
                    columns: Vec::new(),
                    indexes: Vec::new(),
                    long_value_root_page: None,
                },
            );
        }
    }

    for row in &collector.rows {
        match row.kind {
            EntryKind::Column => {
                if let Some(table) = tables.get_mut(&row.father_data_page_object_id) {
                    let column_type = ColumnType::from_coltyp(row.coltyp_or_pgno_fdp).unwrap_or(ColumnType::Binary);
                    table.columns.push(Column {
                        column_id: row.id,
                        name: row.name.clone(),
                        column_type,
                        codepage: row.codepage_or_locale as u16,
                        length: row.space_usage,
                        flags: ColumnFlags::from_bits_truncate(row.flags),
                    });
                }
            }
            EntryKind::Index => {
                if let Some(table) = tables.get_mut(&row.father_data_page_object_id) {
                    table.indexes.push(Index { name: row.name.clone(), root_page: row.coltyp_or_pgno_fdp });
                }
            }
            EntryKind::LongValue => {
                if let Some(table) = tables.get_mut(&row.father_data_page_object_id) {
                    table.long_value_root_page = Some(row.coltyp_or_pgno_fdp);
                }
            }
            EntryKind::Table | EntryKind::Callback => {}
        }
    }

    // Resolve derived-column inheritance once every table's columns are attached, per
    // the open-question decision recorded in the design ledger.
    for table in tables.values_mut() {
        let template: Vec<Column> = table.columns.clone();
        for col in table.columns.iter_mut() {
            if col.flags.contains(ColumnFlags::DERIVED_COLUMN) {
                if let Some(base) = template.iter().find(|t| t.name == col.name && t.column_id != col.column_id) {
                    col.inherit_from_template(base);
                }
            }
        }
        // Order columns fixed, then variable, then tagged (each by id), matching the
        // region order `record::decode` walks in, so a decoded record's value index
        // lines up with `Table::column`'s index.
        table.columns.sort_by_key(|c| (region_rank(c), c.column_id));
    }

    let ordered_tables: Vec<Table> = table_order.into_iter().filter_map(|id| tables.remove(&id)).collect();
    log::info!("catalog: {} tables", ordered_tables.len());
    Ok(Catalog { tables: ordered_tables })
}
