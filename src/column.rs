//! Column type codes and per-column metadata, as declared by catalog COLUMN entries.

/// The column's stored type, as recorded in the catalog's `coltyp` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Boolean,
    Int8,
    Int16Unsigned,
    Int16Signed,
    Int32Unsigned,
    Int32Signed,
    Int64Unsigned,
    Int64Signed,
    Float32,
    Float64,
    DateTime,
    Currency,
    Guid,
    Binary,
    LargeBinary,
    Text,
    LargeText,
    SuperLarge,
}

#[derive(thiserror::Error, Debug, Clone, Copy)]
#[error("Column type code {0} is not a known ESE column type.")]
pub struct UnknownColumnType(pub u32);

impl ColumnType {
    /// Maps the on-disk `JET_coltyp` numeric code to our enum. Codes follow the
    /// published ESE catalog numbering; 16/17 (super-large values) are included for
    /// completeness though no format revision in this crate's scope emits them.
    pub fn from_coltyp(code: u32) -> Result<Self, UnknownColumnType> {
        Ok(match code {
            1 => ColumnType::Boolean,
            2 => ColumnType::Int8,
            3 => ColumnType::Int16Signed,
            4 => ColumnType::Int32Signed,
            5 => ColumnType::Currency,
            6 => ColumnType::Float32,
            7 => ColumnType::Float64,
            8 => ColumnType::DateTime,
            9 => ColumnType::Binary,
            10 => ColumnType::Text,
            11 => ColumnType::LargeBinary,
            12 => ColumnType::LargeText,
            13 => ColumnType::SuperLarge,
            14 => ColumnType::Int32Unsigned,
            15 => ColumnType::Int64Signed,
            16 => ColumnType::Guid,
            17 => ColumnType::Int16Unsigned,
            other => return Err(UnknownColumnType(other)),
        })
    }

    /// Fixed on-disk width for scalar fixed/variable-region columns, or `None` for
    /// types whose size is declared per-value (binary/text and their "large" forms,
    /// which only ever appear as variable or tagged columns).
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            ColumnType::Boolean | ColumnType::Int8 => Some(1),
            ColumnType::Int16Unsigned | ColumnType::Int16Signed => Some(2),
            ColumnType::Int32Unsigned | ColumnType::Int32Signed | ColumnType::Float32 => Some(4),
            ColumnType::Int64Unsigned | ColumnType::Int64Signed | ColumnType::Float64 | ColumnType::Currency | ColumnType::DateTime => Some(8),
            ColumnType::Guid => Some(16),
            ColumnType::Binary | ColumnType::LargeBinary | ColumnType::Text | ColumnType::LargeText | ColumnType::SuperLarge => None,
        }
    }
}

bitflags::bitflags! {
    /// Catalog-declared column attribute bits (`JET_ColumnCreate.grbit` family).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ColumnFlags: u32 {
        const FIXED                  = 0x0000_0001;
        const TAGGED                  = 0x0000_0002;
        const VERSION                 = 0x0000_0004;
        const AUTOINCREMENT          = 0x0000_0008;
        const MULTI_VALUE            = 0x0000_0400;
        const DEFAULT_VALUE          = 0x0000_0800;
        const ESCROW_UPDATE          = 0x0000_1000;
        const UNVERSIONED            = 0x0000_2000;
        const MAYBE_NULL             = 0x0000_4000;
        const USER_DEFINED_DEFAULT   = 0x0000_8000;
        const TEMPLATE_COLUMN        = 0x0001_0000;
        const DERIVED_COLUMN         = 0x0002_0000;
        const COMPRESSED              = 0x0004_0000;
        const ENCRYPTED                = 0x0008_0000;
    }
}

/// One column's declared metadata, as materialized by the catalog loader.
#[derive(Debug, Clone)]
pub struct Column {
    pub column_id: u32,
    pub name: String,
    pub column_type: ColumnType,
    pub codepage: u16,
    pub length: u32,
    pub flags: ColumnFlags,
}

impl Column {
    pub fn is_fixed(&self) -> bool {
        self.flags.contains(ColumnFlags::FIXED) && self.column_id <= 127
    }

    pub fn is_tagged(&self) -> bool {
        self.column_id >= 256
    }

    pub fn is_variable(&self) -> bool {
        !self.is_fixed() && !self.is_tagged()
    }

    /// Applies the spec's resolution for template/derived columns: a derived column
    /// that doesn't override an attribute inherits it from its template.
    pub fn inherit_from_template(&mut self, template: &Column) {
        if !self.flags.contains(ColumnFlags::DERIVED_COLUMN) {
            return;
        }
        if self.codepage == 0 {
            self.codepage = template.codepage;
        }
        if self.length == 0 {
            self.length = template.length;
        }
        let inheritable = ColumnFlags::MULTI_VALUE | ColumnFlags::ESCROW_UPDATE | ColumnFlags::COMPRESSED | ColumnFlags::ENCRYPTED;
        self.flags |= template.flags & inheritable;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_lookup() {
        assert_eq!(ColumnType::Int32Signed.fixed_width(), Some(4));
        assert_eq!(ColumnType::Text.fixed_width(), None);
    }

    #[test]
    fn test_column_id_range_classification() {
        let c = Column {
            column_id: 5,
            name: "a".into(),
            column_type: ColumnType::Int8,
            codepage: 0,
            length: 1,
            flags: ColumnFlags::FIXED,
        };
        assert!(c.is_fixed());
        let c2 = Column { column_id: 300, ..c.clone() };
        assert!(c2.is_tagged());
    }

    #[test]
    fn test_derived_column_inherits_unset_attributes() {
        let template = Column {
            column_id: 1,
            name: "t".into(),
            column_type: ColumnType::Text,
            codepage: 1200,
            length: 50,
            flags: ColumnFlags::COMPRESSED,
        };
        let mut derived = Column {
            column_id: 300,
            name: "t_v2".into(),
            column_type: ColumnType::Text,
            codepage: 0,
            length: 0,
            flags: ColumnFlags::DERIVED_COLUMN,
        };
        derived.inherit_from_template(&template);
        assert_eq!(derived.codepage, 1200);
        assert_eq!(derived.length, 50);
        assert!(derived.flags.contains(ColumnFlags::COMPRESSED));
    }

    #[test]
    fn test_unknown_coltyp_is_reported() {
        assert!(ColumnType::from_coltyp(255).is_err());
    }
}
