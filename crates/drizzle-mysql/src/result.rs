//! Result set decoding.
//!
//! A statement produces either an update result (OK packet) or a row set
//! (column definitions, then text-protocol rows, then a terminator). This
//! module parses the column metadata and row payloads; reading packets off
//! the wire is the connection's job.

use std::sync::Arc;

use drizzle_core::error::ProtocolError;
use drizzle_core::{ColumnInfo, Error, Result, Row, Value};

use crate::protocol::reader::PacketReader;
use crate::types::{FieldType, column_flags, decode_text_value};

/// Column metadata from a result set header.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    /// Catalog name, always "def" in practice
    pub catalog: String,
    /// Schema (database) name
    pub schema: String,
    /// Table name or alias
    pub table: String,
    /// Original table name
    pub org_table: String,
    /// Column name or alias
    pub name: String,
    /// Original column name
    pub org_name: String,
    /// Character set number
    pub charset: u16,
    /// Display length
    pub column_length: u32,
    /// Wire type
    pub column_type: FieldType,
    /// Column flags
    pub flags: u16,
    /// Decimal digits
    pub decimals: u8,
}

impl ColumnDef {
    #[must_use]
    pub const fn is_not_null(&self) -> bool {
        self.flags & column_flags::NOT_NULL != 0
    }

    #[must_use]
    pub const fn is_primary_key(&self) -> bool {
        self.flags & column_flags::PRIMARY_KEY != 0
    }

    #[must_use]
    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    #[must_use]
    pub const fn is_auto_increment(&self) -> bool {
        self.flags & column_flags::AUTO_INCREMENT != 0
    }

    #[must_use]
    pub const fn is_binary(&self) -> bool {
        self.flags & column_flags::BINARY != 0
    }
}

/// Parse a column definition packet payload.
#[allow(clippy::result_large_err)]
pub fn parse_column_def(data: &[u8]) -> Result<ColumnDef> {
    let mut reader = PacketReader::new(data);

    let catalog = reader
        .read_lenenc_string()
        .ok_or_else(|| column_error("catalog", data))?;
    let schema = reader
        .read_lenenc_string()
        .ok_or_else(|| column_error("schema", data))?;
    let table = reader
        .read_lenenc_string()
        .ok_or_else(|| column_error("table", data))?;
    let org_table = reader
        .read_lenenc_string()
        .ok_or_else(|| column_error("org_table", data))?;
    let name = reader
        .read_lenenc_string()
        .ok_or_else(|| column_error("name", data))?;
    let org_name = reader
        .read_lenenc_string()
        .ok_or_else(|| column_error("org_name", data))?;

    // Length of the fixed-size block that follows; always 0x0C
    let _fixed_len = reader.read_lenenc_int();

    let charset = reader
        .read_u16_le()
        .ok_or_else(|| column_error("charset", data))?;
    let column_length = reader
        .read_u32_le()
        .ok_or_else(|| column_error("column_length", data))?;
    let column_type =
        FieldType::from_u8(reader.read_u8().ok_or_else(|| column_error("type", data))?);
    let flags = reader
        .read_u16_le()
        .ok_or_else(|| column_error("flags", data))?;
    let decimals = reader
        .read_u8()
        .ok_or_else(|| column_error("decimals", data))?;

    Ok(ColumnDef {
        catalog,
        schema,
        table,
        org_table,
        name,
        org_name,
        charset,
        column_length,
        column_type,
        flags,
        decimals,
    })
}

/// Decode a text protocol row payload against the column metadata.
///
/// Each cell is a length-encoded string; the 0xFB marker is NULL.
pub fn parse_text_row(data: &[u8], columns: &[ColumnDef], info: &Arc<ColumnInfo>) -> Row {
    let mut reader = PacketReader::new(data);
    let mut values = Vec::with_capacity(columns.len());

    for col in columns {
        if reader.peek() == Some(0xFB) {
            reader.skip(1);
            values.push(Value::Null);
        } else if let Some(cell) = reader.read_lenenc_bytes() {
            values.push(decode_text_value(col.column_type, &cell, col.is_unsigned()));
        } else {
            // Truncated row; treat missing cells as NULL
            values.push(Value::Null);
        }
    }

    Row::with_columns(Arc::clone(info), values)
}

/// Shared column metadata built once per result set.
pub fn column_info(columns: &[ColumnDef]) -> Arc<ColumnInfo> {
    Arc::new(ColumnInfo::new(
        columns.iter().map(|c| c.name.clone()).collect(),
    ))
}

/// Outcome of a statement that produced no rows.
#[derive(Debug, Clone, Default)]
pub struct UpdateResult {
    /// Rows changed (or matched, depending on connection flags)
    pub affected_rows: u64,
    /// Auto-increment id assigned by an INSERT
    pub insert_id: u64,
    /// Warning count
    pub warnings: u16,
    /// Human-readable info from the server
    pub message: String,
}

/// A fully-read row set.
#[derive(Debug, Clone)]
pub struct RowSet {
    /// Column metadata in select order
    pub columns: Vec<ColumnDef>,
    /// Decoded rows
    pub rows: Vec<Row>,
    /// Warning count from the terminating packet
    pub warnings: u16,
}

impl RowSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

/// The result of executing one statement.
#[derive(Debug, Clone)]
pub enum QueryResult {
    /// OK packet: no rows
    Update(UpdateResult),
    /// Result set: columns and rows
    Rows(RowSet),
}

impl QueryResult {
    /// Rows, if this result carries any.
    pub fn rows(&self) -> &[Row] {
        match self {
            QueryResult::Update(_) => &[],
            QueryResult::Rows(set) => &set.rows,
        }
    }

    /// Consume the result, returning its rows.
    #[must_use]
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            QueryResult::Update(_) => vec![],
            QueryResult::Rows(set) => set.rows,
        }
    }

    /// Affected row count for update results, zero for row sets.
    pub fn affected_rows(&self) -> u64 {
        match self {
            QueryResult::Update(u) => u.affected_rows,
            QueryResult::Rows(_) => 0,
        }
    }

    /// Auto-increment id for update results.
    pub fn insert_id(&self) -> u64 {
        match self {
            QueryResult::Update(u) => u.insert_id,
            QueryResult::Rows(_) => 0,
        }
    }

    pub fn warnings(&self) -> u16 {
        match self {
            QueryResult::Update(u) => u.warnings,
            QueryResult::Rows(set) => set.warnings,
        }
    }
}

fn column_error(field: &str, data: &[u8]) -> Error {
    Error::Protocol(ProtocolError {
        message: format!("column definition truncated at {field}"),
        raw_data: Some(data.to_vec()),
        source: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::writer::PacketWriter;

    fn encode_column_def(name: &str, column_type: FieldType, flags: u16) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_lenenc_string("def");
        w.write_lenenc_string("testdb");
        w.write_lenenc_string("t");
        w.write_lenenc_string("t");
        w.write_lenenc_string(name);
        w.write_lenenc_string(name);
        w.write_lenenc_int(0x0C);
        w.write_u16_le(33);
        w.write_u32_le(11);
        w.write_u8(column_type as u8);
        w.write_u16_le(flags);
        w.write_u8(0);
        w.write_u16_le(0); // filler
        w.into_bytes()
    }

    fn encode_text_row(cells: &[Option<&[u8]>]) -> Vec<u8> {
        let mut w = PacketWriter::new();
        for cell in cells {
            match cell {
                Some(data) => w.write_lenenc_bytes(data),
                None => w.write_u8(0xFB),
            }
        }
        w.into_bytes()
    }

    #[test]
    fn test_parse_column_def() {
        let data = encode_column_def("id", FieldType::Long, column_flags::NOT_NULL);
        let col = parse_column_def(&data).unwrap();
        assert_eq!(col.catalog, "def");
        assert_eq!(col.schema, "testdb");
        assert_eq!(col.name, "id");
        assert_eq!(col.column_type, FieldType::Long);
        assert!(col.is_not_null());
        assert!(!col.is_unsigned());
    }

    #[test]
    fn test_parse_column_def_truncated() {
        let data = encode_column_def("id", FieldType::Long, 0);
        assert!(parse_column_def(&data[..5]).is_err());
    }

    #[test]
    fn test_parse_text_row() {
        let columns = vec![
            parse_column_def(&encode_column_def("id", FieldType::Long, 0)).unwrap(),
            parse_column_def(&encode_column_def("name", FieldType::VarChar, 0)).unwrap(),
            parse_column_def(&encode_column_def("note", FieldType::VarChar, 0)).unwrap(),
        ];
        let info = column_info(&columns);

        let data = encode_text_row(&[Some(b"42"), Some(b"Alice"), None]);
        let row = parse_text_row(&data, &columns, &info);

        assert_eq!(row.get(0), Some(&Value::Int(42)));
        assert_eq!(row.get_by_name("name"), Some(&Value::Text("Alice".into())));
        assert_eq!(row.get_by_name("note"), Some(&Value::Null));
    }

    #[test]
    fn test_parse_text_row_unsigned_bigint() {
        let columns = vec![
            parse_column_def(&encode_column_def(
                "big",
                FieldType::LongLong,
                column_flags::UNSIGNED,
            ))
            .unwrap(),
        ];
        let info = column_info(&columns);

        let cell = u64::MAX.to_string();
        let data = encode_text_row(&[Some(cell.as_bytes())]);
        let row = parse_text_row(&data, &columns, &info);

        assert_eq!(row.get(0), Some(&Value::UBigInt(u64::MAX)));
    }

    #[test]
    fn test_rows_share_column_info() {
        let columns = vec![parse_column_def(&encode_column_def("id", FieldType::Long, 0)).unwrap()];
        let info = column_info(&columns);

        let a = parse_text_row(&encode_text_row(&[Some(b"1")]), &columns, &info);
        let b = parse_text_row(&encode_text_row(&[Some(b"2")]), &columns, &info);
        assert!(Arc::ptr_eq(&a.column_info(), &b.column_info()));
    }

    #[test]
    fn test_query_result_accessors() {
        let update = QueryResult::Update(UpdateResult {
            affected_rows: 3,
            insert_id: 7,
            warnings: 1,
            message: String::new(),
        });
        assert_eq!(update.affected_rows(), 3);
        assert_eq!(update.insert_id(), 7);
        assert!(update.rows().is_empty());

        let set = QueryResult::Rows(RowSet {
            columns: vec![],
            rows: vec![Row::new(vec!["a".into()], vec![Value::Int(1)])],
            warnings: 0,
        });
        assert_eq!(set.rows().len(), 1);
        assert_eq!(set.affected_rows(), 0);
    }

    #[test]
    fn test_row_set_column_index() {
        let columns = vec![
            parse_column_def(&encode_column_def("id", FieldType::Long, 0)).unwrap(),
            parse_column_def(&encode_column_def("name", FieldType::VarChar, 0)).unwrap(),
        ];
        let set = RowSet {
            columns,
            rows: vec![],
            warnings: 0,
        };
        assert_eq!(set.column_index("name"), Some(1));
        assert_eq!(set.column_index("missing"), None);
    }
}
