//! Type mapping between backend column descriptors and Arrow fields.
//!
//! Every backend reports its result columns as `ColumnDesc` rows (name,
//! declared type, nullability). This module turns those into Arrow fields
//! plus the scan destination each cursor column writes into, keeping the
//! schema advertised by `GetFlightInfo` and the schema produced by the
//! batch reader on the exact same code path.

use arrow_schema::{DataType, Field, Schema, TimeUnit};
use chrono::NaiveDateTime;

use crate::error::PorterError;

/// Column metadata as reported by a backend cursor or describe call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDesc {
    pub name: String,
    /// Declared type name in the backend's own vocabulary
    /// (`BIGINT`, `Nullable(UInt64)`, `DECIMAL(20,2)`, ...).
    pub decl_type: String,
    pub nullable: bool,
}

impl ColumnDesc {
    pub fn new(name: impl Into<String>, decl_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            decl_type: decl_type.into(),
            nullable,
        }
    }
}

/// Dynamically typed cell pulled from a row cursor.
///
/// Temporal values arrive as wall-clock instants; the append path converts
/// them into the column's logical unit.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Text(String),
    Blob(Vec<u8>),
    Instant(NaiveDateTime),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Human-readable tag used in scan mismatch errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            CellValue::Null => "NULL",
            CellValue::Bool(_) => "BOOL",
            CellValue::Int8(_) => "INT8",
            CellValue::Int16(_) => "INT16",
            CellValue::Int32(_) => "INT32",
            CellValue::Int64(_) => "INT64",
            CellValue::UInt8(_) => "UINT8",
            CellValue::UInt16(_) => "UINT16",
            CellValue::UInt32(_) => "UINT32",
            CellValue::UInt64(_) => "UINT64",
            CellValue::Float32(_) => "FLOAT32",
            CellValue::Float64(_) => "FLOAT64",
            CellValue::Text(_) => "STRING",
            CellValue::Blob(_) => "BINARY",
            CellValue::Instant(_) => "TIMESTAMP",
        }
    }
}

/// Typed destination one cursor column scans into.
///
/// The validity flag rides alongside the value as an `Option`; a column
/// declared non-nullable simply never observes `None`. `Float32` scans
/// through a 64-bit slot and narrows on append. Decimals scan as text and
/// are parsed against the field's precision/scale by the builder.
/// `Dynamic` is the late-bound fallback for types with no concrete slot.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanSlot {
    Bool(Option<bool>),
    Int8(Option<i8>),
    Int16(Option<i16>),
    Int32(Option<i32>),
    Int64(Option<i64>),
    UInt8(Option<u8>),
    UInt16(Option<u16>),
    UInt32(Option<u32>),
    UInt64(Option<u64>),
    Float32(Option<f64>),
    Float64(Option<f64>),
    Utf8(Option<String>),
    Binary(Option<Vec<u8>>),
    Instant(Option<NaiveDateTime>),
    DecimalText(Option<String>),
    Dynamic(Option<CellValue>),
}

impl ScanSlot {
    /// Reset the slot to null before the next row scan.
    pub fn clear(&mut self) {
        match self {
            ScanSlot::Bool(v) => *v = None,
            ScanSlot::Int8(v) => *v = None,
            ScanSlot::Int16(v) => *v = None,
            ScanSlot::Int32(v) => *v = None,
            ScanSlot::Int64(v) => *v = None,
            ScanSlot::UInt8(v) => *v = None,
            ScanSlot::UInt16(v) => *v = None,
            ScanSlot::UInt32(v) => *v = None,
            ScanSlot::UInt64(v) => *v = None,
            ScanSlot::Float32(v) => *v = None,
            ScanSlot::Float64(v) => *v = None,
            ScanSlot::Utf8(v) => *v = None,
            ScanSlot::Binary(v) => *v = None,
            ScanSlot::Instant(v) => *v = None,
            ScanSlot::DecimalText(v) => *v = None,
            ScanSlot::Dynamic(v) => *v = None,
        }
    }

    /// Store a scanned cell into the slot, checking the runtime type.
    pub fn store(&mut self, cell: CellValue) -> Result<(), PorterError> {
        if cell.is_null() {
            self.clear();
            return Ok(());
        }
        match (self, cell) {
            (ScanSlot::Bool(v), CellValue::Bool(b)) => *v = Some(b),
            (ScanSlot::Int8(v), CellValue::Int8(n)) => *v = Some(n),
            (ScanSlot::Int16(v), CellValue::Int16(n)) => *v = Some(n),
            (ScanSlot::Int32(v), CellValue::Int32(n)) => *v = Some(n),
            (ScanSlot::Int64(v), CellValue::Int64(n)) => *v = Some(n),
            (ScanSlot::UInt8(v), CellValue::UInt8(n)) => *v = Some(n),
            (ScanSlot::UInt16(v), CellValue::UInt16(n)) => *v = Some(n),
            (ScanSlot::UInt32(v), CellValue::UInt32(n)) => *v = Some(n),
            (ScanSlot::UInt64(v), CellValue::UInt64(n)) => *v = Some(n),
            // FLOAT32 rides a 64-bit slot; narrowing happens on append.
            (ScanSlot::Float32(v), CellValue::Float32(f)) => *v = Some(f as f64),
            (ScanSlot::Float32(v), CellValue::Float64(f)) => *v = Some(f),
            (ScanSlot::Float64(v), CellValue::Float64(f)) => *v = Some(f),
            (ScanSlot::Float64(v), CellValue::Float32(f)) => *v = Some(f as f64),
            (ScanSlot::Utf8(v), CellValue::Text(s)) => *v = Some(s),
            (ScanSlot::Binary(v), CellValue::Blob(b)) => *v = Some(b),
            (ScanSlot::Instant(v), CellValue::Instant(t)) => *v = Some(t),
            (ScanSlot::DecimalText(v), CellValue::Text(s)) => *v = Some(s),
            (ScanSlot::Dynamic(v), cell) => *v = Some(cell),
            (slot, cell) => {
                return Err(PorterError::Internal(format!(
                    "cannot scan {} cell into {} slot",
                    cell.type_name(),
                    slot.slot_name()
                )))
            }
        }
        Ok(())
    }

    fn slot_name(&self) -> &'static str {
        match self {
            ScanSlot::Bool(_) => "BOOL",
            ScanSlot::Int8(_) => "INT8",
            ScanSlot::Int16(_) => "INT16",
            ScanSlot::Int32(_) => "INT32",
            ScanSlot::Int64(_) => "INT64",
            ScanSlot::UInt8(_) => "UINT8",
            ScanSlot::UInt16(_) => "UINT16",
            ScanSlot::UInt32(_) => "UINT32",
            ScanSlot::UInt64(_) => "UINT64",
            ScanSlot::Float32(_) => "FLOAT32",
            ScanSlot::Float64(_) => "FLOAT64",
            ScanSlot::Utf8(_) => "STRING",
            ScanSlot::Binary(_) => "BINARY",
            ScanSlot::Instant(_) => "TEMPORAL",
            ScanSlot::DecimalText(_) => "DECIMAL",
            ScanSlot::Dynamic(_) => "DYNAMIC",
        }
    }
}

/// Map a backend column descriptor to an Arrow field plus the scan
/// destination whose runtime type matches what the cursor emits.
pub fn map_column(col: &ColumnDesc) -> Result<(Field, ScanSlot), PorterError> {
    let (data_type, nullable_override) = decl_type_to_arrow(&col.decl_type)?;
    let nullable = nullable_override.unwrap_or(col.nullable);
    let field = Field::new(&col.name, data_type, nullable);
    let slot = scan_slot_for_field(&field);
    Ok((field, slot))
}

/// Build a schema from backend column metadata.
pub fn schema_from_columns(cols: &[ColumnDesc]) -> Result<Schema, PorterError> {
    let mut fields = Vec::with_capacity(cols.len());
    for col in cols {
        let (field, _) = map_column(col)?;
        fields.push(field);
    }
    Ok(Schema::new(fields))
}

/// Scan destination for an already-resolved field. Types outside the
/// supported set fall back to the dynamic slot and are checked at append.
pub fn scan_slot_for_field(field: &Field) -> ScanSlot {
    match field.data_type() {
        DataType::Boolean => ScanSlot::Bool(None),
        DataType::Int8 => ScanSlot::Int8(None),
        DataType::Int16 => ScanSlot::Int16(None),
        DataType::Int32 => ScanSlot::Int32(None),
        DataType::Int64 => ScanSlot::Int64(None),
        DataType::UInt8 => ScanSlot::UInt8(None),
        DataType::UInt16 => ScanSlot::UInt16(None),
        DataType::UInt32 => ScanSlot::UInt32(None),
        DataType::UInt64 => ScanSlot::UInt64(None),
        DataType::Float32 => ScanSlot::Float32(None),
        DataType::Float64 => ScanSlot::Float64(None),
        DataType::Utf8 => ScanSlot::Utf8(None),
        DataType::Binary => ScanSlot::Binary(None),
        DataType::Date32
        | DataType::Date64
        | DataType::Time32(_)
        | DataType::Time64(_)
        | DataType::Timestamp(_, _) => ScanSlot::Instant(None),
        DataType::Decimal128(_, _) | DataType::Decimal256(_, _) => ScanSlot::DecimalText(None),
        _ => ScanSlot::Dynamic(None),
    }
}

/// Translate a declared type name into an Arrow data type.
///
/// Covers the embedded engine's vocabulary (the `BIGINT`/`UTINYINT`/...
/// family) and the remote engine's (`UInt64`, `Nullable(...)`,
/// `DateTime64`, ...). Returns an optional nullability override for
/// wrapper types that encode it in the name.
fn decl_type_to_arrow(decl: &str) -> Result<(DataType, Option<bool>), PorterError> {
    let trimmed = decl.trim();

    // Remote-engine wrappers carry nullability and dictionary hints in the
    // type name itself.
    if let Some(inner) = strip_wrapper(trimmed, "Nullable") {
        let (dt, _) = decl_type_to_arrow(inner)?;
        return Ok((dt, Some(true)));
    }
    if let Some(inner) = strip_wrapper(trimmed, "LowCardinality") {
        return decl_type_to_arrow(inner);
    }

    let upper = trimmed.to_uppercase();
    let data_type = match upper.as_str() {
        // Signed integers
        "BIGINT" | "INT8" | "LONG" | "INT64" => DataType::Int64,
        "INTEGER" | "INT" | "INT4" | "SIGNED" | "INT32" => DataType::Int32,
        "SMALLINT" | "INT2" | "SHORT" | "INT16" => DataType::Int16,
        "TINYINT" | "INT1" => DataType::Int8,
        // Unsigned integers
        "UBIGINT" | "UINT64" => DataType::UInt64,
        "UINTEGER" | "UINT32" => DataType::UInt32,
        "USMALLINT" | "UINT16" => DataType::UInt16,
        "UTINYINT" | "UINT8" => DataType::UInt8,
        // Strings
        "VARCHAR" | "CHAR" | "BPCHAR" | "TEXT" | "STRING" => DataType::Utf8,
        // Booleans
        "BOOLEAN" | "BOOL" | "LOGICAL" => DataType::Boolean,
        // Floats
        "DOUBLE" | "DOUBLE PRECISION" | "FLOAT8" | "FLOAT64" => DataType::Float64,
        "FLOAT" | "FLOAT4" | "REAL" | "FLOAT32" => DataType::Float32,
        // Dates and times
        "DATE" | "DATE32" => DataType::Date32,
        "DATE64" => DataType::Date64,
        "TIME32" => DataType::Time32(TimeUnit::Second),
        "TIME" | "TIME64" => DataType::Time64(TimeUnit::Microsecond),
        "TIMESTAMP" | "DATETIME" => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        "TIMESTAMP WITH TIME ZONE" | "TIMESTAMPTZ" => {
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
        }
        // Binary
        "BLOB" | "BYTEA" | "BINARY" | "VARBINARY" => DataType::Binary,
        // UUID and JSON travel as text
        "UUID" | "JSON" => DataType::Utf8,
        _ => {
            // Parameterized remote temporal and decimal forms.
            if upper.starts_with("DATETIME64") || upper.starts_with("DATETIME") {
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
            } else if strip_wrapper(trimmed, "FixedString").is_some() {
                DataType::Utf8
            } else if upper.starts_with("DECIMAL") || upper.starts_with("NUMERIC") {
                match parse_decimal_precision_scale(trimmed) {
                    Some((precision, scale)) => {
                        let precision = precision.min(76);
                        let scale = scale.min(precision);
                        if precision <= 38 {
                            DataType::Decimal128(precision as u8, scale as i8)
                        } else {
                            DataType::Decimal256(precision as u8, scale as i8)
                        }
                    }
                    // Precision unknown: keep the textual form.
                    None => DataType::Utf8,
                }
            } else if upper == "HUGEINT" || upper == "UHUGEINT" {
                DataType::Decimal128(38, 0)
            } else {
                return Err(PorterError::UnsupportedType(decl.to_string()));
            }
        }
    };
    Ok((data_type, None))
}

fn strip_wrapper<'a>(decl: &'a str, wrapper: &str) -> Option<&'a str> {
    let rest = decl.strip_prefix(wrapper)?.trim_start();
    let inner = rest.strip_prefix('(')?;
    let inner = inner.strip_suffix(')')?;
    Some(inner.trim())
}

/// Parse precision and scale out of `DECIMAL(p, s)` / `NUMERIC(p)` forms.
fn parse_decimal_precision_scale(spec: &str) -> Option<(usize, usize)> {
    let start = spec.find('(')?;
    let end = spec[start + 1..].find(')').map(|idx| start + 1 + idx)?;
    let inner = spec[start + 1..end].trim();
    if inner.is_empty() {
        return None;
    }
    let mut parts = inner.split(',').map(|part| part.trim());
    let precision = parts.next()?.parse::<usize>().ok()?;
    let scale = parts
        .next()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(0);
    Some((precision, scale))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_mappings() -> anyhow::Result<()> {
        let (field, slot) = map_column(&ColumnDesc::new("n", "INTEGER", false))?;
        assert_eq!(field.data_type(), &DataType::Int32);
        assert!(!field.is_nullable());
        assert_eq!(slot, ScanSlot::Int32(None));

        let (field, slot) = map_column(&ColumnDesc::new("n", "UBIGINT", true))?;
        assert_eq!(field.data_type(), &DataType::UInt64);
        assert_eq!(slot, ScanSlot::UInt64(None));
        Ok(())
    }

    #[test]
    fn remote_wrappers_unwrap_and_force_nullability() -> anyhow::Result<()> {
        let (field, _) = map_column(&ColumnDesc::new("n", "Nullable(UInt64)", false))?;
        assert_eq!(field.data_type(), &DataType::UInt64);
        assert!(field.is_nullable());

        let (field, _) = map_column(&ColumnDesc::new("s", "LowCardinality(String)", true))?;
        assert_eq!(field.data_type(), &DataType::Utf8);

        let (field, _) = map_column(&ColumnDesc::new("s", "FixedString(16)", true))?;
        assert_eq!(field.data_type(), &DataType::Utf8);
        Ok(())
    }

    #[test]
    fn float32_scans_through_wide_slot() -> anyhow::Result<()> {
        let (field, mut slot) = map_column(&ColumnDesc::new("f", "FLOAT", true))?;
        assert_eq!(field.data_type(), &DataType::Float32);
        assert_eq!(slot, ScanSlot::Float32(None));
        slot.store(CellValue::Float64(1.5))?;
        assert_eq!(slot, ScanSlot::Float32(Some(1.5)));
        Ok(())
    }

    #[test]
    fn decimal_maps_by_precision_and_falls_back_to_text() -> anyhow::Result<()> {
        let (field, slot) = map_column(&ColumnDesc::new("d", "DECIMAL(20,2)", true))?;
        assert_eq!(field.data_type(), &DataType::Decimal128(20, 2));
        assert_eq!(slot, ScanSlot::DecimalText(None));

        let (field, _) = map_column(&ColumnDesc::new("d", "NUMERIC(60,5)", true))?;
        assert_eq!(field.data_type(), &DataType::Decimal256(60, 5));

        let (field, slot) = map_column(&ColumnDesc::new("d", "DECIMAL", true))?;
        assert_eq!(field.data_type(), &DataType::Utf8);
        assert_eq!(slot, ScanSlot::Utf8(None));
        Ok(())
    }

    #[test]
    fn temporal_types_scan_as_instants() -> anyhow::Result<()> {
        for decl in ["DATE", "TIME", "TIMESTAMP", "DateTime64(3)", "TIMESTAMPTZ"] {
            let (_, slot) = map_column(&ColumnDesc::new("t", decl, true))?;
            assert_eq!(slot, ScanSlot::Instant(None), "decl {decl}");
        }
        Ok(())
    }

    #[test]
    fn unknown_decl_type_is_unsupported() {
        let err = map_column(&ColumnDesc::new("x", "GEOMETRY", true)).unwrap_err();
        assert!(matches!(err, PorterError::UnsupportedType(name) if name == "GEOMETRY"));
    }

    #[test]
    fn store_rejects_mismatched_cells() {
        let mut slot = ScanSlot::Int64(None);
        let err = slot.store(CellValue::Text("oops".into())).unwrap_err();
        assert!(matches!(err, PorterError::Internal(_)));

        // null always lands, regardless of slot type
        slot.store(CellValue::Null).expect("null store");
        assert_eq!(slot, ScanSlot::Int64(None));
    }

    #[test]
    fn dynamic_slot_accepts_any_cell() -> anyhow::Result<()> {
        let mut slot = ScanSlot::Dynamic(None);
        slot.store(CellValue::Text("late".into()))?;
        assert_eq!(slot, ScanSlot::Dynamic(Some(CellValue::Text("late".into()))));
        Ok(())
    }
}
