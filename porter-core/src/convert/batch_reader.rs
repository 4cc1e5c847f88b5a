//! Converts a forward-only row cursor into a stream of record batches.
//!
//! The reader owns the cursor and a set of per-column builders. Each call
//! to `advance` discards the previous builders, allocates a fresh set
//! bound to the schema, scans up to `batch_size` rows into the typed
//! destinations, and finalizes a batch. A fresh builder set per batch
//! trades a small allocation for a one-directional lifetime story:
//! builders never outlive the batch they produced.
//!
//! `current` hands out a zero-copy slice over the batch's buffers, so a
//! consumer can hold a batch after the reader has moved on or been
//! released entirely.

use std::sync::atomic::{AtomicI64, Ordering};

use arrow_array::builder::{
    make_builder, ArrayBuilder, BinaryBuilder, BooleanBuilder, Date32Builder, Date64Builder,
    Decimal128Builder, Decimal256Builder, Float32Builder, Float64Builder, Int16Builder,
    Int32Builder, Int64Builder, Int8Builder, StringBuilder, Time32SecondBuilder,
    Time64MicrosecondBuilder, TimestampMicrosecondBuilder, UInt16Builder, UInt32Builder,
    UInt64Builder, UInt8Builder,
};
use arrow_array::{ArrayRef, RecordBatch};
use arrow_buffer::i256;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use tracing::debug;

use crate::backend::RowCursor;
use crate::error::PorterError;
use crate::types::{map_column, scan_slot_for_field, CellValue, ScanSlot};

pub const DEFAULT_BATCH_SIZE: usize = 1024;

pub struct BatchReader {
    schema: SchemaRef,
    cursor: Option<Box<dyn RowCursor>>,
    builders: Vec<Box<dyn ArrayBuilder>>,
    slots: Vec<ScanSlot>,
    batch_size: usize,
    current: Option<RecordBatch>,
    error: Option<PorterError>,
    refcount: AtomicI64,
}

impl BatchReader {
    /// Resolve the schema from the cursor's column descriptors and build
    /// scan destinations to match.
    pub fn new(cursor: Box<dyn RowCursor>) -> Result<Self, PorterError> {
        let mut fields = Vec::with_capacity(cursor.columns().len());
        let mut slots = Vec::with_capacity(cursor.columns().len());
        for col in cursor.columns() {
            let (field, slot) = map_column(col)?;
            fields.push(field);
            slots.push(slot);
        }
        let schema = SchemaRef::new(Schema::new(fields));
        Ok(Self::assemble(schema, slots, cursor))
    }

    /// Bypass inference; destinations derive from the given schema. Used
    /// when the schema was already advertised to the client and the first
    /// batch must match it exactly.
    pub fn new_with_schema(schema: SchemaRef, cursor: Box<dyn RowCursor>) -> Self {
        let slots = schema.fields().iter().map(|f| scan_slot_for_field(f)).collect();
        Self::assemble(schema, slots, cursor)
    }

    fn assemble(schema: SchemaRef, slots: Vec<ScanSlot>, cursor: Box<dyn RowCursor>) -> Self {
        let builders = make_builders(&schema, DEFAULT_BATCH_SIZE);
        Self {
            schema,
            cursor: Some(cursor),
            builders,
            slots,
            batch_size: DEFAULT_BATCH_SIZE,
            current: None,
            error: None,
            refcount: AtomicI64::new(1),
        }
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn set_batch_size(&mut self, size: usize) {
        if size > 0 {
            self.batch_size = size;
        }
    }

    pub fn error(&self) -> Option<&PorterError> {
        self.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<PorterError> {
        self.error.take()
    }

    pub fn retain(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one reference; the last release closes the cursor and drops
    /// the builders. Releasing past zero is a bug in the caller.
    pub fn release(&mut self) {
        let remaining = self.refcount.fetch_sub(1, Ordering::SeqCst) - 1;
        assert!(remaining >= 0, "BatchReader released after refcount reached zero");
        if remaining == 0 {
            self.cleanup();
        }
    }

    fn cleanup(&mut self) {
        if let Some(mut cursor) = self.cursor.take() {
            cursor.close();
        }
        self.builders.clear();
        if self.current.is_some() {
            // Any slice handed out via current() keeps its own column
            // references; dropping ours here is safe.
            self.current = None;
        }
    }

    /// Zero-copy slice of the most recently produced batch. The slice
    /// shares the underlying buffers and stays readable after the next
    /// `advance` or the reader's release.
    pub fn current(&self) -> Option<RecordBatch> {
        self.current
            .as_ref()
            .map(|batch| batch.slice(0, batch.num_rows()))
    }

    /// Produce the next batch. Returns `false` on clean end-of-cursor or
    /// on error; inspect `error()` to tell the two apart.
    pub fn advance(&mut self) -> bool {
        if self.error.is_some() {
            return false;
        }
        self.current = None;
        self.builders = make_builders(&self.schema, self.batch_size);

        let Some(cursor) = self.cursor.as_mut() else {
            return false;
        };

        let mut rows = 0usize;
        while rows < self.batch_size {
            match cursor.next_row(&mut self.slots) {
                Ok(true) => {
                    for (idx, slot) in self.slots.iter_mut().enumerate() {
                        let field = self.schema.field(idx);
                        if let Err(err) =
                            append_slot(self.builders[idx].as_mut(), field, slot)
                        {
                            self.error = Some(err);
                            return false;
                        }
                    }
                    rows += 1;
                }
                Ok(false) => break,
                Err(err) => {
                    self.error = Some(err);
                    return false;
                }
            }
        }

        if rows == 0 {
            debug!("cursor exhausted, end of data");
            return false;
        }

        let columns: Vec<ArrayRef> = self.builders.iter_mut().map(|b| b.finish()).collect();
        match RecordBatch::try_new(self.schema.clone(), columns) {
            Ok(batch) => {
                debug!(rows, "produced record batch");
                self.current = Some(batch);
                true
            }
            Err(err) => {
                self.error = Some(PorterError::Arrow(err));
                false
            }
        }
    }
}

impl Drop for BatchReader {
    fn drop(&mut self) {
        // Dropping with references outstanding still must not leak the
        // cursor; emitted batches own their buffers independently.
        if self.cursor.is_some() {
            self.cleanup();
        }
    }
}

fn make_builders(schema: &Schema, capacity: usize) -> Vec<Box<dyn ArrayBuilder>> {
    schema
        .fields()
        .iter()
        .map(|field| make_builder(field.data_type(), capacity))
        .collect()
}

/// Append one scanned slot into its column builder, mapping absent values
/// to nulls. Mismatches between slot and builder are fatal.
fn append_slot(
    builder: &mut dyn ArrayBuilder,
    field: &Field,
    slot: &mut ScanSlot,
) -> Result<(), PorterError> {
    match slot {
        ScanSlot::Bool(v) => {
            typed::<BooleanBuilder>(builder, "bool")?.append_option(v.take());
        }
        ScanSlot::Int8(v) => {
            typed::<Int8Builder>(builder, "int8")?.append_option(v.take());
        }
        ScanSlot::Int16(v) => {
            typed::<Int16Builder>(builder, "int16")?.append_option(v.take());
        }
        ScanSlot::Int32(v) => {
            typed::<Int32Builder>(builder, "int32")?.append_option(v.take());
        }
        ScanSlot::Int64(v) => {
            typed::<Int64Builder>(builder, "int64")?.append_option(v.take());
        }
        ScanSlot::UInt8(v) => {
            typed::<UInt8Builder>(builder, "uint8")?.append_option(v.take());
        }
        ScanSlot::UInt16(v) => {
            typed::<UInt16Builder>(builder, "uint16")?.append_option(v.take());
        }
        ScanSlot::UInt32(v) => {
            typed::<UInt32Builder>(builder, "uint32")?.append_option(v.take());
        }
        ScanSlot::UInt64(v) => {
            typed::<UInt64Builder>(builder, "uint64")?.append_option(v.take());
        }
        ScanSlot::Float32(v) => {
            // The wide slot narrows here; precision loss is documented.
            if let Some(b) = builder.as_any_mut().downcast_mut::<Float32Builder>() {
                b.append_option(v.take().map(|f| f as f32));
            } else if let Some(b) = builder.as_any_mut().downcast_mut::<Float64Builder>() {
                b.append_option(v.take());
            } else {
                return Err(unexpected_builder("float"));
            }
        }
        ScanSlot::Float64(v) => {
            typed::<Float64Builder>(builder, "float")?.append_option(v.take());
        }
        ScanSlot::Utf8(v) => {
            typed::<StringBuilder>(builder, "string")?.append_option(v.take());
        }
        ScanSlot::Binary(v) => {
            typed::<BinaryBuilder>(builder, "binary")?.append_option(v.take());
        }
        ScanSlot::Instant(v) => match v.take() {
            Some(instant) => append_instant(builder, instant)?,
            None => append_null(builder),
        },
        ScanSlot::DecimalText(v) => match v.take() {
            Some(text) => append_decimal_text(builder, field, &text)?,
            None => append_null(builder),
        },
        ScanSlot::Dynamic(v) => match v.take() {
            Some(cell) => append_dynamic(builder, cell)?,
            None => append_null(builder),
        },
    }
    Ok(())
}

fn typed<'a, B: ArrayBuilder>(
    builder: &'a mut dyn ArrayBuilder,
    what: &str,
) -> Result<&'a mut B, PorterError> {
    builder
        .as_any_mut()
        .downcast_mut::<B>()
        .ok_or_else(|| unexpected_builder(what))
}

fn unexpected_builder(what: &str) -> PorterError {
    PorterError::Internal(format!("unexpected builder type for {what} value"))
}

fn append_null(builder: &mut dyn ArrayBuilder) {
    // Every concrete builder supports null appends through the generic
    // trait object via finish-time validity, but the trait itself has no
    // append_null; dispatch over the known builder set.
    let any = builder.as_any_mut();
    if let Some(b) = any.downcast_mut::<BooleanBuilder>() {
        b.append_null();
    } else if let Some(b) = any.downcast_mut::<Int8Builder>() {
        b.append_null();
    } else if let Some(b) = any.downcast_mut::<Int16Builder>() {
        b.append_null();
    } else if let Some(b) = any.downcast_mut::<Int32Builder>() {
        b.append_null();
    } else if let Some(b) = any.downcast_mut::<Int64Builder>() {
        b.append_null();
    } else if let Some(b) = any.downcast_mut::<UInt8Builder>() {
        b.append_null();
    } else if let Some(b) = any.downcast_mut::<UInt16Builder>() {
        b.append_null();
    } else if let Some(b) = any.downcast_mut::<UInt32Builder>() {
        b.append_null();
    } else if let Some(b) = any.downcast_mut::<UInt64Builder>() {
        b.append_null();
    } else if let Some(b) = any.downcast_mut::<Float32Builder>() {
        b.append_null();
    } else if let Some(b) = any.downcast_mut::<Float64Builder>() {
        b.append_null();
    } else if let Some(b) = any.downcast_mut::<StringBuilder>() {
        b.append_null();
    } else if let Some(b) = any.downcast_mut::<BinaryBuilder>() {
        b.append_null();
    } else if let Some(b) = any.downcast_mut::<Date32Builder>() {
        b.append_null();
    } else if let Some(b) = any.downcast_mut::<Date64Builder>() {
        b.append_null();
    } else if let Some(b) = any.downcast_mut::<Time32SecondBuilder>() {
        b.append_null();
    } else if let Some(b) = any.downcast_mut::<Time64MicrosecondBuilder>() {
        b.append_null();
    } else if let Some(b) = any.downcast_mut::<TimestampMicrosecondBuilder>() {
        b.append_null();
    } else if let Some(b) = any.downcast_mut::<Decimal128Builder>() {
        b.append_null();
    } else if let Some(b) = any.downcast_mut::<Decimal256Builder>() {
        b.append_null();
    }
}

/// Convert a wall-clock instant into the column's logical unit.
fn append_instant(
    builder: &mut dyn ArrayBuilder,
    instant: NaiveDateTime,
) -> Result<(), PorterError> {
    let any = builder.as_any_mut();
    if let Some(b) = any.downcast_mut::<Date32Builder>() {
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).expect("unix epoch date");
        let days = instant.date().signed_duration_since(epoch).num_days();
        b.append_value(days as i32);
    } else if let Some(b) = any.downcast_mut::<Date64Builder>() {
        b.append_value(instant.and_utc().timestamp_millis());
    } else if let Some(b) = any.downcast_mut::<Time32SecondBuilder>() {
        b.append_value(instant.time().num_seconds_from_midnight() as i32);
    } else if let Some(b) = any.downcast_mut::<Time64MicrosecondBuilder>() {
        let time = instant.time();
        let micros = time.num_seconds_from_midnight() as i64 * 1_000_000
            + (time.nanosecond() / 1_000) as i64;
        b.append_value(micros);
    } else if let Some(b) = any.downcast_mut::<TimestampMicrosecondBuilder>() {
        b.append_value(instant.and_utc().timestamp_micros());
    } else {
        return Err(unexpected_builder("time"));
    }
    Ok(())
}

fn append_decimal_text(
    builder: &mut dyn ArrayBuilder,
    field: &Field,
    text: &str,
) -> Result<(), PorterError> {
    match field.data_type() {
        DataType::Decimal128(_, scale) => {
            let digits = scale_decimal_digits(text, *scale)?;
            let value: i128 = digits.parse().map_err(|_| {
                PorterError::QueryFailed(format!("decimal out of range: {text}"))
            })?;
            typed::<Decimal128Builder>(builder, "decimal")?.append_value(value);
        }
        DataType::Decimal256(_, scale) => {
            let digits = scale_decimal_digits(text, *scale)?;
            let value = i256::from_string(&digits).ok_or_else(|| {
                PorterError::QueryFailed(format!("decimal out of range: {text}"))
            })?;
            typed::<Decimal256Builder>(builder, "decimal")?.append_value(value);
        }
        // Precision/scale unknown: the field fell back to text.
        DataType::Utf8 => {
            typed::<StringBuilder>(builder, "decimal")?.append_value(text);
        }
        _ => return Err(unexpected_builder("decimal")),
    }
    Ok(())
}

/// Rescale a textual decimal (`-12.345`) to an unscaled integer string
/// for the target scale, truncating extra fractional digits.
fn scale_decimal_digits(text: &str, scale: i8) -> Result<String, PorterError> {
    let text = text.trim();
    let (sign, rest) = match text.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", text.strip_prefix('+').unwrap_or(text)),
    };
    let (int_part, frac_part) = match rest.split_once('.') {
        Some((i, f)) => (i, f),
        None => (rest, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(PorterError::QueryFailed(format!("malformed decimal: {text}")));
    }
    if !int_part.chars().all(|c| c.is_ascii_digit())
        || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        return Err(PorterError::QueryFailed(format!("malformed decimal: {text}")));
    }
    let scale = scale.max(0) as usize;
    let mut frac: String = frac_part.chars().take(scale).collect();
    while frac.len() < scale {
        frac.push('0');
    }
    let mut digits = format!("{sign}{int_part}{frac}");
    if digits == sign {
        digits.push('0');
    }
    Ok(digits)
}

/// Late-bound dispatch from a dynamic cell to a typed append. The first
/// non-null value must be assignable to one of the concrete paths; a
/// string builder additionally accepts any cell rendered as text.
fn append_dynamic(builder: &mut dyn ArrayBuilder, cell: CellValue) -> Result<(), PorterError> {
    match cell {
        CellValue::Null => {
            append_null(builder);
            Ok(())
        }
        CellValue::Bool(v) => {
            if let Some(b) = builder.as_any_mut().downcast_mut::<BooleanBuilder>() {
                b.append_value(v);
                Ok(())
            } else {
                append_rendered(builder, v.to_string())
            }
        }
        CellValue::Int8(v) => append_dynamic_int(builder, v as i64),
        CellValue::Int16(v) => append_dynamic_int(builder, v as i64),
        CellValue::Int32(v) => append_dynamic_int(builder, v as i64),
        CellValue::Int64(v) => append_dynamic_int(builder, v),
        CellValue::UInt8(v) => append_dynamic_int(builder, v as i64),
        CellValue::UInt16(v) => append_dynamic_int(builder, v as i64),
        CellValue::UInt32(v) => append_dynamic_int(builder, v as i64),
        CellValue::UInt64(v) => {
            if let Some(b) = builder.as_any_mut().downcast_mut::<UInt64Builder>() {
                b.append_value(v);
                Ok(())
            } else {
                append_rendered(builder, v.to_string())
            }
        }
        CellValue::Float32(v) => append_dynamic_float(builder, v as f64),
        CellValue::Float64(v) => append_dynamic_float(builder, v),
        CellValue::Text(v) => {
            if let Some(b) = builder.as_any_mut().downcast_mut::<StringBuilder>() {
                b.append_value(v);
                Ok(())
            } else {
                Err(unexpected_builder("dynamic string"))
            }
        }
        CellValue::Blob(v) => {
            if let Some(b) = builder.as_any_mut().downcast_mut::<BinaryBuilder>() {
                b.append_value(&v);
                Ok(())
            } else {
                Err(unexpected_builder("dynamic binary"))
            }
        }
        CellValue::Instant(v) => append_instant(builder, v),
    }
}

fn append_dynamic_int(builder: &mut dyn ArrayBuilder, v: i64) -> Result<(), PorterError> {
    if let Some(b) = builder.as_any_mut().downcast_mut::<Int64Builder>() {
        b.append_value(v);
        Ok(())
    } else {
        append_rendered(builder, v.to_string())
    }
}

fn append_dynamic_float(builder: &mut dyn ArrayBuilder, v: f64) -> Result<(), PorterError> {
    if let Some(b) = builder.as_any_mut().downcast_mut::<Float64Builder>() {
        b.append_value(v);
        Ok(())
    } else {
        append_rendered(builder, v.to_string())
    }
}

fn append_rendered(builder: &mut dyn ArrayBuilder, text: String) -> Result<(), PorterError> {
    if let Some(b) = builder.as_any_mut().downcast_mut::<StringBuilder>() {
        b.append_value(text);
        Ok(())
    } else {
        Err(unexpected_builder("dynamic"))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use arrow_array::{Array, Date32Array, Int64Array, StringArray, TimestampMicrosecondArray};
    use arrow_schema::TimeUnit;
    use chrono::NaiveDate;

    use super::*;
    use crate::types::ColumnDesc;

    /// In-memory cursor used to drive the reader without a backend.
    struct VecCursor {
        columns: Vec<ColumnDesc>,
        rows: VecDeque<Vec<CellValue>>,
        trailing_error: Option<PorterError>,
        closed: usize,
    }

    impl VecCursor {
        fn new(columns: Vec<ColumnDesc>, rows: Vec<Vec<CellValue>>) -> Self {
            Self {
                columns,
                rows: rows.into(),
                trailing_error: None,
                closed: 0,
            }
        }
    }

    impl RowCursor for VecCursor {
        fn columns(&self) -> &[ColumnDesc] {
            &self.columns
        }

        fn next_row(&mut self, dest: &mut [ScanSlot]) -> Result<bool, PorterError> {
            match self.rows.pop_front() {
                Some(cells) => {
                    for (slot, cell) in dest.iter_mut().zip(cells) {
                        slot.store(cell)?;
                    }
                    Ok(true)
                }
                None => match self.trailing_error.take() {
                    Some(err) => Err(err),
                    None => Ok(false),
                },
            }
        }

        fn close(&mut self) {
            self.closed += 1;
        }
    }

    fn id_rows(n: i64) -> Vec<Vec<CellValue>> {
        (1..=n).map(|i| vec![CellValue::Int64(i)]).collect()
    }

    fn id_column() -> Vec<ColumnDesc> {
        vec![ColumnDesc::new("id", "BIGINT", false)]
    }

    #[test]
    fn batch_boundary_emits_ceil_n_over_b_batches_in_order() -> anyhow::Result<()> {
        let cursor = VecCursor::new(id_column(), id_rows(7));
        let mut reader = BatchReader::new(Box::new(cursor))?;
        reader.set_batch_size(3);

        let mut sizes = Vec::new();
        let mut ids = Vec::new();
        while reader.advance() {
            let batch = reader.current().expect("current batch");
            sizes.push(batch.num_rows());
            let col = batch
                .column(0)
                .as_any()
                .downcast_ref::<Int64Array>()
                .expect("int64 column");
            ids.extend(col.iter().flatten());
        }
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7]);
        assert!(reader.error().is_none());
        Ok(())
    }

    #[test]
    fn empty_cursor_is_clean_eof() -> anyhow::Result<()> {
        let cursor = VecCursor::new(id_column(), Vec::new());
        let mut reader = BatchReader::new(Box::new(cursor))?;
        assert!(!reader.advance());
        assert!(reader.error().is_none());
        assert!(reader.current().is_none());
        Ok(())
    }

    #[test]
    fn null_propagation_sets_validity_bits() -> anyhow::Result<()> {
        let columns = vec![
            ColumnDesc::new("a", "BIGINT", true),
            ColumnDesc::new("b", "VARCHAR", true),
        ];
        let rows = vec![
            vec![CellValue::Int64(1), CellValue::Text("x".into())],
            vec![CellValue::Null, CellValue::Text("y".into())],
            vec![CellValue::Int64(2), CellValue::Null],
        ];
        let mut reader = BatchReader::new(Box::new(VecCursor::new(columns, rows)))?;
        assert!(reader.advance());
        let batch = reader.current().expect("batch");

        let a = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("a");
        assert_eq!(
            (0..3).map(|i| a.is_valid(i)).collect::<Vec<_>>(),
            vec![true, false, true]
        );
        assert_eq!(a.value(0), 1);
        assert_eq!(a.value(2), 2);

        let b = batch
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("b");
        assert_eq!(
            (0..3).map(|i| b.is_valid(i)).collect::<Vec<_>>(),
            vec![true, true, false]
        );
        assert_eq!(b.value(0), "x");
        assert_eq!(b.value(1), "y");
        Ok(())
    }

    #[test]
    fn current_batch_outlives_reader_release() -> anyhow::Result<()> {
        let cursor = VecCursor::new(id_column(), id_rows(4));
        let mut reader = BatchReader::new(Box::new(cursor))?;
        assert!(reader.advance());
        let held = reader.current().expect("batch");
        assert!(!reader.advance()); // reader moved past the batch
        reader.release();

        let col = held
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64 column");
        assert_eq!(col.len(), 4);
        assert_eq!(col.value(3), 4);
        Ok(())
    }

    #[test]
    fn dynamic_string_into_int_builder_is_internal_error() -> anyhow::Result<()> {
        // A schema that promises Int64 paired with a cursor whose column
        // resolved to the dynamic slot; the first non-null value is text.
        let schema = SchemaRef::new(Schema::new(vec![Field::new(
            "v",
            DataType::Int64,
            true,
        )]));
        let cursor = VecCursor::new(
            vec![ColumnDesc::new("v", "JSON", true)],
            vec![vec![CellValue::Text("not a number".into())]],
        );
        let mut reader = BatchReader::new_with_schema(schema, Box::new(cursor));
        // force the dynamic slot the mapper would have chosen
        reader.slots = vec![ScanSlot::Dynamic(None)];

        assert!(!reader.advance());
        let err = reader.error().expect("error");
        assert!(err.to_string().contains("unexpected builder type"));
        Ok(())
    }

    #[test]
    fn trailing_cursor_error_surfaces_after_partial_reads() -> anyhow::Result<()> {
        let mut cursor = VecCursor::new(id_column(), id_rows(2));
        cursor.trailing_error = Some(PorterError::QueryFailed("connection reset".into()));
        let mut reader = BatchReader::new(Box::new(cursor))?;
        reader.set_batch_size(10);

        // rows scanned before the failure are lost with the aborted batch
        assert!(!reader.advance());
        assert!(matches!(reader.error(), Some(PorterError::QueryFailed(_))));
        Ok(())
    }

    #[test]
    fn temporal_appends_convert_to_logical_units() -> anyhow::Result<()> {
        let columns = vec![
            ColumnDesc::new("d", "DATE", true),
            ColumnDesc::new("ts", "TIMESTAMP", true),
        ];
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let instant = day.and_hms_micro_opt(10, 20, 30, 123_456).unwrap();
        let rows = vec![vec![
            CellValue::Instant(day.and_hms_opt(0, 0, 0).unwrap()),
            CellValue::Instant(instant),
        ]];
        let mut reader = BatchReader::new(Box::new(VecCursor::new(columns, rows)))?;
        assert!(reader.advance());
        let batch = reader.current().expect("batch");

        assert_eq!(batch.schema().field(0).data_type(), &DataType::Date32);
        assert_eq!(
            batch.schema().field(1).data_type(),
            &DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
        );

        let d = batch
            .column(0)
            .as_any()
            .downcast_ref::<Date32Array>()
            .expect("date32");
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
        assert_eq!(d.value(0) as i64, day.signed_duration_since(epoch).num_days());

        let ts = batch
            .column(1)
            .as_any()
            .downcast_ref::<TimestampMicrosecondArray>()
            .expect("timestamp");
        assert_eq!(ts.value(0), instant.and_utc().timestamp_micros());
        Ok(())
    }

    #[test]
    fn decimal_text_parses_onto_scaled_builder() -> anyhow::Result<()> {
        let columns = vec![ColumnDesc::new("d", "DECIMAL(10,2)", true)];
        let rows = vec![
            vec![CellValue::Text("12.34".into())],
            vec![CellValue::Text("-0.5".into())],
            vec![CellValue::Null],
        ];
        let mut reader = BatchReader::new(Box::new(VecCursor::new(columns, rows)))?;
        assert!(reader.advance());
        let batch = reader.current().expect("batch");
        let col = batch
            .column(0)
            .as_any()
            .downcast_ref::<arrow_array::Decimal128Array>()
            .expect("decimal128");
        assert_eq!(col.value(0), 1234);
        assert_eq!(col.value(1), -50);
        assert!(col.is_null(2));
        Ok(())
    }

    #[test]
    fn float32_narrowing_from_wide_slot() -> anyhow::Result<()> {
        let columns = vec![ColumnDesc::new("f", "FLOAT", true)];
        let rows = vec![vec![CellValue::Float64(1.5)]];
        let mut reader = BatchReader::new(Box::new(VecCursor::new(columns, rows)))?;
        assert!(reader.advance());
        let batch = reader.current().expect("batch");
        let col = batch
            .column(0)
            .as_any()
            .downcast_ref::<arrow_array::Float32Array>()
            .expect("float32");
        assert_eq!(col.value(0), 1.5f32);
        Ok(())
    }

    #[test]
    fn last_release_closes_cursor_exactly_once() -> anyhow::Result<()> {
        let cursor = VecCursor::new(id_column(), id_rows(1));
        let mut reader = BatchReader::new(Box::new(cursor))?;
        reader.retain();
        reader.release();
        assert!(reader.cursor.is_some(), "cursor stays open while retained");
        reader.release();
        assert!(reader.cursor.is_none(), "last release closes the cursor");
        Ok(())
    }

    #[test]
    #[should_panic(expected = "refcount reached zero")]
    fn release_beyond_zero_panics() {
        let cursor = VecCursor::new(id_column(), Vec::new());
        let mut reader = BatchReader::new(Box::new(cursor)).expect("reader");
        reader.release();
        reader.release();
    }

    #[test]
    fn set_batch_size_ignores_zero() -> anyhow::Result<()> {
        let cursor = VecCursor::new(id_column(), id_rows(2));
        let mut reader = BatchReader::new(Box::new(cursor))?;
        reader.set_batch_size(0);
        assert!(reader.advance());
        assert_eq!(reader.current().expect("batch").num_rows(), 2);
        Ok(())
    }

    #[test]
    fn scale_decimal_digits_pads_and_truncates() -> anyhow::Result<()> {
        assert_eq!(scale_decimal_digits("12.34", 2)?, "1234");
        assert_eq!(scale_decimal_digits("12.3", 2)?, "1230");
        assert_eq!(scale_decimal_digits("12.345", 2)?, "1234");
        assert_eq!(scale_decimal_digits("-7", 3)?, "-7000");
        assert!(scale_decimal_digits("abc", 2).is_err());
        Ok(())
    }
}
