//! Decoding client-sent flight data into backend values.

use arrow_array::{
    Array, ArrayRef, BinaryArray, BooleanArray, Date32Array, Float32Array, Float64Array,
    Int16Array, Int32Array, Int64Array, Int8Array, LargeBinaryArray, LargeStringArray,
    RecordBatch, StringArray, TimestampMicrosecondArray, UInt16Array, UInt32Array, UInt64Array,
    UInt8Array,
};
use arrow_flight::decode::FlightRecordBatchStream;
use arrow_flight::sql::server::PeekableFlightDataStream;
use arrow_ipc::writer::{DictionaryTracker, IpcDataGenerator, IpcWriteOptions};
use arrow_schema::DataType;
use chrono::DateTime;
use futures::{StreamExt, TryStreamExt};
use tonic::{Request, Status};

use crate::error::PorterError;
use crate::types::CellValue;

use super::PorterFlightSqlService;

impl PorterFlightSqlService {
    /// Drain a DoPut stream into parameter rows. An empty stream yields a
    /// single empty parameter set so parameterless execution still runs
    /// once.
    pub(crate) async fn collect_parameter_sets(
        request: Request<PeekableFlightDataStream>,
    ) -> Result<Vec<Vec<CellValue>>, Status> {
        let batches = Self::collect_batches(request).await?;
        let mut params = Vec::new();
        for batch in &batches {
            params.extend(Self::record_batch_to_params(batch).map_err(Self::status_from_error)?);
        }
        if params.is_empty() {
            params.push(Vec::new());
        }
        Ok(params)
    }

    /// Drain a DoPut stream into raw record batches (bulk ingest path).
    pub(crate) async fn collect_batches(
        request: Request<PeekableFlightDataStream>,
    ) -> Result<Vec<RecordBatch>, Status> {
        let stream = request.into_inner();
        let mapped =
            stream.map_err(|status| arrow_flight::error::FlightError::Tonic(Box::new(status)));
        let mut record_stream = FlightRecordBatchStream::new_from_flight_data(mapped);

        let mut batches = Vec::new();
        while let Some(batch) = record_stream.next().await {
            let batch = batch.map_err(|err| match err {
                arrow_flight::error::FlightError::Tonic(status) => *status,
                other => Status::internal(format!("flight decode error: {other}")),
            })?;
            batches.push(batch);
        }
        Ok(batches)
    }

    fn record_batch_to_params(batch: &RecordBatch) -> Result<Vec<Vec<CellValue>>, PorterError> {
        let row_count = batch.num_rows();
        let column_count = batch.num_columns();
        let mut rows = vec![Vec::with_capacity(column_count); row_count];

        for col_idx in 0..column_count {
            push_column_values(batch.column(col_idx), &mut rows)?;
        }
        Ok(rows)
    }

    pub(crate) fn schema_to_ipc_bytes(
        schema: &arrow_schema::Schema,
    ) -> Result<Vec<u8>, PorterError> {
        let data_gen = IpcDataGenerator::default();
        let mut dict_tracker = DictionaryTracker::new(false);
        let write_options = IpcWriteOptions::default();
        let encoded = data_gen.schema_to_bytes_with_dictionary_tracker(
            schema,
            &mut dict_tracker,
            &write_options,
        );
        let mut buffer = vec![];
        arrow_ipc::writer::write_message(&mut buffer, encoded, &write_options)
            .map_err(PorterError::Arrow)?;
        Ok(buffer)
    }
}

fn push_column_values(array: &ArrayRef, rows: &mut [Vec<CellValue>]) -> Result<(), PorterError> {
    match array.data_type() {
        DataType::Null => {
            for row in rows.iter_mut() {
                row.push(CellValue::Null);
            }
        }
        DataType::Boolean => {
            push_values::<BooleanArray>(array, rows, |arr, idx| CellValue::Bool(arr.value(idx)))?;
        }
        DataType::Int8 => {
            push_values::<Int8Array>(array, rows, |arr, idx| CellValue::Int8(arr.value(idx)))?;
        }
        DataType::Int16 => {
            push_values::<Int16Array>(array, rows, |arr, idx| CellValue::Int16(arr.value(idx)))?;
        }
        DataType::Int32 => {
            push_values::<Int32Array>(array, rows, |arr, idx| CellValue::Int32(arr.value(idx)))?;
        }
        DataType::Int64 => {
            push_values::<Int64Array>(array, rows, |arr, idx| CellValue::Int64(arr.value(idx)))?;
        }
        DataType::UInt8 => {
            push_values::<UInt8Array>(array, rows, |arr, idx| CellValue::UInt8(arr.value(idx)))?;
        }
        DataType::UInt16 => {
            push_values::<UInt16Array>(array, rows, |arr, idx| {
                CellValue::UInt16(arr.value(idx))
            })?;
        }
        DataType::UInt32 => {
            push_values::<UInt32Array>(array, rows, |arr, idx| {
                CellValue::UInt32(arr.value(idx))
            })?;
        }
        DataType::UInt64 => {
            push_values::<UInt64Array>(array, rows, |arr, idx| {
                CellValue::UInt64(arr.value(idx))
            })?;
        }
        DataType::Float32 => {
            push_values::<Float32Array>(array, rows, |arr, idx| {
                CellValue::Float32(arr.value(idx))
            })?;
        }
        DataType::Float64 => {
            push_values::<Float64Array>(array, rows, |arr, idx| {
                CellValue::Float64(arr.value(idx))
            })?;
        }
        DataType::Utf8 => {
            push_values::<StringArray>(array, rows, |arr, idx| {
                CellValue::Text(arr.value(idx).to_string())
            })?;
        }
        DataType::LargeUtf8 => {
            push_values::<LargeStringArray>(array, rows, |arr, idx| {
                CellValue::Text(arr.value(idx).to_string())
            })?;
        }
        DataType::Binary => {
            push_values::<BinaryArray>(array, rows, |arr, idx| {
                CellValue::Blob(arr.value(idx).to_vec())
            })?;
        }
        DataType::LargeBinary => {
            push_values::<LargeBinaryArray>(array, rows, |arr, idx| {
                CellValue::Blob(arr.value(idx).to_vec())
            })?;
        }
        DataType::Date32 => {
            push_values::<Date32Array>(array, rows, |arr, idx| {
                let days = arr.value(idx) as i64;
                let instant = DateTime::from_timestamp(days * 86_400, 0)
                    .map(|dt| dt.naive_utc())
                    .unwrap_or_default();
                CellValue::Instant(instant)
            })?;
        }
        DataType::Timestamp(arrow_schema::TimeUnit::Microsecond, _) => {
            push_values::<TimestampMicrosecondArray>(array, rows, |arr, idx| {
                let instant = DateTime::from_timestamp_micros(arr.value(idx))
                    .map(|dt| dt.naive_utc())
                    .unwrap_or_default();
                CellValue::Instant(instant)
            })?;
        }
        other => {
            return Err(PorterError::UnsupportedType(format!(
                "parameter of type {other}"
            )))
        }
    }
    Ok(())
}

fn push_values<T: Array + 'static>(
    array: &ArrayRef,
    rows: &mut [Vec<CellValue>],
    mut value_fn: impl FnMut(&T, usize) -> CellValue,
) -> Result<(), PorterError> {
    let arr = array.as_any().downcast_ref::<T>().ok_or_else(|| {
        PorterError::Internal(format!("parameter array downcast for {}", array.data_type()))
    })?;
    for (row_idx, row) in rows.iter_mut().enumerate() {
        if arr.is_null(row_idx) {
            row.push(CellValue::Null);
        } else {
            row.push(value_fn(arr, row_idx));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow_schema::{Field, Schema};

    use super::*;

    #[test]
    fn record_batch_params_preserve_nulls_and_order() -> anyhow::Result<()> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, true),
            Field::new("b", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![Some(1), None])) as ArrayRef,
                Arc::new(StringArray::from(vec![None, Some("x")])) as ArrayRef,
            ],
        )?;
        let rows = PorterFlightSqlService::record_batch_to_params(&batch)?;
        assert_eq!(
            rows,
            vec![
                vec![CellValue::Int64(1), CellValue::Null],
                vec![CellValue::Null, CellValue::Text("x".into())],
            ]
        );
        Ok(())
    }

    #[test]
    fn schema_ipc_bytes_are_nonempty() -> anyhow::Result<()> {
        let schema = Schema::new(vec![Field::new("id", DataType::Int64, false)]);
        let bytes = PorterFlightSqlService::schema_to_ipc_bytes(&schema)?;
        assert!(!bytes.is_empty());
        Ok(())
    }
}
