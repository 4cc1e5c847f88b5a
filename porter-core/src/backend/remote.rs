//! Remote distributed engine driver (ClickHouse-compatible HTTP).
//!
//! Queries go over the engine's HTTP interface with
//! `JSONCompactEachRowWithNamesAndTypes`: the first two response lines
//! carry column names and declared types, every following line is one row
//! as a JSON array. The response body is read line by line, so a slow
//! consumer holds back the socket instead of buffering the result.

use std::io::{BufRead, BufReader, Lines, Read};

use arrow_array::{
    Array, BinaryArray, BooleanArray, Date32Array, Float32Array, Float64Array, Int16Array,
    Int32Array, Int64Array, Int8Array, RecordBatch, StringArray, TimestampMicrosecondArray,
    UInt16Array, UInt32Array, UInt64Array, UInt8Array,
};
use arrow_schema::{DataType, TimeUnit};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::backend::dsn::{BackendKind, Dsn};
use crate::backend::{BackendConn, Connector, RowCursor};
use crate::error::PorterError;
use crate::types::{map_column, CellValue, ColumnDesc, ScanSlot};

pub struct RemoteConnector {
    identity: String,
    base_url: String,
    database: String,
    user: Option<String>,
    password: Option<String>,
}

impl RemoteConnector {
    pub fn new(dsn: Dsn) -> Result<Self, PorterError> {
        let identity = dsn.identity();
        match dsn {
            Dsn::Remote {
                host,
                port,
                database,
                user,
                password,
            } => Ok(Self {
                identity,
                base_url: format!("http://{host}:{port}"),
                database,
                user,
                password,
            }),
            other => Err(PorterError::Internal(format!(
                "embedded DSN {other:?} routed to remote driver"
            ))),
        }
    }
}

impl Connector for RemoteConnector {
    fn connect(&self) -> Result<Box<dyn BackendConn>, PorterError> {
        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(|err| PorterError::Unavailable(err.to_string()))?;
        let mut conn = RemoteConn {
            client,
            base_url: self.base_url.clone(),
            database: self.database.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
        };
        conn.ping()?;
        debug!(identity = %self.identity, "opened remote connection");
        Ok(Box::new(conn))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn identity(&self) -> &str {
        &self.identity
    }
}

pub struct RemoteConn {
    client: reqwest::blocking::Client,
    base_url: String,
    database: String,
    user: Option<String>,
    password: Option<String>,
}

impl RemoteConn {
    fn request(&self, sql: String) -> Result<reqwest::blocking::Response, PorterError> {
        let mut builder = self
            .client
            .post(&self.base_url)
            .query(&[("database", self.database.as_str())])
            .body(sql);
        if let Some(user) = &self.user {
            builder = builder.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.password {
            builder = builder.header("X-ClickHouse-Key", password);
        }
        let resp = builder.send()?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(PorterError::QueryFailed(format!(
                "remote engine returned {status}: {}",
                body.trim()
            )));
        }
        Ok(resp)
    }

    fn open_cursor(&self, sql: String) -> Result<RemoteCursor, PorterError> {
        let resp = self.request(sql)?;
        let mut lines = BufReader::new(BodyReader(resp)).lines();

        let names: Vec<String> = read_header_line(&mut lines)?;
        let types: Vec<String> = read_header_line(&mut lines)?;
        if names.len() != types.len() {
            return Err(PorterError::Internal(
                "remote header rows disagree on column count".to_string(),
            ));
        }

        let mut columns = Vec::with_capacity(names.len());
        let mut field_types = Vec::with_capacity(names.len());
        for (name, decl) in names.into_iter().zip(types) {
            let nullable = decl.starts_with("Nullable");
            let desc = ColumnDesc::new(name, decl, nullable);
            let (field, _) = map_column(&desc)?;
            field_types.push(field.data_type().clone());
            columns.push(desc);
        }

        Ok(RemoteCursor {
            columns,
            field_types,
            lines: Some(lines),
        })
    }
}

/// Newtype so the cursor owns a plain `Read` instead of naming the
/// response type in its fields.
struct BodyReader(reqwest::blocking::Response);

impl Read for BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

impl BackendConn for RemoteConn {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn query(
        &mut self,
        sql: &str,
        params: &[CellValue],
    ) -> Result<Box<dyn RowCursor>, PorterError> {
        let bound = bind_positional(sql, params)?;
        let trimmed = bound.trim_end_matches(';');
        let cursor =
            self.open_cursor(format!("{trimmed} FORMAT JSONCompactEachRowWithNamesAndTypes"))?;
        Ok(Box::new(cursor))
    }

    fn execute(&mut self, sql: &str, params: &[CellValue]) -> Result<i64, PorterError> {
        let bound = bind_positional(sql, params)?;
        let resp = self.request(bound)?;
        let written = resp
            .headers()
            .get("x-clickhouse-summary")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| serde_json::from_str::<JsonValue>(s).ok())
            .and_then(|summary| {
                summary
                    .get("written_rows")
                    .and_then(|v| v.as_str().map(str::to_string).or_else(|| v.as_i64().map(|n| n.to_string())))
            })
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        Ok(written)
    }

    fn describe_columns(&mut self, sql: &str) -> Result<Vec<ColumnDesc>, PorterError> {
        let trimmed = sql.trim_end_matches(';');
        let cursor = self.open_cursor(format!(
            "SELECT * FROM ({trimmed}) LIMIT 0 FORMAT JSONCompactEachRowWithNamesAndTypes"
        ))?;
        Ok(cursor.columns)
    }

    fn ingest(&mut self, table: &str, batches: &[RecordBatch]) -> Result<i64, PorterError> {
        let mut body = String::new();
        let mut total_rows = 0i64;
        for batch in batches {
            total_rows += batch.num_rows() as i64;
            render_json_rows(batch, &mut body)?;
        }
        let sql = format!("INSERT INTO {table} FORMAT JSONCompactEachRow\n{body}");
        self.request(sql)?;
        debug!(rows = total_rows, table = %table, "ingested batches over http");
        Ok(total_rows)
    }

    fn begin(&mut self) -> Result<(), PorterError> {
        self.execute("BEGIN TRANSACTION", &[]).map(|_| ())
    }

    fn commit(&mut self) -> Result<(), PorterError> {
        self.execute("COMMIT", &[]).map(|_| ())
    }

    fn rollback(&mut self) -> Result<(), PorterError> {
        self.execute("ROLLBACK", &[]).map(|_| ())
    }

    fn ping(&mut self) -> Result<(), PorterError> {
        let url = format!("{}/ping", self.base_url);
        let resp = self.client.get(&url).send()?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(PorterError::Unavailable(format!(
                "remote ping returned {}",
                resp.status()
            )))
        }
    }
}

struct RemoteCursor {
    columns: Vec<ColumnDesc>,
    field_types: Vec<DataType>,
    lines: Option<Lines<BufReader<BodyReader>>>,
}

impl RowCursor for RemoteCursor {
    fn columns(&self) -> &[ColumnDesc] {
        &self.columns
    }

    fn next_row(&mut self, dest: &mut [ScanSlot]) -> Result<bool, PorterError> {
        let Some(lines) = self.lines.as_mut() else {
            return Ok(false);
        };
        let line = loop {
            match lines.next() {
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => break line,
                Some(Err(err)) => {
                    self.lines = None;
                    return Err(PorterError::Unavailable(format!(
                        "remote stream interrupted: {err}"
                    )));
                }
                None => {
                    self.lines = None;
                    return Ok(false);
                }
            }
        };

        let row: Vec<JsonValue> = serde_json::from_str(&line).map_err(|err| {
            PorterError::QueryFailed(format!("malformed remote row: {err}"))
        })?;
        if row.len() != dest.len() {
            return Err(PorterError::Internal(format!(
                "row has {} cells, expected {}",
                row.len(),
                dest.len()
            )));
        }
        for ((slot, value), data_type) in dest.iter_mut().zip(row).zip(&self.field_types) {
            slot.store(json_to_cell(value, data_type)?)?;
        }
        Ok(true)
    }

    fn close(&mut self) {
        self.lines = None;
    }
}

fn read_header_line(
    lines: &mut Lines<BufReader<BodyReader>>,
) -> Result<Vec<String>, PorterError> {
    let line = lines
        .next()
        .transpose()
        .map_err(|err| PorterError::Unavailable(format!("remote stream interrupted: {err}")))?
        .ok_or_else(|| {
            PorterError::Internal("remote response missing header rows".to_string())
        })?;
    serde_json::from_str(&line)
        .map_err(|err| PorterError::Internal(format!("malformed remote header: {err}")))
}

/// Convert one JSON cell into the typed cell the mapped field expects.
fn json_to_cell(value: JsonValue, data_type: &DataType) -> Result<CellValue, PorterError> {
    if value.is_null() {
        return Ok(CellValue::Null);
    }
    let cell = match data_type {
        DataType::Boolean => CellValue::Bool(
            value
                .as_bool()
                .or_else(|| value.as_i64().map(|n| n != 0))
                .ok_or_else(|| mismatch("bool", &value))?,
        ),
        DataType::Int8 => CellValue::Int8(as_i64(&value)? as i8),
        DataType::Int16 => CellValue::Int16(as_i64(&value)? as i16),
        DataType::Int32 => CellValue::Int32(as_i64(&value)? as i32),
        DataType::Int64 => CellValue::Int64(as_i64(&value)?),
        DataType::UInt8 => CellValue::UInt8(as_u64(&value)? as u8),
        DataType::UInt16 => CellValue::UInt16(as_u64(&value)? as u16),
        DataType::UInt32 => CellValue::UInt32(as_u64(&value)? as u32),
        DataType::UInt64 => CellValue::UInt64(as_u64(&value)?),
        DataType::Float32 | DataType::Float64 => CellValue::Float64(
            value
                .as_f64()
                .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                .ok_or_else(|| mismatch("float", &value))?,
        ),
        DataType::Utf8 => match value {
            JsonValue::String(s) => CellValue::Text(s),
            other => CellValue::Text(other.to_string()),
        },
        DataType::Binary => CellValue::Blob(
            value
                .as_str()
                .map(|s| s.as_bytes().to_vec())
                .ok_or_else(|| mismatch("binary", &value))?,
        ),
        DataType::Date32 | DataType::Date64 => {
            let text = value.as_str().ok_or_else(|| mismatch("date", &value))?;
            let date = NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .map_err(|err| PorterError::QueryFailed(format!("bad date {text:?}: {err}")))?;
            CellValue::Instant(date.and_hms_opt(0, 0, 0).expect("midnight"))
        }
        DataType::Time32(_) | DataType::Time64(_) => {
            let text = value.as_str().ok_or_else(|| mismatch("time", &value))?;
            let time = NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
                .map_err(|err| PorterError::QueryFailed(format!("bad time {text:?}: {err}")))?;
            let date = NaiveDate::from_ymd_opt(1970, 1, 1).expect("unix epoch date");
            CellValue::Instant(date.and_time(time))
        }
        DataType::Timestamp(_, _) => {
            let instant = match &value {
                JsonValue::String(text) => parse_remote_timestamp(text)?,
                JsonValue::Number(n) => {
                    let secs = n.as_i64().ok_or_else(|| mismatch("timestamp", &value))?;
                    DateTime::from_timestamp(secs, 0)
                        .ok_or_else(|| mismatch("timestamp", &value))?
                        .naive_utc()
                }
                other => return Err(mismatch("timestamp", other)),
            };
            CellValue::Instant(instant)
        }
        DataType::Decimal128(_, _) | DataType::Decimal256(_, _) => match value {
            JsonValue::String(s) => CellValue::Text(s),
            other => CellValue::Text(other.to_string()),
        },
        other => {
            return Err(PorterError::UnsupportedType(format!(
                "remote scan into {other:?}"
            )))
        }
    };
    Ok(cell)
}

fn parse_remote_timestamp(text: &str) -> Result<NaiveDateTime, PorterError> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .map_err(|err| PorterError::QueryFailed(format!("bad timestamp {text:?}: {err}")))
}

fn as_i64(value: &JsonValue) -> Result<i64, PorterError> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| mismatch("integer", value))
}

fn as_u64(value: &JsonValue) -> Result<u64, PorterError> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| mismatch("unsigned integer", value))
}

fn mismatch(expected: &str, value: &JsonValue) -> PorterError {
    PorterError::QueryFailed(format!("expected {expected} cell, got {value}"))
}

/// Inline positional `?` parameters as engine literals. Placeholders
/// inside string literals and quoted identifiers are left alone.
fn bind_positional(sql: &str, params: &[CellValue]) -> Result<String, PorterError> {
    if params.is_empty() {
        return Ok(sql.to_string());
    }
    let mut out = String::with_capacity(sql.len() + params.len() * 8);
    let mut next_param = params.iter();
    let mut chars = sql.chars();
    let mut in_quote: Option<char> = None;
    while let Some(ch) = chars.next() {
        match in_quote {
            Some(q) => {
                out.push(ch);
                if ch == q {
                    in_quote = None;
                }
            }
            None => match ch {
                '\'' | '"' | '`' => {
                    in_quote = Some(ch);
                    out.push(ch);
                }
                '?' => {
                    let param = next_param.next().ok_or_else(|| {
                        PorterError::InvalidArgument(
                            "more placeholders than bound parameters".to_string(),
                        )
                    })?;
                    out.push_str(&render_literal(param));
                }
                other => out.push(other),
            },
        }
    }
    if next_param.next().is_some() {
        return Err(PorterError::InvalidArgument(
            "more bound parameters than placeholders".to_string(),
        ));
    }
    Ok(out)
}

fn render_literal(cell: &CellValue) -> String {
    match cell {
        CellValue::Null => "NULL".to_string(),
        CellValue::Bool(b) => if *b { "true" } else { "false" }.to_string(),
        CellValue::Int8(n) => n.to_string(),
        CellValue::Int16(n) => n.to_string(),
        CellValue::Int32(n) => n.to_string(),
        CellValue::Int64(n) => n.to_string(),
        CellValue::UInt8(n) => n.to_string(),
        CellValue::UInt16(n) => n.to_string(),
        CellValue::UInt32(n) => n.to_string(),
        CellValue::UInt64(n) => n.to_string(),
        CellValue::Float32(f) => f.to_string(),
        CellValue::Float64(f) => f.to_string(),
        CellValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
        CellValue::Blob(b) => {
            let mut hex = String::with_capacity(b.len() * 2 + 12);
            hex.push_str("unhex('");
            for byte in b {
                hex.push_str(&format!("{byte:02x}"));
            }
            hex.push_str("')");
            hex
        }
        CellValue::Instant(t) => format!("'{}'", t.format("%Y-%m-%d %H:%M:%S%.6f")),
    }
}

/// Render a record batch as JSONCompactEachRow lines for bulk insert.
fn render_json_rows(batch: &RecordBatch, out: &mut String) -> Result<(), PorterError> {
    for row in 0..batch.num_rows() {
        out.push('[');
        for (col, array) in batch.columns().iter().enumerate() {
            if col > 0 {
                out.push(',');
            }
            let rendered = render_json_cell(array, row)?;
            out.push_str(&rendered);
        }
        out.push_str("]\n");
    }
    Ok(())
}

fn render_json_cell(array: &arrow_array::ArrayRef, row: usize) -> Result<String, PorterError> {
    if array.is_null(row) {
        return Ok("null".to_string());
    }
    macro_rules! render {
        ($ty:ty) => {{
            let arr = array
                .as_any()
                .downcast_ref::<$ty>()
                .ok_or_else(|| PorterError::Internal("ingest array downcast".to_string()))?;
            arr.value(row).to_string()
        }};
    }
    let text = match array.data_type() {
        DataType::Boolean => render!(BooleanArray),
        DataType::Int8 => render!(Int8Array),
        DataType::Int16 => render!(Int16Array),
        DataType::Int32 => render!(Int32Array),
        DataType::Int64 => render!(Int64Array),
        DataType::UInt8 => render!(UInt8Array),
        DataType::UInt16 => render!(UInt16Array),
        DataType::UInt32 => render!(UInt32Array),
        DataType::UInt64 => render!(UInt64Array),
        DataType::Float32 => render!(Float32Array),
        DataType::Float64 => render!(Float64Array),
        DataType::Utf8 => {
            let arr = array
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| PorterError::Internal("ingest array downcast".to_string()))?;
            serde_json::to_string(arr.value(row))
                .map_err(|err| PorterError::Internal(err.to_string()))?
        }
        DataType::Binary => {
            let arr = array
                .as_any()
                .downcast_ref::<BinaryArray>()
                .ok_or_else(|| PorterError::Internal("ingest array downcast".to_string()))?;
            serde_json::to_string(&String::from_utf8_lossy(arr.value(row)))
                .map_err(|err| PorterError::Internal(err.to_string()))?
        }
        DataType::Date32 => {
            let arr = array
                .as_any()
                .downcast_ref::<Date32Array>()
                .ok_or_else(|| PorterError::Internal("ingest array downcast".to_string()))?;
            let date = NaiveDate::from_ymd_opt(1970, 1, 1)
                .expect("unix epoch date")
                .checked_add_signed(chrono::Duration::days(arr.value(row) as i64))
                .ok_or_else(|| PorterError::Internal("date out of range".to_string()))?;
            format!("\"{date}\"")
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            let arr = array
                .as_any()
                .downcast_ref::<TimestampMicrosecondArray>()
                .ok_or_else(|| PorterError::Internal("ingest array downcast".to_string()))?;
            let instant = DateTime::from_timestamp_micros(arr.value(row))
                .ok_or_else(|| PorterError::Internal("timestamp out of range".to_string()))?
                .naive_utc();
            format!("\"{}\"", instant.format("%Y-%m-%d %H:%M:%S%.6f"))
        }
        other => {
            return Err(PorterError::UnsupportedType(format!(
                "ingest of {other:?} into remote engine"
            )))
        }
    };
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::ArrayRef;
    use arrow_schema::{Field, Schema};
    use std::sync::Arc;

    #[test]
    fn bind_positional_inlines_literals_outside_quotes() -> anyhow::Result<()> {
        let bound = bind_positional(
            "SELECT * FROM t WHERE name = '?' AND id = ? AND note = ?",
            &[
                CellValue::Int64(7),
                CellValue::Text("it's fine".to_string()),
            ],
        )?;
        assert_eq!(
            bound,
            "SELECT * FROM t WHERE name = '?' AND id = 7 AND note = 'it''s fine'"
        );
        Ok(())
    }

    #[test]
    fn bind_positional_rejects_arity_mismatch() {
        assert!(bind_positional("SELECT ?", &[]).is_ok());
        assert!(bind_positional("SELECT ?, ?", &[CellValue::Int64(1)]).is_err());
        assert!(
            bind_positional("SELECT 1", &[CellValue::Int64(1)]).is_err(),
            "unused parameters must be rejected"
        );
    }

    #[test]
    fn json_cells_convert_per_mapped_type() -> anyhow::Result<()> {
        assert_eq!(
            json_to_cell(serde_json::json!(42), &DataType::UInt64)?,
            CellValue::UInt64(42)
        );
        // large unsigned values arrive as strings
        assert_eq!(
            json_to_cell(serde_json::json!("18446744073709551615"), &DataType::UInt64)?,
            CellValue::UInt64(u64::MAX)
        );
        assert_eq!(
            json_to_cell(serde_json::json!("2024-03-01 10:20:30.5"), &DataType::Timestamp(TimeUnit::Microsecond, None))?,
            CellValue::Instant(
                NaiveDate::from_ymd_opt(2024, 3, 1)
                    .unwrap()
                    .and_hms_milli_opt(10, 20, 30, 500)
                    .unwrap()
            )
        );
        assert_eq!(
            json_to_cell(serde_json::json!(null), &DataType::Int32)?,
            CellValue::Null
        );
        Ok(())
    }

    #[test]
    fn render_json_rows_encodes_nulls_and_strings() -> anyhow::Result<()> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 2])) as ArrayRef,
                Arc::new(StringArray::from(vec![Some("a\"b"), None])) as ArrayRef,
            ],
        )?;
        let mut out = String::new();
        render_json_rows(&batch, &mut out)?;
        assert_eq!(out, "[1,\"a\\\"b\"]\n[2,null]\n");
        Ok(())
    }
}
