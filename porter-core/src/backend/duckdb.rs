//! Embedded engine driver (DuckDB), including the hosted variant.
//!
//! The `duckdb` connection is not `Sync` and its statement/rows handles
//! borrow the connection, so each open cursor moves the connection onto a
//! dedicated pump thread and streams rows back over a bounded channel.
//! The channel bound doubles as backpressure: when the consumer stops
//! pulling, the pump blocks instead of buffering the whole result. When
//! the cursor closes (or is dropped mid-stream), the pump ends and the
//! connection returns to its slot.

use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;

use arrow_array::RecordBatch;
use chrono::{DateTime, Duration, NaiveDate};
use duckdb::types::{TimeUnit as DuckTimeUnit, Value};
use duckdb::{params_from_iter, Connection};
use tracing::debug;

use crate::backend::dsn::{BackendKind, Dsn};
use crate::backend::{BackendConn, Connector, RowCursor};
use crate::config::DatabaseSection;
use crate::error::PorterError;
use crate::types::{CellValue, ColumnDesc, ScanSlot};

const ROW_CHANNEL_DEPTH: usize = 1024;

pub struct DuckDbConnector {
    dsn: Dsn,
    identity: String,
    token: Option<String>,
    init_sql: Option<String>,
}

impl DuckDbConnector {
    pub fn new(dsn: Dsn, cfg: &DatabaseSection) -> Result<Self, PorterError> {
        if matches!(dsn, Dsn::EmbeddedHosted { .. }) && cfg.token.is_none() {
            return Err(PorterError::InvalidArgument(
                "hosted embedded DSN requires a token".to_string(),
            ));
        }
        let identity = dsn.identity();
        Ok(Self {
            dsn,
            identity,
            token: cfg.token.clone(),
            init_sql: cfg.init_sql.clone(),
        })
    }

    fn open_connection(&self) -> Result<Connection, PorterError> {
        let config = duckdb::Config::default()
            .enable_autoload_extension(true)?
            .allow_unsigned_extensions()?;

        let conn = match &self.dsn {
            Dsn::EmbeddedMemory => Connection::open_in_memory_with_flags(config),
            Dsn::EmbeddedFile { path } => Connection::open_with_flags(path, config),
            Dsn::EmbeddedHosted { database } => {
                let token = self.token.as_deref().unwrap_or_default();
                let path = format!("md:{database}?motherduck_token={token}");
                Connection::open_with_flags(path, config)
            }
            Dsn::Remote { .. } => {
                return Err(PorterError::Internal(
                    "remote DSN routed to embedded driver".to_string(),
                ))
            }
        }
        .map_err(|err| PorterError::Unavailable(err.to_string()))?;

        if let Some(sql) = self.init_sql.as_deref() {
            let trimmed = sql.trim();
            if !trimmed.is_empty() {
                conn.execute_batch(trimmed)?;
            }
        }
        Ok(conn)
    }
}

impl Connector for DuckDbConnector {
    fn connect(&self) -> Result<Box<dyn BackendConn>, PorterError> {
        let conn = self.open_connection()?;
        debug!(identity = %self.identity, "opened embedded connection");
        Ok(Box::new(DuckDbConn {
            slot: Arc::new(Mutex::new(Some(conn))),
        }))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Embedded
    }

    fn identity(&self) -> &str {
        &self.identity
    }
}

pub struct DuckDbConn {
    /// `None` while a cursor's pump thread holds the connection.
    slot: Arc<Mutex<Option<Connection>>>,
}

impl DuckDbConn {
    fn with_conn<R>(
        &self,
        f: impl FnOnce(&Connection) -> Result<R, PorterError>,
    ) -> Result<R, PorterError> {
        let guard = self.slot.lock().expect("connection slot poisoned");
        let conn = guard.as_ref().ok_or_else(|| {
            PorterError::Internal("connection is busy with an open cursor".to_string())
        })?;
        f(conn)
    }

    fn describe_via_limit0(&self, sql: &str) -> Result<Vec<ColumnDesc>, PorterError> {
        // Parameterized statements cannot be DESCRIBEd; bind NULL for every
        // placeholder under a LIMIT 0 wrapper and read the result schema.
        self.with_conn(|conn| {
            let trimmed = sql.trim_end_matches(';');
            let schema_query = format!("SELECT * FROM ({trimmed}) LIMIT 0");
            let mut stmt = conn.prepare(&schema_query)?;
            let param_count = stmt.parameter_count();
            let arrow = if param_count == 0 {
                stmt.query_arrow([])?
            } else {
                let nulls: Vec<Value> = (0..param_count).map(|_| Value::Null).collect();
                stmt.query_arrow(params_from_iter(nulls))?
            };
            let schema = arrow.get_schema();
            let cols = schema
                .fields()
                .iter()
                .map(|field| {
                    ColumnDesc::new(
                        field.name().clone(),
                        arrow_decl_name(field.data_type()),
                        field.is_nullable(),
                    )
                })
                .collect();
            Ok(cols)
        })
    }
}

impl BackendConn for DuckDbConn {
    fn kind(&self) -> BackendKind {
        BackendKind::Embedded
    }

    fn query(
        &mut self,
        sql: &str,
        params: &[CellValue],
    ) -> Result<Box<dyn RowCursor>, PorterError> {
        let columns = self.describe_columns(sql)?;
        let duck_params: Vec<Value> = params.iter().map(cell_to_value).collect();

        let conn = {
            let mut guard = self.slot.lock().expect("connection slot poisoned");
            guard.take().ok_or_else(|| {
                PorterError::Internal("connection is busy with an open cursor".to_string())
            })?
        };

        let (tx, rx) = mpsc::sync_channel(ROW_CHANNEL_DEPTH);
        let slot = Arc::clone(&self.slot);
        let sql = sql.to_string();
        let ncols = columns.len();
        let join = std::thread::Builder::new()
            .name("duckdb-cursor".to_string())
            .spawn(move || {
                if let Err(err) = pump_rows(&conn, &sql, &duck_params, ncols, &tx) {
                    let _ = tx.send(Err(err));
                }
                drop(tx);
                *slot.lock().expect("connection slot poisoned") = Some(conn);
            })
            .map_err(|err| PorterError::Internal(format!("failed to spawn cursor pump: {err}")))?;

        Ok(Box::new(DuckDbCursor {
            columns,
            rx: Some(rx),
            join: Some(join),
        }))
    }

    fn execute(&mut self, sql: &str, params: &[CellValue]) -> Result<i64, PorterError> {
        self.with_conn(|conn| {
            if params.is_empty() {
                // execute_batch accepts multi-statement scripts but does
                // not report affected rows.
                conn.execute_batch(sql)?;
                Ok(0)
            } else {
                let duck_params: Vec<Value> = params.iter().map(cell_to_value).collect();
                let mut stmt = conn.prepare(sql)?;
                let affected = stmt.execute(params_from_iter(duck_params.iter()))?;
                Ok(affected as i64)
            }
        })
    }

    fn describe_columns(&mut self, sql: &str) -> Result<Vec<ColumnDesc>, PorterError> {
        let described = self.with_conn(|conn| {
            let trimmed = sql.trim_end_matches(';');
            let describe_sql = format!("DESCRIBE {trimmed}");
            let mut stmt = conn.prepare(&describe_sql)?;
            let mapped = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?, // column_name
                    row.get::<_, String>(1)?, // column_type
                    row.get::<_, String>(2)?, // null: YES | NO
                ))
            })?;
            let mut cols = Vec::new();
            for row in mapped {
                let (name, decl_type, null_str) = row?;
                cols.push(ColumnDesc::new(name, decl_type, null_str == "YES"));
            }
            Ok(cols)
        });
        match described {
            Ok(cols) => Ok(cols),
            // DESCRIBE cannot plan statements with unbound parameters.
            Err(PorterError::QueryFailed(_)) => self.describe_via_limit0(sql),
            Err(other) => Err(other),
        }
    }

    fn ingest(&mut self, table: &str, batches: &[RecordBatch]) -> Result<i64, PorterError> {
        self.with_conn(|conn| {
            let mut total_rows = 0i64;
            let mut appender = conn.appender(table)?;
            for batch in batches {
                appender.append_record_batch(batch.clone())?;
                total_rows += batch.num_rows() as i64;
            }
            appender.flush()?;
            debug!(rows = total_rows, table = %table, "ingested batches via appender");
            Ok(total_rows)
        })
    }

    fn begin(&mut self) -> Result<(), PorterError> {
        self.with_conn(|conn| Ok(conn.execute_batch("BEGIN TRANSACTION")?))
    }

    fn commit(&mut self) -> Result<(), PorterError> {
        self.with_conn(|conn| Ok(conn.execute_batch("COMMIT")?))
    }

    fn rollback(&mut self) -> Result<(), PorterError> {
        self.with_conn(|conn| Ok(conn.execute_batch("ROLLBACK")?))
    }

    fn ping(&mut self) -> Result<(), PorterError> {
        self.with_conn(|conn| Ok(conn.execute_batch("SELECT 1;")?))
    }
}

struct DuckDbCursor {
    columns: Vec<ColumnDesc>,
    rx: Option<Receiver<Result<Vec<CellValue>, PorterError>>>,
    join: Option<JoinHandle<()>>,
}

impl DuckDbCursor {
    fn finish(&mut self) {
        // Dropping the receiver unblocks a pump stuck on send; joining
        // guarantees the connection is back in its slot before the caller
        // reuses the handle.
        self.rx = None;
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl RowCursor for DuckDbCursor {
    fn columns(&self) -> &[ColumnDesc] {
        &self.columns
    }

    fn next_row(&mut self, dest: &mut [ScanSlot]) -> Result<bool, PorterError> {
        let Some(rx) = self.rx.as_ref() else {
            return Ok(false);
        };
        match rx.recv() {
            Ok(Ok(cells)) => {
                if cells.len() != dest.len() {
                    self.finish();
                    return Err(PorterError::Internal(format!(
                        "row has {} cells, expected {}",
                        cells.len(),
                        dest.len()
                    )));
                }
                for (slot, cell) in dest.iter_mut().zip(cells) {
                    slot.store(cell)?;
                }
                Ok(true)
            }
            Ok(Err(err)) => {
                self.finish();
                Err(err)
            }
            // Channel closed: the pump drained the result set.
            Err(_) => {
                self.finish();
                Ok(false)
            }
        }
    }

    fn close(&mut self) {
        self.finish();
    }
}

impl Drop for DuckDbCursor {
    fn drop(&mut self) {
        self.finish();
    }
}

fn pump_rows(
    conn: &Connection,
    sql: &str,
    params: &[Value],
    ncols: usize,
    tx: &SyncSender<Result<Vec<CellValue>, PorterError>>,
) -> Result<(), PorterError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = if params.is_empty() {
        stmt.query([])?
    } else {
        stmt.query(params_from_iter(params.iter()))?
    };
    while let Some(row) = rows.next()? {
        let mut cells = Vec::with_capacity(ncols);
        for idx in 0..ncols {
            let value: Value = row.get(idx)?;
            cells.push(value_to_cell(value)?);
        }
        if tx.send(Ok(cells)).is_err() {
            // Consumer dropped the cursor mid-stream.
            return Ok(());
        }
    }
    Ok(())
}

fn value_to_cell(value: Value) -> Result<CellValue, PorterError> {
    let cell = match value {
        Value::Null => CellValue::Null,
        Value::Boolean(b) => CellValue::Bool(b),
        Value::TinyInt(n) => CellValue::Int8(n),
        Value::SmallInt(n) => CellValue::Int16(n),
        Value::Int(n) => CellValue::Int32(n),
        Value::BigInt(n) => CellValue::Int64(n),
        Value::HugeInt(n) => CellValue::Text(n.to_string()),
        Value::UTinyInt(n) => CellValue::UInt8(n),
        Value::USmallInt(n) => CellValue::UInt16(n),
        Value::UInt(n) => CellValue::UInt32(n),
        Value::UBigInt(n) => CellValue::UInt64(n),
        Value::Float(f) => CellValue::Float32(f),
        Value::Double(f) => CellValue::Float64(f),
        Value::Decimal(d) => CellValue::Text(d.to_string()),
        Value::Text(s) => CellValue::Text(s),
        Value::Blob(b) => CellValue::Blob(b),
        Value::Date32(days) => {
            let date = NaiveDate::from_ymd_opt(1970, 1, 1)
                .expect("unix epoch date")
                .checked_add_signed(Duration::days(days as i64))
                .ok_or_else(|| {
                    PorterError::Internal(format!("date out of range: {days} days"))
                })?;
            CellValue::Instant(date.and_hms_opt(0, 0, 0).expect("midnight"))
        }
        Value::Time64(unit, n) => {
            let micros = unit_to_micros(unit, n)?;
            let date = NaiveDate::from_ymd_opt(1970, 1, 1).expect("unix epoch date");
            let time = chrono::NaiveTime::from_num_seconds_from_midnight_opt(
                (micros / 1_000_000) as u32,
                ((micros % 1_000_000) * 1_000) as u32,
            )
            .ok_or_else(|| PorterError::Internal(format!("time out of range: {micros}us")))?;
            CellValue::Instant(date.and_time(time))
        }
        Value::Timestamp(unit, n) => {
            let micros = unit_to_micros(unit, n)?;
            let instant = DateTime::from_timestamp_micros(micros)
                .ok_or_else(|| {
                    PorterError::Internal(format!("timestamp out of range: {micros}us"))
                })?
                .naive_utc();
            CellValue::Instant(instant)
        }
        Value::Enum(s) => CellValue::Text(s),
        other => {
            return Err(PorterError::UnsupportedType(format!(
                "embedded scan value {other:?}"
            )))
        }
    };
    Ok(cell)
}

fn unit_to_micros(unit: DuckTimeUnit, n: i64) -> Result<i64, PorterError> {
    let micros = match unit {
        DuckTimeUnit::Second => n.checked_mul(1_000_000),
        DuckTimeUnit::Millisecond => n.checked_mul(1_000),
        DuckTimeUnit::Microsecond => Some(n),
        DuckTimeUnit::Nanosecond => Some(n / 1_000),
    };
    micros.ok_or_else(|| PorterError::Internal(format!("temporal value out of range: {n}")))
}

fn cell_to_value(cell: &CellValue) -> Value {
    match cell {
        CellValue::Null => Value::Null,
        CellValue::Bool(b) => Value::Boolean(*b),
        CellValue::Int8(n) => Value::TinyInt(*n),
        CellValue::Int16(n) => Value::SmallInt(*n),
        CellValue::Int32(n) => Value::Int(*n),
        CellValue::Int64(n) => Value::BigInt(*n),
        CellValue::UInt8(n) => Value::UTinyInt(*n),
        CellValue::UInt16(n) => Value::USmallInt(*n),
        CellValue::UInt32(n) => Value::UInt(*n),
        CellValue::UInt64(n) => Value::UBigInt(*n),
        CellValue::Float32(f) => Value::Float(*f),
        CellValue::Float64(f) => Value::Double(*f),
        CellValue::Text(s) => Value::Text(s.clone()),
        CellValue::Blob(b) => Value::Blob(b.clone()),
        CellValue::Instant(t) => Value::Timestamp(
            DuckTimeUnit::Microsecond,
            t.and_utc().timestamp_micros(),
        ),
    }
}

/// Declared-type name for a resolved Arrow type, used when schema
/// resolution had to go through the LIMIT 0 path.
fn arrow_decl_name(data_type: &arrow_schema::DataType) -> String {
    use arrow_schema::DataType;
    match data_type {
        DataType::Boolean => "BOOLEAN".to_string(),
        DataType::Int8 => "TINYINT".to_string(),
        DataType::Int16 => "SMALLINT".to_string(),
        DataType::Int32 => "INTEGER".to_string(),
        DataType::Int64 => "BIGINT".to_string(),
        DataType::UInt8 => "UTINYINT".to_string(),
        DataType::UInt16 => "USMALLINT".to_string(),
        DataType::UInt32 => "UINTEGER".to_string(),
        DataType::UInt64 => "UBIGINT".to_string(),
        DataType::Float32 => "FLOAT".to_string(),
        DataType::Float64 => "DOUBLE".to_string(),
        DataType::Utf8 | DataType::LargeUtf8 => "VARCHAR".to_string(),
        DataType::Binary | DataType::LargeBinary => "BLOB".to_string(),
        DataType::Date32 => "DATE".to_string(),
        DataType::Date64 => "DATE64".to_string(),
        DataType::Time32(_) => "TIME32".to_string(),
        DataType::Time64(_) => "TIME".to_string(),
        DataType::Timestamp(_, _) => "TIMESTAMP".to_string(),
        DataType::Decimal128(p, s) | DataType::Decimal256(p, s) => {
            format!("DECIMAL({p},{s})")
        }
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::schema_from_columns;
    use arrow_schema::DataType;

    fn memory_conn() -> Box<dyn BackendConn> {
        let section = DatabaseSection {
            dsn: "embedded://:memory:".to_string(),
            token: None,
            init_sql: None,
        };
        let connector =
            DuckDbConnector::new(Dsn::parse("embedded://:memory:").expect("dsn"), &section)
                .expect("connector");
        connector.connect().expect("connect")
    }

    #[test]
    fn describe_reports_columns_without_executing() -> anyhow::Result<()> {
        let mut conn = memory_conn();
        let cols = conn.describe_columns("SELECT 1::BIGINT AS id, 'x' AS name")?;
        assert_eq!(cols.len(), 2);
        assert_eq!(cols[0].name, "id");
        let schema = schema_from_columns(&cols)?;
        assert_eq!(schema.field(0).data_type(), &DataType::Int64);
        assert_eq!(schema.field(1).data_type(), &DataType::Utf8);
        Ok(())
    }

    #[test]
    fn cursor_streams_rows_in_order() -> anyhow::Result<()> {
        let mut conn = memory_conn();
        conn.execute("CREATE TABLE t (id BIGINT, name VARCHAR)", &[])?;
        conn.execute(
            "INSERT INTO t VALUES (1, 'a'), (2, 'b'), (3, NULL)",
            &[],
        )?;

        let mut cursor = conn.query("SELECT id, name FROM t ORDER BY id", &[])?;
        let mut dest = vec![ScanSlot::Int64(None), ScanSlot::Utf8(None)];
        let mut seen = Vec::new();
        while cursor.next_row(&mut dest)? {
            seen.push((dest[0].clone(), dest[1].clone()));
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].0, ScanSlot::Int64(Some(1)));
        assert_eq!(seen[2].1, ScanSlot::Utf8(None));

        // handle is usable again once the cursor is exhausted
        conn.ping()?;
        Ok(())
    }

    #[test]
    fn dropping_cursor_mid_stream_returns_the_connection() -> anyhow::Result<()> {
        let mut conn = memory_conn();
        let cursor = conn.query("SELECT * FROM range(100000)", &[])?;
        drop(cursor);
        conn.ping()?;
        Ok(())
    }

    #[test]
    fn cursor_close_is_idempotent() -> anyhow::Result<()> {
        let mut conn = memory_conn();
        let mut cursor = conn.query("SELECT 1", &[])?;
        cursor.close();
        cursor.close();
        let mut dest = vec![ScanSlot::Int32(None)];
        assert!(!cursor.next_row(&mut dest)?);
        Ok(())
    }

    #[test]
    fn transactions_bind_to_the_handle() -> anyhow::Result<()> {
        let mut conn = memory_conn();
        conn.execute("CREATE TABLE t (id BIGINT)", &[])?;
        conn.begin()?;
        conn.execute("INSERT INTO t VALUES (1)", &[])?;
        conn.rollback()?;

        let mut cursor = conn.query("SELECT count(*) FROM t", &[])?;
        let mut dest = vec![ScanSlot::Int64(None)];
        assert!(cursor.next_row(&mut dest)?);
        assert_eq!(dest[0], ScanSlot::Int64(Some(0)));
        Ok(())
    }

    #[test]
    fn query_failure_surfaces_backend_message() {
        let mut conn = memory_conn();
        let err = conn
            .describe_columns("SELECT * FROM __missing__")
            .unwrap_err();
        assert!(matches!(err, PorterError::QueryFailed(_)));
    }
}
