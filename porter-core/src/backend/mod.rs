//! Backend drivers and the uniform cursor contract they expose.
//!
//! A `Connector` opens connections for one configured DSN; every live
//! connection implements `BackendConn`, and data-returning statements hand
//! back a forward-only `RowCursor` that scans rows into typed
//! destinations. The batch reader consumes that cursor without knowing
//! which engine produced it.

use arrow_array::RecordBatch;

use crate::config::DatabaseSection;
use crate::error::PorterError;
use crate::types::{CellValue, ColumnDesc, ScanSlot};

pub mod dsn;
mod duckdb;
mod remote;

pub use dsn::{BackendKind, Dsn};
pub use duckdb::DuckDbConnector;
pub use remote::RemoteConnector;

/// Forward-only reader over one statement's result rows.
pub trait RowCursor: Send {
    /// Column metadata for the result set; stable for the cursor's life.
    fn columns(&self) -> &[ColumnDesc];

    /// Scan the next row into `dest`. `Ok(false)` means clean end of
    /// data; backend errors mid-stream surface as `Err` and leave the
    /// cursor finished.
    fn next_row(&mut self, dest: &mut [ScanSlot]) -> Result<bool, PorterError>;

    /// Idempotent; dropping a cursor also closes it.
    fn close(&mut self);
}

/// One live backend connection. Exclusive use per caller; the pool hands
/// a connection to at most one RPC (or pinned transaction) at a time.
pub trait BackendConn: Send {
    fn kind(&self) -> BackendKind;

    /// Execute a data-returning statement.
    fn query(
        &mut self,
        sql: &str,
        params: &[CellValue],
    ) -> Result<Box<dyn RowCursor>, PorterError>;

    /// Execute a statement that returns no rows; yields rows affected
    /// where the engine reports it.
    fn execute(&mut self, sql: &str, params: &[CellValue]) -> Result<i64, PorterError>;

    /// Resolve a statement's output columns without executing it.
    fn describe_columns(&mut self, sql: &str) -> Result<Vec<ColumnDesc>, PorterError>;

    /// Bulk-insert record batches into `table`; returns rows written.
    fn ingest(&mut self, table: &str, batches: &[RecordBatch]) -> Result<i64, PorterError>;

    fn begin(&mut self) -> Result<(), PorterError>;
    fn commit(&mut self) -> Result<(), PorterError>;
    fn rollback(&mut self) -> Result<(), PorterError>;

    /// Cheap liveness probe used by the pool's health sweep.
    fn ping(&mut self) -> Result<(), PorterError>;
}

/// Connection factory for one DSN. The shape mirrors a classic pool
/// manager: `connect` builds, `is_valid` probes.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn BackendConn>, PorterError>;

    fn is_valid(&self, conn: &mut dyn BackendConn) -> Result<(), PorterError> {
        conn.ping()
    }

    fn kind(&self) -> BackendKind;

    /// Stable identity for cache fingerprints; never includes credentials.
    fn identity(&self) -> &str;
}

/// Parse the DSN and select the matching driver.
pub fn open(cfg: &DatabaseSection) -> Result<Box<dyn Connector>, PorterError> {
    let dsn = Dsn::parse(&cfg.dsn)?;
    match dsn.kind() {
        BackendKind::Embedded => Ok(Box::new(DuckDbConnector::new(dsn, cfg)?)),
        BackendKind::Remote => Ok(Box::new(RemoteConnector::new(dsn)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseSection;

    fn section(dsn: &str) -> DatabaseSection {
        DatabaseSection {
            dsn: dsn.to_string(),
            token: None,
            init_sql: None,
        }
    }

    #[test]
    fn open_selects_driver_by_scheme() -> anyhow::Result<()> {
        let embedded = open(&section("embedded://:memory:"))?;
        assert_eq!(embedded.kind(), BackendKind::Embedded);

        let remote = open(&section("remote://ch:9000/db?user=u"))?;
        assert_eq!(remote.kind(), BackendKind::Remote);
        assert_eq!(remote.identity(), "remote://ch:9000/db");
        Ok(())
    }

    #[test]
    fn open_rejects_unknown_scheme() {
        let err = open(&section("mysql://nope")).unwrap_err();
        assert!(matches!(err, PorterError::InvalidArgument(_)));
    }

    #[test]
    fn hosted_embedded_requires_token() {
        let err = open(&section("embedded://hosted/sales")).unwrap_err();
        assert!(matches!(err, PorterError::InvalidArgument(_)));
    }
}
