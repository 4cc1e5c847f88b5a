//! Shared dispatcher state: statement and transaction registries.
//!
//! A registered statement owns the pool handle its ticket reserved; the
//! handle is taken out for the duration of a DoGet stream and put back
//! afterwards (prepared statements) or dropped (one-shot statements).
//! Transactions pin their handle the same way. A background reaper
//! releases entries whose idle time passed their TTL so an abandoned
//! client cannot hold pool slots forever.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arrow_schema::SchemaRef;
use tracing::{debug, info};

use crate::backend::BackendKind;
use crate::cache::QueryCache;
use crate::config::ServerConfig;
use crate::error::PorterError;
use crate::metrics::Metrics;
use crate::pool::{Pool, PooledConn};
use crate::ticket::{TicketIssuer, TicketKind};
use crate::types::CellValue;

pub struct GatewayState {
    pub pool: Arc<Pool>,
    pub cache: QueryCache,
    pub metrics: Metrics,
    pub issuer: TicketIssuer,
    pub backend_kind: BackendKind,
    pub backend_identity: String,
    pub batch_size: usize,
    pub query_deadline: Option<Duration>,
    statement_ttl: Duration,
    prepared_idle_timeout: Duration,
    statements: Mutex<HashMap<u64, StatementEntry>>,
    next_statement_id: AtomicU64,
    transactions: Mutex<HashMap<u64, TransactionEntry>>,
    next_transaction_id: AtomicU64,
}

pub struct StatementEntry {
    pub sql: String,
    pub is_query: bool,
    pub kind: TicketKind,
    pub schema: Option<SchemaRef>,
    pub schema_id: u64,
    pub pending_params: Option<Vec<CellValue>>,
    pub conn: Option<PooledConn>,
    pub last_used: Instant,
}

/// Cloneable view of a statement used by handlers.
#[derive(Clone)]
pub struct StatementMeta {
    pub sql: String,
    pub is_query: bool,
    pub kind: TicketKind,
    pub schema: Option<SchemaRef>,
    pub schema_id: u64,
}

struct TransactionEntry {
    conn: Option<PooledConn>,
    started_at: Instant,
}

impl GatewayState {
    pub fn new(
        config: &ServerConfig,
        pool: Arc<Pool>,
        backend_kind: BackendKind,
        backend_identity: String,
    ) -> Self {
        Self {
            pool,
            cache: QueryCache::new(
                config.server.cache_max_entries,
                config.server.cache_max_bytes,
            ),
            metrics: Metrics::new(),
            issuer: TicketIssuer::new(Duration::from_secs(config.server.ticket_ttl_seconds)),
            backend_kind,
            backend_identity,
            batch_size: config.server.batch_size,
            query_deadline: match config.server.query_deadline_seconds {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            statement_ttl: Duration::from_secs(config.server.ticket_ttl_seconds),
            prepared_idle_timeout: Duration::from_secs(
                config.server.prepared_idle_timeout_seconds,
            ),
            statements: Mutex::new(HashMap::new()),
            next_statement_id: AtomicU64::new(1),
            transactions: Mutex::new(HashMap::new()),
            next_transaction_id: AtomicU64::new(1),
        }
    }

    // === statements ===

    pub fn register_statement(&self, mut entry: StatementEntry) -> u64 {
        if let Some(conn) = entry.conn.as_mut() {
            conn.pin();
        }
        entry.last_used = Instant::now();
        let id = self.next_statement_id.fetch_add(1, Ordering::SeqCst);
        let mut statements = self.statements.lock().expect("statement registry poisoned");
        statements.insert(id, entry);
        debug!(statement_id = id, "registered statement");
        id
    }

    pub fn statement_meta(&self, id: u64) -> Result<StatementMeta, PorterError> {
        let mut statements = self.statements.lock().expect("statement registry poisoned");
        let entry = statements
            .get_mut(&id)
            .ok_or_else(|| PorterError::InvalidArgument("unknown statement handle".into()))?;
        entry.last_used = Instant::now();
        Ok(StatementMeta {
            sql: entry.sql.clone(),
            is_query: entry.is_query,
            kind: entry.kind,
            schema: entry.schema.clone(),
            schema_id: entry.schema_id,
        })
    }

    pub fn cache_statement_schema(&self, id: u64, schema: SchemaRef) {
        let mut statements = self.statements.lock().expect("statement registry poisoned");
        if let Some(entry) = statements.get_mut(&id) {
            entry.schema = Some(schema);
        }
    }

    pub fn set_statement_params(&self, id: u64, params: Vec<CellValue>) -> Result<(), PorterError> {
        let mut statements = self.statements.lock().expect("statement registry poisoned");
        let entry = statements
            .get_mut(&id)
            .ok_or_else(|| PorterError::InvalidArgument("unknown statement handle".into()))?;
        entry.pending_params = Some(params);
        entry.last_used = Instant::now();
        Ok(())
    }

    pub fn take_statement_params(&self, id: u64) -> Result<Vec<CellValue>, PorterError> {
        let mut statements = self.statements.lock().expect("statement registry poisoned");
        let entry = statements
            .get_mut(&id)
            .ok_or_else(|| PorterError::InvalidArgument("unknown statement handle".into()))?;
        Ok(entry.pending_params.take().unwrap_or_default())
    }

    /// Borrow the statement's reserved handle, falling back to a fresh
    /// pool acquire when the entry holds none.
    pub fn take_statement_conn(&self, id: u64) -> Result<PooledConn, PorterError> {
        let reserved = {
            let mut statements = self.statements.lock().expect("statement registry poisoned");
            let entry = statements
                .get_mut(&id)
                .ok_or_else(|| PorterError::InvalidArgument("unknown statement handle".into()))?;
            entry.last_used = Instant::now();
            entry.conn.take()
        };
        match reserved {
            Some(conn) => Ok(conn),
            None => self.acquire_timed(),
        }
    }

    /// Put a streamed-with handle back; if the statement is gone the
    /// handle simply returns to the pool.
    pub fn return_statement_conn(&self, id: u64, mut conn: PooledConn) {
        let mut statements = self.statements.lock().expect("statement registry poisoned");
        match statements.get_mut(&id) {
            Some(entry) if entry.conn.is_none() => {
                conn.pin();
                entry.last_used = Instant::now();
                entry.conn = Some(conn);
            }
            _ => drop(conn),
        }
    }

    pub fn remove_statement(&self, id: u64) -> Result<StatementEntry, PorterError> {
        let mut statements = self.statements.lock().expect("statement registry poisoned");
        statements
            .remove(&id)
            .ok_or_else(|| PorterError::InvalidArgument("unknown statement handle".into()))
    }

    pub fn statement_count(&self) -> usize {
        self.statements.lock().expect("statement registry poisoned").len()
    }

    /// Pool acquire with wait metrics.
    pub fn acquire_timed(&self) -> Result<PooledConn, PorterError> {
        let started = Instant::now();
        match self.pool.acquire() {
            Ok(conn) => {
                self.metrics.acquire_wait(started.elapsed());
                Ok(conn)
            }
            Err(PorterError::AcquireTimeout) => {
                self.metrics.acquire_timeout();
                Err(PorterError::AcquireTimeout)
            }
            Err(other) => Err(other),
        }
    }

    /// Release statements idle past their TTL. One-shot statements use
    /// the ticket TTL, prepared statements the prepared idle timeout.
    pub fn reap_idle_statements(&self) -> usize {
        let mut statements = self.statements.lock().expect("statement registry poisoned");
        let before = statements.len();
        statements.retain(|id, entry| {
            let ttl = match entry.kind {
                TicketKind::Statement => self.statement_ttl,
                TicketKind::Prepared => self.prepared_idle_timeout,
            };
            let keep = entry.last_used.elapsed() <= ttl;
            if !keep {
                info!(statement_id = id, kind = ?entry.kind, "reaping idle statement");
            }
            keep
        });
        let reaped = before - statements.len();
        if reaped > 0 {
            self.metrics.prepared_reaped(reaped as u64);
        }
        reaped
    }

    // === transactions ===

    pub fn begin_transaction(&self) -> Result<u64, PorterError> {
        let mut conn = self.acquire_timed()?;
        conn.begin()?;
        conn.pin();
        let id = self.next_transaction_id.fetch_add(1, Ordering::SeqCst);
        let mut transactions = self
            .transactions
            .lock()
            .expect("transaction registry poisoned");
        transactions.insert(
            id,
            TransactionEntry {
                conn: Some(conn),
                started_at: Instant::now(),
            },
        );
        info!(transaction_id = id, "transaction started");
        Ok(id)
    }

    /// Commit or roll back; the pinned handle returns to the pool either
    /// way.
    pub fn end_transaction(&self, id: u64, commit: bool) -> Result<(), PorterError> {
        let mut conn = {
            let mut transactions = self
                .transactions
                .lock()
                .expect("transaction registry poisoned");
            let entry = transactions
                .remove(&id)
                .ok_or_else(|| PorterError::InvalidArgument("unknown transaction".into()))?;
            entry.conn.ok_or_else(|| {
                PorterError::Internal("transaction handle is busy".into())
            })?
        };
        let result = if commit { conn.commit() } else { conn.rollback() };
        if result.is_err() {
            conn.mark_broken();
        }
        info!(transaction_id = id, commit, "transaction ended");
        result
    }

    /// Borrow a transaction's pinned handle for one statement execution.
    pub fn take_transaction_conn(&self, id: u64) -> Result<PooledConn, PorterError> {
        let mut transactions = self
            .transactions
            .lock()
            .expect("transaction registry poisoned");
        let entry = transactions
            .get_mut(&id)
            .ok_or_else(|| PorterError::InvalidArgument("unknown transaction".into()))?;
        entry.conn.take().ok_or_else(|| {
            PorterError::Internal("transaction handle is busy with another statement".into())
        })
    }

    pub fn return_transaction_conn(&self, id: u64, conn: PooledConn) {
        let mut transactions = self
            .transactions
            .lock()
            .expect("transaction registry poisoned");
        if let Some(entry) = transactions.get_mut(&id) {
            entry.conn = Some(conn);
        }
    }

    pub fn transaction_age(&self, id: u64) -> Option<Duration> {
        let transactions = self
            .transactions
            .lock()
            .expect("transaction registry poisoned");
        transactions.get(&id).map(|e| e.started_at.elapsed())
    }
}

/// Encode a statement id as the opaque prepared-statement handle bytes.
pub fn encode_handle(id: u64) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

/// Decode the opaque prepared-statement handle bytes.
pub fn decode_handle(bytes: &[u8]) -> Result<u64, PorterError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| PorterError::InvalidArgument("invalid statement handle".into()))?;
    Ok(u64::from_be_bytes(arr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::open;
    use crate::config::ServerConfig;
    use crate::pool::PoolConfig;

    fn test_state() -> GatewayState {
        let mut config = ServerConfig::default();
        config.server.max_connections = 2;
        config.server.acquire_timeout_ms = 100;
        let connector = open(&config.database).expect("connector");
        let identity = connector.identity().to_string();
        let kind = connector.kind();
        let pool = Pool::new(connector, PoolConfig::from(&config.server));
        GatewayState::new(&config, pool, kind, identity)
    }

    fn entry(kind: TicketKind, conn: Option<PooledConn>) -> StatementEntry {
        StatementEntry {
            sql: "SELECT 1".to_string(),
            is_query: true,
            kind,
            schema: None,
            schema_id: 7,
            pending_params: None,
            conn,
            last_used: Instant::now(),
        }
    }

    #[test]
    fn handle_bytes_round_trip() -> anyhow::Result<()> {
        let id = 0xdead_beef_u64;
        assert_eq!(decode_handle(&encode_handle(id))?, id);
        assert!(decode_handle(b"short").is_err());
        Ok(())
    }

    #[test]
    fn registered_statement_pins_its_handle() -> anyhow::Result<()> {
        let state = test_state();
        let conn = state.acquire_timed()?;
        let id = state.register_statement(entry(TicketKind::Prepared, Some(conn)));
        assert_eq!(state.pool.stats().pinned, 1);

        // taking the conn for a stream keeps it reserved
        let conn = state.take_statement_conn(id)?;
        assert_eq!(state.pool.stats().pinned, 1);
        state.return_statement_conn(id, conn);
        assert_eq!(state.pool.stats().pinned, 1);

        state.remove_statement(id)?;
        assert_eq!(state.pool.stats().pinned, 0);
        assert_eq!(state.pool.stats().idle, 1);
        Ok(())
    }

    #[test]
    fn returning_conn_for_closed_statement_releases_it() -> anyhow::Result<()> {
        let state = test_state();
        let conn = state.acquire_timed()?;
        let id = state.register_statement(entry(TicketKind::Statement, Some(conn)));
        let conn = state.take_statement_conn(id)?;
        state.remove_statement(id)?;
        state.return_statement_conn(id, conn);
        assert_eq!(state.pool.stats().pinned, 0);
        assert_eq!(state.pool.stats().in_use, 0);
        Ok(())
    }

    #[test]
    fn transactions_pin_until_ended() -> anyhow::Result<()> {
        let state = test_state();
        let txn = state.begin_transaction()?;
        assert_eq!(state.pool.stats().pinned, 1);

        let conn = state.take_transaction_conn(txn)?;
        assert!(state.take_transaction_conn(txn).is_err(), "handle is busy");
        state.return_transaction_conn(txn, conn);

        state.end_transaction(txn, false)?;
        assert_eq!(state.pool.stats().pinned, 0);
        assert!(state.end_transaction(txn, true).is_err(), "already ended");
        Ok(())
    }

    #[test]
    fn reaper_releases_idle_entries() -> anyhow::Result<()> {
        let mut config = ServerConfig::default();
        config.server.ticket_ttl_seconds = 0;
        config.server.prepared_idle_timeout_seconds = 3600;
        let connector = open(&config.database).expect("connector");
        let identity = connector.identity().to_string();
        let kind = connector.kind();
        let pool = Pool::new(connector, PoolConfig::from(&config.server));
        let state = GatewayState::new(&config, pool, kind, identity);

        let conn = state.acquire_timed()?;
        state.register_statement(entry(TicketKind::Statement, Some(conn)));
        let prepared_id = state.register_statement(entry(TicketKind::Prepared, None));

        std::thread::sleep(Duration::from_millis(20));
        let reaped = state.reap_idle_statements();
        assert_eq!(reaped, 1, "only the expired one-shot statement is reaped");
        assert!(state.statement_meta(prepared_id).is_ok());
        assert_eq!(state.pool.stats().pinned, 0);
        Ok(())
    }

    #[test]
    fn statement_params_are_consumed_once() -> anyhow::Result<()> {
        let state = test_state();
        let id = state.register_statement(entry(TicketKind::Prepared, None));
        state.set_statement_params(id, vec![CellValue::Int64(5)])?;
        assert_eq!(state.take_statement_params(id)?, vec![CellValue::Int64(5)]);
        assert!(state.take_statement_params(id)?.is_empty());
        Ok(())
    }
}
