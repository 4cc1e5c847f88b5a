//! Bounded backend connection pool.
//!
//! Handles are checked out exclusively, served to waiters in FIFO order
//! by ticket number, retired once they pass their maximum lifetime, and
//! ping-swept while idle. A handle pinned to a transaction or prepared
//! statement still counts against `max_open` but is invisible to the
//! idle sweep. The mutex is never held across connect, ping, or close.

use std::collections::{HashSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::backend::{BackendConn, Connector};
use crate::config::ServerSection;
use crate::error::PorterError;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_open: usize,
    pub max_idle: usize,
    pub conn_max_lifetime: Duration,
    pub health_check_period: Duration,
    pub acquire_timeout: Duration,
}

impl From<&ServerSection> for PoolConfig {
    fn from(section: &ServerSection) -> Self {
        Self {
            max_open: section.max_connections,
            max_idle: section.max_idle_connections,
            conn_max_lifetime: Duration::from_secs(section.conn_max_lifetime_seconds),
            health_check_period: Duration::from_secs(section.health_check_period_seconds),
            acquire_timeout: Duration::from_millis(section.acquire_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub open: usize,
    pub idle: usize,
    pub pinned: usize,
    pub in_use: usize,
    pub waiting: usize,
}

pub struct Pool {
    inner: Arc<PoolInner>,
    sweeper: Option<JoinHandle<()>>,
}

struct PoolInner {
    connector: Box<dyn Connector>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
    shutdown: Mutex<bool>,
    shutdown_cv: Condvar,
    last_healthy: Mutex<Option<Instant>>,
}

struct PoolState {
    idle: VecDeque<IdleConn>,
    open_count: usize,
    pinned_count: usize,
    next_ticket: u64,
    serving_ticket: u64,
    abandoned: HashSet<u64>,
    closed: bool,
}

struct IdleConn {
    conn: Box<dyn BackendConn>,
    opened_at: Instant,
}

impl Pool {
    pub fn new(connector: Box<dyn Connector>, config: PoolConfig) -> Arc<Self> {
        let inner = Arc::new(PoolInner {
            connector,
            config: config.clone(),
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                open_count: 0,
                pinned_count: 0,
                next_ticket: 0,
                serving_ticket: 0,
                abandoned: HashSet::new(),
                closed: false,
            }),
            available: Condvar::new(),
            shutdown: Mutex::new(false),
            shutdown_cv: Condvar::new(),
            last_healthy: Mutex::new(None),
        });

        let sweeper = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("pool-health-sweep".to_string())
                .spawn(move || inner.run_health_sweep())
                .ok()
        };

        Arc::new(Self { inner, sweeper })
    }

    /// Check out a handle, waiting at most `acquire_timeout`. Waiters are
    /// served in arrival order.
    pub fn acquire(&self) -> Result<PooledConn, PorterError> {
        PoolInner::acquire(&self.inner)
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    /// Whether a backend ping has succeeded within the last two sweep
    /// periods.
    pub fn healthy(&self) -> bool {
        let last = self.inner.last_healthy.lock().expect("health lock poisoned");
        match *last {
            Some(at) => at.elapsed() <= self.inner.config.health_check_period * 2,
            None => false,
        }
    }

    /// One immediate health probe, used by the startup check.
    pub fn ping_now(&self) -> Result<(), PorterError> {
        let mut conn = self.acquire()?;
        conn.ping()?;
        self.inner.mark_healthy();
        Ok(())
    }

    pub fn shutdown(&mut self) {
        {
            let mut state = self.inner.state.lock().expect("pool lock poisoned");
            state.closed = true;
            state.idle.clear();
            self.inner.available.notify_all();
        }
        {
            let mut flag = self.inner.shutdown.lock().expect("shutdown lock poisoned");
            *flag = true;
            self.inner.shutdown_cv.notify_all();
        }
        if let Some(join) = self.sweeper.take() {
            let _ = join.join();
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PoolInner {
    fn acquire(this: &Arc<Self>) -> Result<PooledConn, PorterError> {
        let deadline = Instant::now() + this.config.acquire_timeout;
        let mut state = this.state.lock().expect("pool lock poisoned");
        let ticket = state.next_ticket;
        state.next_ticket += 1;

        loop {
            if state.closed {
                this.pass_turn(&mut state, ticket);
                return Err(PorterError::Unavailable("pool is shut down".to_string()));
            }

            if state.serving_ticket == ticket {
                // Retire idle handles past their lifetime before reuse.
                while let Some(idle) = state.idle.pop_front() {
                    if idle.opened_at.elapsed() >= this.config.conn_max_lifetime {
                        state.open_count -= 1;
                        debug!("retired idle handle past max lifetime");
                        continue;
                    }
                    this.advance_serving(&mut state);
                    return Ok(PooledConn::new(
                        Arc::clone(this),
                        idle.conn,
                        idle.opened_at,
                    ));
                }

                if state.open_count < this.config.max_open {
                    state.open_count += 1;
                    this.advance_serving(&mut state);
                    drop(state);
                    match this.connector.connect() {
                        Ok(conn) => {
                            this.mark_healthy();
                            return Ok(PooledConn::new(Arc::clone(this), conn, Instant::now()));
                        }
                        Err(err) => {
                            let mut state = this.state.lock().expect("pool lock poisoned");
                            state.open_count -= 1;
                            this.available.notify_all();
                            return Err(err);
                        }
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                this.pass_turn(&mut state, ticket);
                return Err(PorterError::AcquireTimeout);
            }
            let (guard, _timeout) = this
                .available
                .wait_timeout(state, deadline - now)
                .expect("pool lock poisoned");
            state = guard;
        }
    }

    /// Move the serving cursor past this ticket, skipping any waiters
    /// that already gave up.
    fn advance_serving(&self, state: &mut PoolState) {
        state.serving_ticket += 1;
        while state.abandoned.remove(&state.serving_ticket) {
            state.serving_ticket += 1;
        }
        self.available.notify_all();
    }

    fn pass_turn(&self, state: &mut PoolState, ticket: u64) {
        if state.serving_ticket == ticket {
            self.advance_serving(state);
        } else {
            state.abandoned.insert(ticket);
        }
    }

    fn return_conn(&self, conn: Box<dyn BackendConn>, opened_at: Instant, broken: bool) {
        let mut state = self.state.lock().expect("pool lock poisoned");
        let over_idle = state.idle.len() >= self.config.max_idle;
        let expired = opened_at.elapsed() >= self.config.conn_max_lifetime;
        if broken || over_idle || expired || state.closed {
            state.open_count -= 1;
            debug!(broken, over_idle, expired, "closed returned handle");
        } else {
            state.idle.push_back(IdleConn { conn, opened_at });
        }
        self.available.notify_all();
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock().expect("pool lock poisoned");
        PoolStats {
            open: state.open_count,
            idle: state.idle.len(),
            pinned: state.pinned_count,
            in_use: state.open_count - state.idle.len(),
            waiting: (state.next_ticket - state.serving_ticket) as usize
                - state.abandoned.len(),
        }
    }

    fn mark_healthy(&self) {
        let mut last = self.last_healthy.lock().expect("health lock poisoned");
        *last = Some(Instant::now());
    }

    fn run_health_sweep(self: Arc<Self>) {
        loop {
            {
                let flag = self.shutdown.lock().expect("shutdown lock poisoned");
                let (flag, _) = self
                    .shutdown_cv
                    .wait_timeout(flag, self.config.health_check_period)
                    .expect("shutdown lock poisoned");
                if *flag {
                    return;
                }
            }
            self.sweep_once();
        }
    }

    /// Ping every idle handle off-lock; discard failures and handles past
    /// their lifetime. Probes a fresh connection when nothing is idle so
    /// health stays observable under full load.
    fn sweep_once(&self) {
        let (mut candidates, can_probe) = {
            let mut state = self.state.lock().expect("pool lock poisoned");
            let drained: Vec<IdleConn> = state.idle.drain(..).collect();
            let can_probe = drained.is_empty() && state.open_count < self.config.max_open;
            if can_probe {
                state.open_count += 1;
            }
            (drained, can_probe)
        };

        let mut healthy: Vec<IdleConn> = Vec::with_capacity(candidates.len());
        let mut discarded = 0usize;
        for mut idle in candidates.drain(..) {
            if idle.opened_at.elapsed() >= self.config.conn_max_lifetime {
                discarded += 1;
                continue;
            }
            match self.connector.is_valid(idle.conn.as_mut()) {
                Ok(()) => {
                    self.mark_healthy();
                    healthy.push(idle);
                }
                Err(err) => {
                    warn!(%err, "discarding unhealthy idle handle");
                    discarded += 1;
                }
            }
        }

        if can_probe {
            match self.connector.connect() {
                Ok(mut conn) => match conn.ping() {
                    Ok(()) => {
                        self.mark_healthy();
                        healthy.push(IdleConn {
                            conn,
                            opened_at: Instant::now(),
                        });
                    }
                    Err(err) => {
                        warn!(%err, "health probe ping failed");
                        discarded += 1;
                    }
                },
                Err(err) => {
                    warn!(%err, "health probe connect failed");
                    discarded += 1;
                }
            }
        }

        let mut state = self.state.lock().expect("pool lock poisoned");
        state.open_count -= discarded;
        for idle in healthy {
            if state.idle.len() < self.config.max_idle && !state.closed {
                state.idle.push_back(idle);
            } else {
                state.open_count -= 1;
            }
        }
        self.available.notify_all();
    }
}

/// Exclusive handle guard; returns the connection on drop.
pub struct PooledConn {
    conn: Option<Box<dyn BackendConn>>,
    opened_at: Instant,
    pinned: bool,
    broken: bool,
    pool: Arc<PoolInner>,
}

impl PooledConn {
    fn new(pool: Arc<PoolInner>, conn: Box<dyn BackendConn>, opened_at: Instant) -> Self {
        Self {
            conn: Some(conn),
            opened_at,
            pinned: false,
            broken: false,
            pool,
        }
    }

    /// Reserve this handle for a transaction or prepared statement. The
    /// handle keeps counting against `max_open` but the sweep never sees
    /// it.
    pub fn pin(&mut self) {
        if !self.pinned {
            self.pinned = true;
            let mut state = self.pool.state.lock().expect("pool lock poisoned");
            state.pinned_count += 1;
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Force the handle closed on return instead of rejoining the idle
    /// set.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Deref for PooledConn {
    type Target = dyn BackendConn;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("pooled connection taken").as_ref()
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("pooled connection taken").as_mut()
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if self.pinned {
            let mut state = self.pool.state.lock().expect("pool lock poisoned");
            state.pinned_count -= 1;
        }
        if let Some(conn) = self.conn.take() {
            self.pool.return_conn(conn, self.opened_at, self.broken);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use arrow_array::RecordBatch;

    use super::*;
    use crate::backend::{BackendKind, RowCursor};
    use crate::types::{CellValue, ColumnDesc};

    struct MockConnector {
        connects: AtomicUsize,
        fail_connect: AtomicBool,
        fail_ping: AtomicBool,
    }

    impl MockConnector {
        fn new() -> Self {
            Self {
                connects: AtomicUsize::new(0),
                fail_connect: AtomicBool::new(false),
                fail_ping: AtomicBool::new(false),
            }
        }
    }

    struct MockConn {
        fail_ping: bool,
    }

    impl BackendConn for MockConn {
        fn kind(&self) -> BackendKind {
            BackendKind::Embedded
        }

        fn query(
            &mut self,
            _sql: &str,
            _params: &[CellValue],
        ) -> Result<Box<dyn RowCursor>, PorterError> {
            Err(PorterError::Internal("not used in pool tests".into()))
        }

        fn execute(&mut self, _sql: &str, _params: &[CellValue]) -> Result<i64, PorterError> {
            Ok(0)
        }

        fn describe_columns(&mut self, _sql: &str) -> Result<Vec<ColumnDesc>, PorterError> {
            Ok(Vec::new())
        }

        fn ingest(&mut self, _table: &str, _batches: &[RecordBatch]) -> Result<i64, PorterError> {
            Ok(0)
        }

        fn begin(&mut self) -> Result<(), PorterError> {
            Ok(())
        }

        fn commit(&mut self) -> Result<(), PorterError> {
            Ok(())
        }

        fn rollback(&mut self) -> Result<(), PorterError> {
            Ok(())
        }

        fn ping(&mut self) -> Result<(), PorterError> {
            if self.fail_ping {
                Err(PorterError::Unavailable("ping failed".into()))
            } else {
                Ok(())
            }
        }
    }

    impl Connector for Arc<MockConnector> {
        fn connect(&self) -> Result<Box<dyn BackendConn>, PorterError> {
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(PorterError::Unavailable("connect refused".into()));
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockConn {
                fail_ping: self.fail_ping.load(Ordering::SeqCst),
            }))
        }

        fn kind(&self) -> BackendKind {
            BackendKind::Embedded
        }

        fn identity(&self) -> &str {
            "mock://"
        }
    }

    fn test_config(max_open: usize, acquire_timeout_ms: u64) -> PoolConfig {
        PoolConfig {
            max_open,
            max_idle: max_open,
            conn_max_lifetime: Duration::from_secs(3600),
            health_check_period: Duration::from_secs(3600),
            acquire_timeout: Duration::from_millis(acquire_timeout_ms),
        }
    }

    #[test]
    fn max_open_is_a_hard_ceiling_and_waiters_time_out() {
        let connector = Arc::new(MockConnector::new());
        let pool = Pool::new(Box::new(Arc::clone(&connector)), test_config(2, 50));

        let first = pool.acquire().expect("first handle");
        let second = pool.acquire().expect("second handle");
        assert_eq!(pool.stats().open, 2);

        let err = pool.acquire().expect_err("third must time out");
        assert!(matches!(err, PorterError::AcquireTimeout));
        // the timed-out waiter must not leak a slot
        assert_eq!(pool.stats().open, 2);

        drop(first);
        drop(second);
        assert_eq!(pool.stats().idle, 2);
        let third = pool.acquire().expect("handle after release");
        drop(third);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn released_handles_are_reused_fifo() {
        let connector = Arc::new(MockConnector::new());
        let pool = Pool::new(Box::new(Arc::clone(&connector)), test_config(1, 2_000));

        let held = pool.acquire().expect("handle");
        let pool_for_waiter = Arc::clone(&pool);
        let waiter = std::thread::spawn(move || {
            pool_for_waiter
                .acquire()
                .expect("waiter gets the released handle")
        });
        std::thread::sleep(Duration::from_millis(50));
        drop(held);
        let conn = waiter.join().expect("waiter thread");
        drop(conn);
        // a single connection served both
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lifetime_expired_handles_are_closed_on_return() {
        let connector = Arc::new(MockConnector::new());
        let mut config = test_config(2, 100);
        config.conn_max_lifetime = Duration::from_millis(10);
        let pool = Pool::new(Box::new(Arc::clone(&connector)), config);

        let conn = pool.acquire().expect("handle");
        std::thread::sleep(Duration::from_millis(20));
        drop(conn);
        let stats = pool.stats();
        assert_eq!(stats.idle, 0, "expired handle must not rejoin idle");
        assert_eq!(stats.open, 0);
    }

    #[test]
    fn idle_set_is_trimmed_to_max_idle() {
        let connector = Arc::new(MockConnector::new());
        let mut config = test_config(3, 100);
        config.max_idle = 1;
        let pool = Pool::new(Box::new(Arc::clone(&connector)), config);

        let a = pool.acquire().expect("a");
        let b = pool.acquire().expect("b");
        drop(a);
        drop(b);
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.open, 1);
    }

    #[test]
    fn pinned_handles_count_against_open_but_not_idle() {
        let connector = Arc::new(MockConnector::new());
        let pool = Pool::new(Box::new(Arc::clone(&connector)), test_config(2, 50));

        let mut conn = pool.acquire().expect("handle");
        conn.pin();
        let stats = pool.stats();
        assert_eq!(stats.pinned, 1);
        assert_eq!(stats.open, 1);
        assert_eq!(stats.idle, 0);

        drop(conn);
        let stats = pool.stats();
        assert_eq!(stats.pinned, 0);
        assert_eq!(stats.idle, 1);
    }

    #[test]
    fn failed_connect_does_not_leak_a_slot() {
        let connector = Arc::new(MockConnector::new());
        connector.fail_connect.store(true, Ordering::SeqCst);
        let pool = Pool::new(Box::new(Arc::clone(&connector)), test_config(1, 50));

        let err = pool.acquire().expect_err("connect must fail");
        assert!(matches!(err, PorterError::Unavailable(_)));
        assert_eq!(pool.stats().open, 0);

        connector.fail_connect.store(false, Ordering::SeqCst);
        let conn = pool.acquire().expect("recovered");
        drop(conn);
    }

    #[test]
    fn broken_handles_are_discarded_on_return() {
        let connector = Arc::new(MockConnector::new());
        let pool = Pool::new(Box::new(Arc::clone(&connector)), test_config(1, 50));

        let mut conn = pool.acquire().expect("handle");
        conn.mark_broken();
        drop(conn);
        assert_eq!(pool.stats().open, 0);
    }

    #[test]
    fn sweep_discards_handles_that_fail_ping() {
        let connector = Arc::new(MockConnector::new());
        let pool = Pool::new(Box::new(Arc::clone(&connector)), test_config(2, 50));

        let conn = pool.acquire().expect("handle");
        drop(conn);
        assert_eq!(pool.stats().idle, 1);

        connector.fail_ping.store(true, Ordering::SeqCst);
        // idle handle was created before the flag flipped, so its ping
        // still succeeds; flip the stored handle by re-acquiring
        pool.inner.sweep_once();
        assert_eq!(pool.stats().idle, 1, "healthy handle survives the sweep");

        // replace with a failing handle
        {
            let mut state = pool.inner.state.lock().unwrap();
            state.idle.clear();
            state.idle.push_back(IdleConn {
                conn: Box::new(MockConn { fail_ping: true }),
                opened_at: Instant::now(),
            });
        }
        pool.inner.sweep_once();
        assert_eq!(pool.stats().idle, 0, "failing handle is discarded");
    }

    #[test]
    fn ping_now_marks_the_pool_healthy() {
        let connector = Arc::new(MockConnector::new());
        let pool = Pool::new(Box::new(Arc::clone(&connector)), test_config(1, 50));
        assert!(!pool.healthy());
        pool.ping_now().expect("ping");
        assert!(pool.healthy());
    }
}
