//! Gateway metrics: monotonic counters and cumulative histograms.
//!
//! Everything is lock-free atomics behind one shared handle, rendered on
//! demand as Prometheus text. Query counters are kept per backend kind.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::BackendKind;

const LATENCY_BUCKETS_MS: [u64; 10] = [1, 5, 10, 25, 50, 100, 250, 1_000, 5_000, 30_000];
const BATCH_ROW_BUCKETS: [u64; 8] = [1, 16, 64, 256, 1_024, 4_096, 16_384, 65_536];

#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    queries_started: PerBackend,
    queries_completed: PerBackend,
    queries_failed: PerBackend,
    batches_emitted: AtomicU64,
    bytes_emitted: AtomicU64,
    rows_ingested: AtomicU64,
    acquire_waits: AtomicU64,
    acquire_timeouts: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_evictions: AtomicU64,
    tickets_expired: AtomicU64,
    prepared_reaped: AtomicU64,
    query_latency: Histogram,
    acquire_latency: Histogram,
    batch_rows: Histogram,
}

struct PerBackend {
    embedded: AtomicU64,
    remote: AtomicU64,
}

impl PerBackend {
    fn new() -> Self {
        Self {
            embedded: AtomicU64::new(0),
            remote: AtomicU64::new(0),
        }
    }

    fn inc(&self, kind: BackendKind) {
        match kind {
            BackendKind::Embedded => self.embedded.fetch_add(1, Ordering::Relaxed),
            BackendKind::Remote => self.remote.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn get(&self, kind: BackendKind) -> u64 {
        match kind {
            BackendKind::Embedded => self.embedded.load(Ordering::Relaxed),
            BackendKind::Remote => self.remote.load(Ordering::Relaxed),
        }
    }
}

/// Fixed-bucket cumulative histogram.
struct Histogram {
    bounds: &'static [u64],
    counts: Vec<AtomicU64>,
    sum: AtomicU64,
    total: AtomicU64,
}

impl Histogram {
    fn new(bounds: &'static [u64]) -> Self {
        Self {
            bounds,
            counts: (0..bounds.len()).map(|_| AtomicU64::new(0)).collect(),
            sum: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: u64) {
        for (idx, bound) in self.bounds.iter().enumerate() {
            if value <= *bound {
                self.counts[idx].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    fn render(&self, out: &mut String, name: &str, help: &str) {
        out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} histogram\n"));
        for (idx, bound) in self.bounds.iter().enumerate() {
            out.push_str(&format!(
                "{name}_bucket{{le=\"{bound}\"}} {}\n",
                self.counts[idx].load(Ordering::Relaxed)
            ));
        }
        let total = self.total.load(Ordering::Relaxed);
        out.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {total}\n"));
        out.push_str(&format!(
            "{name}_sum {}\n",
            self.sum.load(Ordering::Relaxed)
        ));
        out.push_str(&format!("{name}_count {total}\n"));
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                queries_started: PerBackend::new(),
                queries_completed: PerBackend::new(),
                queries_failed: PerBackend::new(),
                batches_emitted: AtomicU64::new(0),
                bytes_emitted: AtomicU64::new(0),
                rows_ingested: AtomicU64::new(0),
                acquire_waits: AtomicU64::new(0),
                acquire_timeouts: AtomicU64::new(0),
                cache_hits: AtomicU64::new(0),
                cache_misses: AtomicU64::new(0),
                cache_evictions: AtomicU64::new(0),
                tickets_expired: AtomicU64::new(0),
                prepared_reaped: AtomicU64::new(0),
                query_latency: Histogram::new(&LATENCY_BUCKETS_MS),
                acquire_latency: Histogram::new(&LATENCY_BUCKETS_MS),
                batch_rows: Histogram::new(&BATCH_ROW_BUCKETS),
            }),
        }
    }

    pub fn query_started(&self, kind: BackendKind) {
        self.inner.queries_started.inc(kind);
    }

    pub fn query_completed(&self, kind: BackendKind, latency: Duration) {
        self.inner.queries_completed.inc(kind);
        self.inner.query_latency.observe(latency.as_millis() as u64);
    }

    pub fn query_failed(&self, kind: BackendKind) {
        self.inner.queries_failed.inc(kind);
    }

    pub fn batch_emitted(&self, rows: usize, bytes: usize) {
        self.inner.batches_emitted.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_emitted
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.inner.batch_rows.observe(rows as u64);
    }

    pub fn rows_ingested(&self, rows: u64) {
        self.inner.rows_ingested.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn acquire_wait(&self, latency: Duration) {
        self.inner.acquire_waits.fetch_add(1, Ordering::Relaxed);
        self.inner
            .acquire_latency
            .observe(latency.as_millis() as u64);
    }

    pub fn acquire_timeout(&self) {
        self.inner.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Reconcile cache counters gathered by the cache itself.
    pub fn record_cache_stats(&self, stats: crate::cache::CacheStats) {
        self.inner.cache_hits.store(stats.hits, Ordering::Relaxed);
        self.inner
            .cache_misses
            .store(stats.misses, Ordering::Relaxed);
        self.inner
            .cache_evictions
            .store(stats.evictions, Ordering::Relaxed);
    }

    pub fn ticket_expired(&self) {
        self.inner.tickets_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn prepared_reaped(&self, count: u64) {
        self.inner.prepared_reaped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn batches_emitted(&self) -> u64 {
        self.inner.batches_emitted.load(Ordering::Relaxed)
    }

    /// Prometheus text exposition.
    pub fn render(&self, pool: Option<crate::pool::PoolStats>) -> String {
        let inner = &self.inner;
        let mut out = String::with_capacity(4096);

        for (name, help, counter) in [
            (
                "porter_queries_started_total",
                "Queries started",
                &inner.queries_started,
            ),
            (
                "porter_queries_completed_total",
                "Queries completed",
                &inner.queries_completed,
            ),
            (
                "porter_queries_failed_total",
                "Queries failed",
                &inner.queries_failed,
            ),
        ] {
            out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} counter\n"));
            for kind in [BackendKind::Embedded, BackendKind::Remote] {
                out.push_str(&format!(
                    "{name}{{backend=\"{kind}\"}} {}\n",
                    counter.get(kind)
                ));
            }
        }

        for (name, help, value) in [
            (
                "porter_batches_emitted_total",
                "Record batches streamed to clients",
                inner.batches_emitted.load(Ordering::Relaxed),
            ),
            (
                "porter_bytes_emitted_total",
                "Batch bytes streamed to clients",
                inner.bytes_emitted.load(Ordering::Relaxed),
            ),
            (
                "porter_rows_ingested_total",
                "Rows written through DoPut",
                inner.rows_ingested.load(Ordering::Relaxed),
            ),
            (
                "porter_pool_acquire_waits_total",
                "Pool acquires",
                inner.acquire_waits.load(Ordering::Relaxed),
            ),
            (
                "porter_pool_acquire_timeouts_total",
                "Pool acquires that timed out",
                inner.acquire_timeouts.load(Ordering::Relaxed),
            ),
            (
                "porter_cache_hits_total",
                "Cache hits",
                inner.cache_hits.load(Ordering::Relaxed),
            ),
            (
                "porter_cache_misses_total",
                "Cache misses",
                inner.cache_misses.load(Ordering::Relaxed),
            ),
            (
                "porter_cache_evictions_total",
                "Cache evictions",
                inner.cache_evictions.load(Ordering::Relaxed),
            ),
            (
                "porter_tickets_expired_total",
                "Tickets rejected as expired",
                inner.tickets_expired.load(Ordering::Relaxed),
            ),
            (
                "porter_prepared_reaped_total",
                "Idle prepared statements reaped",
                inner.prepared_reaped.load(Ordering::Relaxed),
            ),
        ] {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
            ));
        }

        if let Some(pool) = pool {
            for (name, help, value) in [
                ("porter_pool_open", "Open backend handles", pool.open),
                ("porter_pool_idle", "Idle backend handles", pool.idle),
                ("porter_pool_pinned", "Pinned backend handles", pool.pinned),
                ("porter_pool_in_use", "Handles checked out", pool.in_use),
                ("porter_pool_waiting", "Waiters queued", pool.waiting),
            ] {
                out.push_str(&format!(
                    "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"
                ));
            }
        }

        inner.query_latency.render(
            &mut out,
            "porter_query_latency_ms",
            "Query latency in milliseconds",
        );
        inner.acquire_latency.render(
            &mut out,
            "porter_pool_acquire_latency_ms",
            "Pool acquire latency in milliseconds",
        );
        inner
            .batch_rows
            .render(&mut out, "porter_batch_rows", "Rows per emitted batch");

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotonic_and_labeled_per_backend() {
        let metrics = Metrics::new();
        metrics.query_started(BackendKind::Embedded);
        metrics.query_started(BackendKind::Embedded);
        metrics.query_started(BackendKind::Remote);
        metrics.query_failed(BackendKind::Remote);

        let text = metrics.render(None);
        assert!(text.contains("porter_queries_started_total{backend=\"embedded\"} 2"));
        assert!(text.contains("porter_queries_started_total{backend=\"remote\"} 1"));
        assert!(text.contains("porter_queries_failed_total{backend=\"remote\"} 1"));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let metrics = Metrics::new();
        metrics.batch_emitted(10, 100);
        metrics.batch_emitted(1000, 100);

        let text = metrics.render(None);
        assert!(text.contains("porter_batch_rows_bucket{le=\"16\"} 1"));
        assert!(text.contains("porter_batch_rows_bucket{le=\"1024\"} 2"));
        assert!(text.contains("porter_batch_rows_bucket{le=\"+Inf\"} 2"));
        assert!(text.contains("porter_batch_rows_count 2"));
        assert!(text.contains("porter_batch_rows_sum 1010"));
    }

    #[test]
    fn pool_gauges_render_when_provided() {
        let metrics = Metrics::new();
        let stats = crate::pool::PoolStats {
            open: 3,
            idle: 1,
            pinned: 1,
            in_use: 2,
            waiting: 0,
        };
        let text = metrics.render(Some(stats));
        assert!(text.contains("porter_pool_open 3"));
        assert!(text.contains("porter_pool_pinned 1"));
    }
}
