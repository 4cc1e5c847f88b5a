//! Fingerprinted schema/result cache with single-flight builds.
//!
//! Entries are immutable once published and shared by reference count.
//! At most one build runs per fingerprint; concurrent callers for the
//! same fingerprint wait on the winner's completion token instead of
//! re-executing the build. Build failures are never cached.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Condvar, Mutex};

use arrow_schema::SchemaRef;
use lru::LruCache;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::PorterError;

/// Stable hash over (normalized SQL, backend identity, parameter shape).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(sql: &str, backend_identity: &str, param_shape: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalize_sql(sql).as_bytes());
        hasher.update([0u8]);
        hasher.update(backend_identity.as_bytes());
        for shape in param_shape {
            hasher.update([0u8]);
            hasher.update(shape.as_bytes());
        }
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            hex.push_str(&format!("{byte:02x}"));
        }
        Fingerprint(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading 64 bits of the digest, used as a compact schema id inside
    /// tickets.
    pub fn short_id(&self) -> u64 {
        u64::from_str_radix(&self.0[..16], 16).unwrap_or(0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whitespace-collapsed, trailing-semicolon-stripped SQL. Case is left
/// alone: literals are case-sensitive and a missed hit is cheaper than a
/// wrong one.
fn normalize_sql(sql: &str) -> String {
    sql.trim()
        .trim_end_matches(';')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Immutable cached artifact for one fingerprint.
pub struct CacheEntry {
    pub schema: SchemaRef,
    pub head_batches: Vec<arrow_array::RecordBatch>,
    pub bytes: usize,
}

impl CacheEntry {
    pub fn schema_only(schema: SchemaRef) -> Self {
        let bytes = schema
            .fields()
            .iter()
            .map(|f| f.name().len() + 16)
            .sum::<usize>();
        Self {
            schema,
            head_batches: Vec::new(),
            bytes,
        }
    }

    pub fn with_head_batches(
        schema: SchemaRef,
        head_batches: Vec<arrow_array::RecordBatch>,
    ) -> Self {
        let bytes = head_batches
            .iter()
            .map(|b| b.get_array_memory_size())
            .sum::<usize>()
            .max(1);
        Self {
            schema,
            head_batches,
            bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct QueryCache {
    state: Mutex<CacheState>,
    max_bytes: usize,
}

struct CacheState {
    entries: LruCache<Fingerprint, Arc<CacheEntry>>,
    total_bytes: usize,
    in_flight: HashMap<Fingerprint, Arc<BuildToken>>,
    stats: CacheStats,
}

struct BuildToken {
    done: Mutex<Option<Result<Arc<CacheEntry>, String>>>,
    cv: Condvar,
}

impl QueryCache {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).expect("nonzero capacity");
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(cap),
                total_bytes: 0,
                in_flight: HashMap::new(),
                stats: CacheStats::default(),
            }),
            max_bytes,
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.state.lock().expect("cache lock poisoned").stats
    }

    /// Fetch the entry for `fp`, building it at most once across
    /// concurrent callers. The build runs without the cache lock held.
    pub fn get_or_build(
        &self,
        fp: &Fingerprint,
        build: impl FnOnce() -> Result<CacheEntry, PorterError>,
    ) -> Result<Arc<CacheEntry>, PorterError> {
        let token = {
            let mut state = self.state.lock().expect("cache lock poisoned");
            if let Some(entry) = state.entries.get(fp) {
                let entry = Arc::clone(entry);
                state.stats.hits += 1;
                return Ok(entry);
            }
            if let Some(token) = state.in_flight.get(fp) {
                let token = Arc::clone(token);
                state.stats.hits += 1;
                drop(state);
                return wait_for_build(&token);
            }
            state.stats.misses += 1;
            let token = Arc::new(BuildToken {
                done: Mutex::new(None),
                cv: Condvar::new(),
            });
            state.in_flight.insert(fp.clone(), Arc::clone(&token));
            token
        };

        let built = build();

        let mut state = self.state.lock().expect("cache lock poisoned");
        state.in_flight.remove(fp);
        let outcome = match built {
            Ok(entry) => {
                let entry = Arc::new(entry);
                self.publish(&mut state, fp.clone(), Arc::clone(&entry));
                Ok(entry)
            }
            Err(err) => Err(err),
        };
        drop(state);

        let shared = match &outcome {
            Ok(entry) => Ok(Arc::clone(entry)),
            Err(err) => Err(err.to_string()),
        };
        {
            let mut done = token.done.lock().expect("token lock poisoned");
            *done = Some(shared);
            token.cv.notify_all();
        }
        outcome
    }

    fn publish(&self, state: &mut CacheState, fp: Fingerprint, entry: Arc<CacheEntry>) {
        if entry.bytes > self.max_bytes {
            debug!(fingerprint = %fp, bytes = entry.bytes, "entry exceeds cache budget, not cached");
            return;
        }
        state.total_bytes += entry.bytes;
        if let Some((_, evicted)) = state.entries.push(fp, entry) {
            state.total_bytes -= evicted.bytes;
            state.stats.evictions += 1;
        }
        while state.total_bytes > self.max_bytes {
            match state.entries.pop_lru() {
                Some((_, evicted)) => {
                    state.total_bytes -= evicted.bytes;
                    state.stats.evictions += 1;
                }
                None => break,
            }
        }
    }
}

fn wait_for_build(token: &BuildToken) -> Result<Arc<CacheEntry>, PorterError> {
    let mut done = token.done.lock().expect("token lock poisoned");
    while done.is_none() {
        done = token.cv.wait(done).expect("token lock poisoned");
    }
    match done.as_ref().expect("checked above") {
        Ok(entry) => Ok(Arc::clone(entry)),
        Err(msg) => Err(PorterError::QueryFailed(msg.clone())),
    }
}
