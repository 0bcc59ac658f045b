//! Single-flight, TTL-bound memo table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use tubewatch_core::Fingerprint;

use crate::error::{CacheError, ComputeError};

/// Values are opaque JSON documents shared between callers.
pub type CachedValue = Arc<serde_json::Value>;

/// Cache manager configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of stored entries before LRU eviction kicks in
    pub capacity: usize,
    /// TTL used by callers that do not pick their own
    pub default_ttl: Duration,
    /// Deadline for a single computation; waiters are released after it
    pub compute_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            default_ttl: Duration::from_secs(15 * 60),
            compute_timeout: Duration::from_secs(60),
        }
    }
}

/// Counters exposed to external monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub in_flight: usize,
    pub hits: u64,
    pub misses: u64,
    /// Callers that attached to another caller's computation
    pub coalesced: u64,
    pub computations: u64,
    pub compute_failures: u64,
    pub timeouts: u64,
    /// Entries dropped by capacity pressure
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed
    pub expirations: u64,
}

#[derive(Debug)]
struct Entry {
    value: CachedValue,
    stored_at: Instant,
    stored_at_wall: DateTime<Utc>,
    ttl: Duration,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < self.ttl
    }
}

type Outcome = Result<CachedValue, CacheError>;

/// A computation in progress and the callers waiting on it.
#[derive(Debug)]
struct Flight {
    outcome: Mutex<Option<Outcome>>,
    done: Condvar,
    waiters: AtomicUsize,
    deadline: Instant,
}

impl Flight {
    fn new(deadline: Instant) -> Self {
        Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
            waiters: AtomicUsize::new(0),
            deadline,
        }
    }

    /// Record the outcome (first publish wins) and wake every waiter.
    ///
    /// Returns the outcome that is now authoritative for this flight.
    fn publish(&self, outcome: Outcome) -> Outcome {
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        let effective = slot.get_or_insert(outcome).clone();
        drop(slot);
        self.done.notify_all();
        effective
    }

    fn outcome(&self) -> Option<Outcome> {
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug)]
struct Table {
    entries: LruCache<Fingerprint, Entry>,
    in_flight: HashMap<Fingerprint, Arc<Flight>>,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    computations: AtomicU64,
    compute_failures: AtomicU64,
    timeouts: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

enum Role {
    Owner(Arc<Flight>),
    Waiter(Arc<Flight>),
}

/// Content-addressed, TTL-bound store with at-most-one computation per key.
///
/// One instance is created at startup and shared (by `Arc`) with the
/// scheduler, every worker and the analytics aggregator. In-flight
/// computations are tracked outside the LRU table, so capacity pressure can
/// only evict finished entries.
#[derive(Debug)]
pub struct CacheManager {
    table: Mutex<Table>,
    config: CacheConfig,
    counters: Counters,
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            table: Mutex::new(Table {
                entries: LruCache::unbounded(),
                in_flight: HashMap::new(),
            }),
            config,
            counters: Counters::default(),
        }
    }

    pub fn arc(config: CacheConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl
    }

    fn lock_table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the live value for `key`, or compute it exactly once.
    ///
    /// 1. A live entry is returned immediately.
    /// 2. If another caller is computing `key`, block until it finishes and
    ///    return its outcome (success or error).
    /// 3. Otherwise run `compute`; store a success for `ttl`, never store an error.
    ///
    /// A computation that overruns `compute_timeout` is reported as
    /// [`CacheError::Timeout`] to everyone attached to it, and the next caller
    /// starts a fresh attempt.
    pub fn get_or_compute<F>(&self, key: &Fingerprint, ttl: Duration, compute: F) -> Result<CachedValue, CacheError>
    where
        F: FnOnce() -> Result<serde_json::Value, ComputeError>,
    {
        let role = {
            let mut table = self.lock_table();
            let now = Instant::now();

            let cached = table
                .entries
                .get(key)
                .map(|entry| (entry.is_live(now), entry.value.clone()));
            match cached {
                Some((true, value)) => {
                    Counters::bump(&self.counters.hits, 1);
                    return Ok(value);
                }
                Some((false, _)) => {
                    table.entries.pop(key);
                    Counters::bump(&self.counters.expirations, 1);
                }
                None => {}
            }
            Counters::bump(&self.counters.misses, 1);

            let current = table.in_flight.get(key).cloned();
            match current {
                Some(flight) if now < flight.deadline => {
                    flight.waiters.fetch_add(1, Ordering::Relaxed);
                    Counters::bump(&self.counters.coalesced, 1);
                    Role::Waiter(flight)
                }
                stale => {
                    if let Some(stale) = stale {
                        table.in_flight.remove(key);
                        Counters::bump(&self.counters.timeouts, 1);
                        stale.publish(Err(self.timeout_error(key)));
                        warn!(key = %key.short(), "stale computation superseded");
                    }
                    let flight = Arc::new(Flight::new(now + self.config.compute_timeout));
                    table.in_flight.insert(key.clone(), flight.clone());
                    Role::Owner(flight)
                }
            }
        };

        match role {
            Role::Waiter(flight) => self.wait_for(key, &flight),
            Role::Owner(flight) => {
                let mut guard = OwnerGuard {
                    cache: self,
                    key,
                    flight: &flight,
                    finished: false,
                };
                Counters::bump(&self.counters.computations, 1);
                let result = compute();
                guard.finish(result, ttl)
            }
        }
    }

    /// Typed wrapper over [`CacheManager::get_or_compute`].
    pub fn get_or_compute_as<T, F>(&self, key: &Fingerprint, ttl: Duration, compute: F) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, ComputeError>,
    {
        let value = self.get_or_compute(key, ttl, || {
            let typed = compute()?;
            serde_json::to_value(typed).map_err(|e| ComputeError::permanent(format!("encode: {e}")))
        })?;
        T::deserialize(&*value).map_err(|e| CacheError::Decode(e.to_string()))
    }

    /// Live value for `key` without computing or touching counters.
    pub fn peek(&self, key: &Fingerprint) -> Option<CachedValue> {
        let table = self.lock_table();
        table
            .entries
            .peek(key)
            .filter(|entry| entry.is_live(Instant::now()))
            .map(|entry| entry.value.clone())
    }

    /// Wall-clock time the live value for `key` was stored.
    pub fn stored_at(&self, key: &Fingerprint) -> Option<DateTime<Utc>> {
        let table = self.lock_table();
        table
            .entries
            .peek(key)
            .filter(|entry| entry.is_live(Instant::now()))
            .map(|entry| entry.stored_at_wall)
    }

    pub fn invalidate(&self, key: &Fingerprint) -> bool {
        self.lock_table().entries.pop(key).is_some()
    }

    pub fn clear(&self) {
        self.lock_table().entries.clear();
    }

    /// Physically drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut table = self.lock_table();
        let now = Instant::now();
        let expired: Vec<Fingerprint> = table
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            table.entries.pop(key);
        }
        Counters::bump(&self.counters.expirations, expired.len() as u64);
        expired.len()
    }

    /// Stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.lock_table().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, in_flight) = {
            let table = self.lock_table();
            (table.entries.len(), table.in_flight.len())
        };
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CacheStats {
            entries,
            in_flight,
            hits: load(&self.counters.hits),
            misses: load(&self.counters.misses),
            coalesced: load(&self.counters.coalesced),
            computations: load(&self.counters.computations),
            compute_failures: load(&self.counters.compute_failures),
            timeouts: load(&self.counters.timeouts),
            evictions: load(&self.counters.evictions),
            expirations: load(&self.counters.expirations),
        }
    }

    fn timeout_error(&self, key: &Fingerprint) -> CacheError {
        CacheError::Timeout {
            key: key.short().to_string(),
            after: self.config.compute_timeout,
        }
    }

    fn wait_for(&self, key: &Fingerprint, flight: &Arc<Flight>) -> Outcome {
        {
            let mut slot = flight.outcome.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                if let Some(outcome) = slot.as_ref() {
                    return outcome.clone();
                }
                let now = Instant::now();
                if now >= flight.deadline {
                    break;
                }
                slot = flight
                    .done
                    .wait_timeout(slot, flight.deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        }

        // Deadline passed with no outcome: retire the flight so a fresh attempt can start.
        let mut table = self.lock_table();
        let is_current = table
            .in_flight
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, flight));
        if is_current {
            table.in_flight.remove(key);
            Counters::bump(&self.counters.timeouts, 1);
            debug!(
                key = %key.short(),
                waiters = flight.waiters.load(Ordering::Relaxed),
                "computation deadline passed; releasing waiters"
            );
        }
        let outcome = flight.publish(Err(self.timeout_error(key)));
        drop(table);
        outcome
    }

    fn insert_entry(&self, table: &mut Table, key: &Fingerprint, value: CachedValue, ttl: Duration) {
        table.entries.put(
            key.clone(),
            Entry {
                value,
                stored_at: Instant::now(),
                stored_at_wall: Utc::now(),
                ttl,
            },
        );

        let mut evicted = 0u64;
        while table.entries.len() > self.config.capacity {
            if table.entries.pop_lru().is_none() {
                break;
            }
            evicted += 1;
        }
        if evicted > 0 {
            Counters::bump(&self.counters.evictions, evicted);
            debug!(evicted, capacity = self.config.capacity, "evicted least-recently-used entries");
        }
    }
}

/// Publishes the owner's outcome exactly once, even if `compute` panics.
struct OwnerGuard<'a> {
    cache: &'a CacheManager,
    key: &'a Fingerprint,
    flight: &'a Arc<Flight>,
    finished: bool,
}

impl OwnerGuard<'_> {
    fn finish(&mut self, result: Result<serde_json::Value, ComputeError>, ttl: Duration) -> Outcome {
        self.finished = true;
        let cache = self.cache;

        let proposed = match result {
            Ok(_) if Instant::now() > self.flight.deadline => Err(cache.timeout_error(self.key)),
            Ok(value) => Ok(Arc::new(value)),
            Err(e) => Err(CacheError::Compute(e)),
        };

        let mut table = cache.lock_table();
        let still_owner = table
            .in_flight
            .get(self.key)
            .is_some_and(|current| Arc::ptr_eq(current, self.flight));
        if still_owner {
            table.in_flight.remove(self.key);
        }

        let outcome = self.flight.publish(proposed);
        match &outcome {
            Ok(value) if still_owner => cache.insert_entry(&mut table, self.key, value.clone(), ttl),
            Ok(_) => {}
            Err(CacheError::Timeout { .. }) => {
                if still_owner {
                    Counters::bump(&cache.counters.timeouts, 1);
                }
                warn!(key = %self.key.short(), "computation overran its deadline; result discarded");
            }
            Err(e) => {
                Counters::bump(&cache.counters.compute_failures, 1);
                debug!(key = %self.key.short(), error = %e, "computation failed; not cached");
            }
        }
        drop(table);
        outcome
    }
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut table = self.cache.lock_table();
        let still_owner = table
            .in_flight
            .get(self.key)
            .is_some_and(|current| Arc::ptr_eq(current, self.flight));
        if still_owner {
            table.in_flight.remove(self.key);
        }
        Counters::bump(&self.cache.counters.compute_failures, 1);
        self.flight.publish(Err(CacheError::Panicked {
            key: self.key.short().to_string(),
        }));
        drop(table);
    }
}
