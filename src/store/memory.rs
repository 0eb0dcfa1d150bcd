use crate::quota::CounterKey;
use crate::store::{Admission, CounterLimit, QuotaStore};
use actix_web::rt::task::JoinHandle;
use actix_web::rt::time::Instant;
use dashmap::DashMap;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_GC_INTERVAL_SECONDS: u64 = 60 * 10;

/// A fixed window [QuotaStore] that keeps counters in a [DashMap](dashmap::DashMap).
///
/// Counters are grouped by [CounterKey::scope], so the entry lock of a scope covers every counter
/// of a tier check. Only suitable for a single process.
#[derive(Clone)]
pub struct InMemoryStore {
    map: Arc<DashMap<String, Bucket>>,
    gc_handle: Option<Arc<GcHandle>>,
}

#[derive(Default)]
struct Bucket {
    slots: HashMap<String, Value>,
}

struct Value {
    ttl: Instant,
    count: u64,
}

impl Bucket {
    fn live_count(&self, slot: &str, now: Instant) -> u64 {
        match self.slots.get(slot) {
            Some(v) if v.ttl > now => v.count,
            _ => 0,
        }
    }

    fn increment(&mut self, slot: String, ttl: Duration, now: Instant) -> u64 {
        let expiry = now.checked_add(ttl).expect("TTL unexpectedly large");
        let value = self.slots.entry(slot).or_insert(Value {
            ttl: expiry,
            count: 0,
        });
        // An expired counter starts again from zero with a fresh TTL
        if value.ttl <= now {
            value.ttl = expiry;
            value.count = 0;
        }
        value.count += 1;
        value.count
    }

    fn retain_live(&mut self, now: Instant) -> bool {
        self.slots.retain(|_k, v| v.ttl > now);
        !self.slots.is_empty()
    }
}

// Aborts the garbage collector once the last clone of the store is dropped.
struct GcHandle(JoinHandle<()>);

impl Drop for GcHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl InMemoryStore {
    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder {
            gc_interval: Some(Duration::from_secs(DEFAULT_GC_INTERVAL_SECONDS)),
        }
    }

    fn garbage_collector(map: Arc<DashMap<String, Bucket>>, interval: Duration) -> JoinHandle<()> {
        assert!(
            interval.as_secs_f64() > 0f64,
            "GC interval must be non-zero"
        );
        actix_web::rt::spawn(async move {
            loop {
                let now = Instant::now();
                map.retain(|_k, bucket| bucket.retain_live(now));
                actix_web::rt::time::sleep_until(now + interval).await;
            }
        })
    }
}

impl QuotaStore for InMemoryStore {
    type Error = Infallible;

    async fn peek(&self, key: &CounterKey) -> Result<u64, Self::Error> {
        let now = Instant::now();
        Ok(self
            .map
            .get(&key.scope)
            .map(|bucket| bucket.live_count(&key.slot(), now))
            .unwrap_or(0))
    }

    async fn increment_with_expiry(
        &self,
        key: &CounterKey,
        ttl: Duration,
    ) -> Result<u64, Self::Error> {
        let now = Instant::now();
        let mut bucket = self.map.entry(key.scope.clone()).or_default();
        Ok(bucket.increment(key.slot(), ttl, now))
    }

    async fn check_and_increment(
        &self,
        counters: &[CounterLimit],
    ) -> Result<Admission, Self::Error> {
        let Some(first) = counters.first() else {
            return Ok(Admission::Admitted(Vec::new()));
        };
        let now = Instant::now();
        // Holding the entry makes the check and the increments a single step
        let mut bucket = self.map.entry(first.key.scope.clone()).or_default();
        for (index, counter) in counters.iter().enumerate() {
            let count = bucket.live_count(&counter.key.slot(), now);
            if count >= counter.max_count {
                return Ok(Admission::Rejected { index, count });
            }
        }
        let counts = counters
            .iter()
            .map(|counter| bucket.increment(counter.key.slot(), counter.ttl(), now))
            .collect();
        Ok(Admission::Admitted(counts))
    }
}

pub struct InMemoryStoreBuilder {
    gc_interval: Option<Duration>,
}

impl InMemoryStoreBuilder {
    /// Override the default garbage collector interval.
    ///
    /// Set to None to disable garbage collection.
    ///
    /// The garbage collector periodically scans the internal map, removing expired counters.
    pub fn with_gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn build(self) -> InMemoryStore {
        let map = Arc::new(DashMap::<String, Bucket>::new());
        let gc_handle = self.gc_interval.map(|gc_interval| {
            Arc::new(GcHandle(InMemoryStore::garbage_collector(
                map.clone(),
                gc_interval,
            )))
        });
        InMemoryStore { map, gc_handle }
    }
}
