pub mod memory;

#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
pub mod redis;

use crate::quota::CounterKey;
pub use memory::InMemoryStore;
use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// A counter together with the count it must stay below for a request to be admitted.
#[derive(Debug, Clone)]
pub struct CounterLimit {
    pub key: CounterKey,
    pub max_count: u64,
}

impl CounterLimit {
    /// Time-to-live given to the counter when it is created.
    pub fn ttl(&self) -> Duration {
        self.key.window.duration()
    }
}

/// Result of [QuotaStore::check_and_increment].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Admission {
    /// Every counter was below its limit and has been incremented. Holds the new counts, in the
    /// order the counters were given.
    Admitted(Vec<u64>),
    /// The counter at `index` had already reached its limit; nothing was incremented.
    Rejected { index: usize, count: u64 },
}

/// Describes a shared store of fixed window counters.
///
/// A store is required to implement [Clone], usually this means wrapping the data within an
/// [Arc](std::sync::Arc); connection managers already do so internally.
pub trait QuotaStore: Clone {
    type Error: std::error::Error;

    /// Current value of a counter, zero if it does not exist or has expired.
    fn peek(&self, key: &CounterKey) -> impl Future<Output = Result<u64, Self::Error>>;

    /// Atomically increments a counter, creating it with the given time-to-live if absent.
    ///
    /// Returns the new count.
    fn increment_with_expiry(
        &self,
        key: &CounterKey,
        ttl: Duration,
    ) -> impl Future<Output = Result<u64, Self::Error>>;

    /// Atomically checks every counter against its limit, and only if none has reached its
    /// limit, increments all of them.
    ///
    /// Counters are checked in order and the first exhausted one is reported. Two concurrent
    /// calls for the same counters must never both observe `max_count - 1` and pass.
    ///
    /// All counters in one call belong to the same [CounterKey::scope].
    fn check_and_increment(
        &self,
        counters: &[CounterLimit],
    ) -> impl Future<Output = Result<Admission, Self::Error>>;
}

#[derive(Debug, Error)]
pub enum Error {
    #[cfg(feature = "redis")]
    #[error(transparent)]
    Redis(#[from] redis::Error),
    #[error(transparent)]
    Memory(#[from] Infallible),
}

/// The store selected at startup.
#[derive(Clone)]
pub enum Store {
    #[cfg(feature = "redis")]
    Redis(redis::RedisStore),
    Memory(InMemoryStore),
}

impl Store {
    /// Connects to the shared store at `url`.
    ///
    /// Never fails: if the shared store cannot be reached a single warning is logged and an
    /// in-memory store is returned instead. Quotas are then only enforced per process.
    pub async fn connect(url: &str, key_prefix: Option<&str>, timeout: Duration) -> Self {
        #[cfg(feature = "redis")]
        {
            match redis::RedisStore::connect(url, key_prefix, timeout).await {
                Ok(store) => {
                    log::info!("Connected to Redis for rate limiting");
                    return Store::Redis(store);
                }
                Err(e) => {
                    log::warn!(
                        "Redis connection failed ({e}), using in-memory rate limiting; \
                         quotas will not be shared between processes"
                    );
                }
            }
        }
        #[cfg(not(feature = "redis"))]
        {
            let _ = (key_prefix, timeout);
            log::warn!(
                "Built without Redis support, ignoring {url} and using in-memory rate limiting"
            );
        }
        Store::Memory(InMemoryStore::builder().build())
    }

    /// Whether quotas are only enforced within this process.
    pub fn is_local(&self) -> bool {
        matches!(self, Store::Memory(_))
    }
}

impl QuotaStore for Store {
    type Error = Error;

    async fn peek(&self, key: &CounterKey) -> Result<u64, Self::Error> {
        match self {
            #[cfg(feature = "redis")]
            Store::Redis(store) => Ok(store.peek(key).await?),
            Store::Memory(store) => Ok(store.peek(key).await?),
        }
    }

    async fn increment_with_expiry(
        &self,
        key: &CounterKey,
        ttl: Duration,
    ) -> Result<u64, Self::Error> {
        match self {
            #[cfg(feature = "redis")]
            Store::Redis(store) => Ok(store.increment_with_expiry(key, ttl).await?),
            Store::Memory(store) => Ok(store.increment_with_expiry(key, ttl).await?),
        }
    }

    async fn check_and_increment(&self, counters: &[CounterLimit]) -> Result<Admission, Self::Error> {
        match self {
            #[cfg(feature = "redis")]
            Store::Redis(store) => Ok(store.check_and_increment(counters).await?),
            Store::Memory(store) => Ok(store.check_and_increment(counters).await?),
        }
    }
}
