use crate::quota::CounterKey;
use crate::store::{Admission, CounterLimit, QuotaStore};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::borrow::Cow;
use std::time::Duration;
use thiserror::Error;

// Reads every counter first and only increments when none is exhausted, so a rejected request
// never consumes quota. Replies {0, count1, count2, ...} or {index, count} (1-based index).
const CHECK_AND_INCREMENT_SCRIPT: &str = r"
for i = 1, #KEYS do
    local current = tonumber(redis.call('GET', KEYS[i]) or '0')
    if current >= tonumber(ARGV[2 * i - 1]) then
        return {i, current}
    end
end
local reply = {0}
for i = 1, #KEYS do
    reply[i + 1] = redis.call('INCR', KEYS[i])
    redis.call('EXPIRE', KEYS[i], ARGV[2 * i], 'NX')
end
return reply
";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(
        #[source]
        #[from]
        redis::RedisError,
    ),
    #[error("Timed out after {0:?} connecting to Redis")]
    ConnectTimeout(Duration),
    #[error("Unexpected reply from the quota script: {0:?}")]
    UnexpectedReply(Vec<u64>),
}

/// A fixed window [QuotaStore] that stores counters in Redis, shared between processes.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    key_prefix: Option<String>,
    script: Script,
}

impl RedisStore {
    /// Create a RedisStore Builder.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use pdf_latex_converter::store::redis::RedisStore;
    /// # use redis::aio::ConnectionManager;
    /// # async fn example() {
    /// let client = redis::Client::open("redis://127.0.0.1/").unwrap();
    /// let manager = ConnectionManager::new(client).await.unwrap();
    /// let store = RedisStore::builder(manager).build();
    /// # };
    /// ```
    pub fn builder(connection: ConnectionManager) -> Builder {
        Builder {
            connection,
            key_prefix: None,
        }
    }

    /// Opens a connection to `url` and checks it answers `PING` within `timeout`.
    pub async fn connect(
        url: &str,
        key_prefix: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let client = redis::Client::open(url)?;
        let connect = async {
            // A single attempt; the connection manager would otherwise retry with backoff.
            let mut probe = client.get_multiplexed_tokio_connection().await?;
            let _: String = redis::cmd("PING").query_async(&mut probe).await?;
            ConnectionManager::new(client.clone()).await
        };
        let connection = actix_web::rt::time::timeout(timeout, connect)
            .await
            .map_err(|_| Error::ConnectTimeout(timeout))??;
        Ok(Self::builder(connection).key_prefix(key_prefix).build())
    }

    fn make_key<'t>(&self, key: &'t str) -> Cow<'t, str> {
        match &self.key_prefix {
            None => Cow::Borrowed(key),
            Some(prefix) => Cow::Owned(format!("{prefix}{key}")),
        }
    }
}

pub struct Builder {
    connection: ConnectionManager,
    key_prefix: Option<String>,
}

impl Builder {
    /// Apply an optional prefix to all counter keys given to this store.
    ///
    /// This may be useful when the Redis instance is being used for other purposes; the prefix is
    /// used as a 'namespace' to avoid collision with other caches or keys inside Redis.
    pub fn key_prefix(mut self, key_prefix: Option<&str>) -> Self {
        self.key_prefix = key_prefix.map(ToOwned::to_owned);
        self
    }

    pub fn build(self) -> RedisStore {
        RedisStore {
            connection: self.connection,
            key_prefix: self.key_prefix,
            script: Script::new(CHECK_AND_INCREMENT_SCRIPT),
        }
    }
}

impl QuotaStore for RedisStore {
    type Error = Error;

    async fn peek(&self, key: &CounterKey) -> Result<u64, Self::Error> {
        let key = key.to_string();
        let key = self.make_key(&key);
        let mut con = self.connection.clone();
        let count: Option<u64> = con.get(key.as_ref()).await?;
        Ok(count.unwrap_or(0))
    }

    async fn increment_with_expiry(
        &self,
        key: &CounterKey,
        ttl: Duration,
    ) -> Result<u64, Self::Error> {
        let key = key.to_string();
        let key = self.make_key(&key);

        let mut pipe = redis::pipe();
        pipe.atomic()
            // Increment the counter
            .cmd("INCR")
            .arg(key.as_ref())
            // Set the key to expire (only if it doesn't already have an expiry)
            .cmd("EXPIRE")
            .arg(key.as_ref())
            .arg(ttl.as_secs())
            .arg("NX")
            .ignore();

        let mut con = self.connection.clone();
        let (count,): (u64,) = pipe.query_async(&mut con).await?;
        Ok(count)
    }

    async fn check_and_increment(
        &self,
        counters: &[CounterLimit],
    ) -> Result<Admission, Self::Error> {
        let mut invocation = self.script.prepare_invoke();
        for counter in counters {
            let key = counter.key.to_string();
            invocation
                .key(self.make_key(&key).as_ref())
                .arg(counter.max_count)
                .arg(counter.ttl().as_secs());
        }

        let mut con = self.connection.clone();
        let reply: Vec<u64> = invocation.invoke_async(&mut con).await?;
        match reply.split_first() {
            Some((0, counts)) if counts.len() == counters.len() => {
                Ok(Admission::Admitted(counts.to_vec()))
            }
            Some((&index, [count])) if index >= 1 && index as usize <= counters.len() => {
                Ok(Admission::Rejected {
                    index: index as usize - 1,
                    count: *count,
                })
            }
            _ => Err(Error::UnexpectedReply(reply)),
        }
    }
}
