use crate::quota::{CounterKey, Decision, Denial, LimitRule, QuotaStatus, Tier};
use crate::store::{Admission, CounterLimit, QuotaStore};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the current time for window alignment.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now_unix(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Decides whether a client may make a request of a given [Tier].
pub struct QuotaPolicy<S> {
    store: S,
    clock: Arc<dyn Clock>,
    fail_open: bool,
}

impl<S: QuotaStore> QuotaPolicy<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            fail_open: true,
        }
    }

    /// Choose whether to allow a request if the store returns a failure.
    ///
    /// Default is true: quotas control cost, they are not a security boundary.
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// The counters `identity` uses for `tier` right now, in rule order.
    pub fn counter_keys(&self, identity: &str, tier: Tier) -> Vec<CounterKey> {
        let now = self.clock.now_unix();
        tier.rules()
            .iter()
            .map(|rule| CounterKey::new(identity, tier, rule.window, now))
            .collect()
    }

    /// Admits the request and consumes one unit of every rule of the tier, or denies it without
    /// consuming anything.
    ///
    /// A store failure is returned as an error only when the policy fails closed.
    pub async fn check_and_consume(
        &self,
        identity: &str,
        tier: Tier,
    ) -> Result<Decision, S::Error> {
        let now = self.clock.now_unix();
        let rules = tier.rules();
        let counters: Vec<CounterLimit> = rules
            .iter()
            .map(|rule| CounterLimit {
                key: CounterKey::new(identity, tier, rule.window, now),
                max_count: rule.max_count,
            })
            .collect();

        match self.store.check_and_increment(&counters).await {
            Ok(Admission::Admitted(counts)) => {
                let status = tightest_status(rules, &counts, now);
                Ok(Decision::Allowed(status))
            }
            Ok(Admission::Rejected { index, .. }) => {
                let rule = rules[index];
                let retry_after = rule.window.seconds_until_boundary(now);
                Ok(Decision::Denied(Denial {
                    tier,
                    rule,
                    retry_after,
                    status: QuotaStatus {
                        limit: rule.max_count,
                        remaining: 0,
                        reset_after: retry_after,
                    },
                }))
            }
            Err(e) => {
                if self.fail_open {
                    log::warn!("Rate limiter failed: {e}, allowing the request anyway");
                    Ok(Decision::Allowed(None))
                } else {
                    log::error!("Rate limiter failed: {e}");
                    Err(e)
                }
            }
        }
    }
}

// Reports the rule closest to exhaustion, the first one listed on ties.
fn tightest_status(rules: &[LimitRule], counts: &[u64], now: u64) -> Option<QuotaStatus> {
    rules
        .iter()
        .zip(counts)
        .map(|(rule, &count)| QuotaStatus {
            limit: rule.max_count,
            remaining: rule.max_count.saturating_sub(count),
            reset_after: rule.window.seconds_until_boundary(now),
        })
        .reduce(|best, next| {
            if next.remaining < best.remaining {
                next
            } else {
                best
            }
        })
}
