mod policy;

pub use policy::{Clock, QuotaPolicy, SystemClock};

#[cfg(test)]
pub(crate) use policy::tests::{FailingStore, ManualClock, MIDNIGHT};

use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Length of a fixed, calendar-aligned rate limiting window.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Window {
    Minute,
    Hour,
    Day,
}

impl Window {
    pub fn as_secs(self) -> u64 {
        match self {
            Window::Minute => 60,
            Window::Hour => 60 * 60,
            Window::Day => 24 * 60 * 60,
        }
    }

    pub fn duration(self) -> Duration {
        Duration::from_secs(self.as_secs())
    }

    /// Unix timestamp at which the window containing `now` started.
    pub fn start_of(self, now: u64) -> u64 {
        now - now % self.as_secs()
    }

    /// Seconds from `now` until the window containing `now` ends.
    ///
    /// Never zero, so a client waiting this long is guaranteed to land in the next window.
    pub fn seconds_until_boundary(self, now: u64) -> u64 {
        self.start_of(now) + self.as_secs() - now
    }

    pub fn name(self) -> &'static str {
        match self {
            Window::Minute => "minute",
            Window::Hour => "hour",
            Window::Day => "day",
        }
    }
}

impl Display for Window {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A single `max_count per window` limit.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LimitRule {
    pub max_count: u64,
    pub window: Window,
}

impl LimitRule {
    pub const fn new(max_count: u64, window: Window) -> Self {
        Self { max_count, window }
    }
}

impl Display for LimitRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} per {}", self.max_count, self.window)
    }
}

const GENERAL_RULES: [LimitRule; 2] = [
    LimitRule::new(30, Window::Minute),
    LimitRule::new(500, Window::Day),
];
const HEALTH_RULES: [LimitRule; 2] = [
    LimitRule::new(60, Window::Minute),
    LimitRule::new(1000, Window::Day),
];
const CONVERT_RULES: [LimitRule; 2] = [
    LimitRule::new(2, Window::Minute),
    LimitRule::new(5, Window::Day),
];
const UPLOAD_VALIDATION_RULES: [LimitRule; 2] = [
    LimitRule::new(10, Window::Minute),
    LimitRule::new(50, Window::Day),
];

/// A named bundle of rules applied to one class of endpoint.
///
/// Every rule must hold for a request to be admitted. Rules are listed from the shortest window
/// to the longest, so a burst is reported before a long-window violation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Tier {
    General,
    Health,
    Convert,
    UploadValidation,
}

impl Tier {
    pub fn name(self) -> &'static str {
        match self {
            Tier::General => "general",
            Tier::Health => "health",
            Tier::Convert => "convert",
            Tier::UploadValidation => "upload_validation",
        }
    }

    pub fn rules(self) -> &'static [LimitRule] {
        match self {
            Tier::General => &GENERAL_RULES,
            Tier::Health => &HEALTH_RULES,
            Tier::Convert => &CONVERT_RULES,
            Tier::UploadValidation => &UPLOAD_VALIDATION_RULES,
        }
    }

    /// User facing explanation for a denial of `rule`.
    pub fn denial_message(self, rule: &LimitRule) -> String {
        match (self, rule.window) {
            (Tier::Convert, Window::Day) => format!(
                "You've reached your daily limit of {} PDF conversions. Please try again \
                 tomorrow. This helps us keep the service free and available for everyone!",
                rule.max_count
            ),
            (Tier::Convert, _) => format!(
                "You can convert at most {} PDFs per {}. Please wait a moment and try again.",
                rule.max_count, rule.window
            ),
            (Tier::UploadValidation, _) => {
                "Too many upload attempts. Please wait a moment before trying again.".to_string()
            }
            (Tier::General | Tier::Health, _) => {
                "You're making too many requests. Please wait a moment and try again.".to_string()
            }
        }
    }
}

impl Display for Tier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifies one counter: a client's usage of one tier during one window.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct CounterKey {
    /// Client identity and tier name; every counter of a single tier check shares it.
    pub scope: String,
    pub window: Window,
    /// Unix timestamp of the window start.
    pub window_start: u64,
}

impl CounterKey {
    pub fn new(identity: &str, tier: Tier, window: Window, now: u64) -> Self {
        Self {
            scope: format!("{identity}/{tier}"),
            window,
            window_start: window.start_of(now),
        }
    }

    /// The part of the key that distinguishes counters within a scope.
    pub fn slot(&self) -> String {
        format!("{}/{}", self.window, self.window_start)
    }
}

impl Display for CounterKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.scope, self.window, self.window_start)
    }
}

/// Quota status reported to clients through the `x-ratelimit-*` headers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct QuotaStatus {
    /// Total number of requests that are permitted within the reported window.
    pub limit: u64,
    /// Number of requests that will be permitted until the window resets.
    pub remaining: u64,
    /// Seconds until the reported window resets.
    pub reset_after: u64,
}

/// Why a request was refused.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Denial {
    pub tier: Tier,
    /// The first rule of the tier (in list order) whose count was exhausted.
    pub rule: LimitRule,
    /// Seconds until `rule`'s window ends.
    pub retry_after: u64,
    pub status: QuotaStatus,
}

impl Denial {
    pub fn message(&self) -> String {
        self.tier.denial_message(&self.rule)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Decision {
    /// The request was admitted. The status is [None] when the store failed and the policy
    /// is configured to fail open.
    Allowed(Option<QuotaStatus>),
    Denied(Denial),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_alignment() {
        // 2024-01-01T00:00:30Z
        let now = 1_704_067_230;
        assert_eq!(Window::Minute.start_of(now), 1_704_067_200);
        assert_eq!(Window::Day.start_of(now), 1_704_067_200);
        assert_eq!(Window::Minute.seconds_until_boundary(now), 30);
        assert_eq!(Window::Day.seconds_until_boundary(now), 86_370);
        // Exactly on a boundary a full window remains
        assert_eq!(Window::Minute.seconds_until_boundary(1_704_067_200), 60);
    }

    #[test]
    fn test_tiers_list_short_windows_first() {
        for tier in [
            Tier::General,
            Tier::Health,
            Tier::Convert,
            Tier::UploadValidation,
        ] {
            let rules = tier.rules();
            assert!(!rules.is_empty());
            assert!(rules.iter().all(|r| r.max_count > 0));
            assert!(rules
                .windows(2)
                .all(|w| w[0].window.as_secs() <= w[1].window.as_secs()));
        }
        assert_eq!(Tier::Convert.rules()[1].to_string(), "5 per day");
    }

    #[test]
    fn test_counter_key_format() {
        let key = CounterKey::new("user:10.0.0.1:abcdef12", Tier::Convert, Window::Minute, 125);
        assert_eq!(key.to_string(), "user:10.0.0.1:abcdef12/convert/minute/120");
        assert_eq!(key.slot(), "minute/120");
    }

    #[test]
    fn test_convert_messages() {
        let day = Tier::Convert.denial_message(&Tier::Convert.rules()[1]);
        assert!(day.contains("daily limit of 5"), "got: {day}");
        let minute = Tier::Convert.denial_message(&Tier::Convert.rules()[0]);
        assert!(minute.contains("2 PDFs per minute"), "got: {minute}");
    }
}
