use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Subscription tier. Determines how much history is kept and for how long.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Free,
    Pro,
}

/// Capacity and retention limits for a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPolicy {
    pub max_history_messages: usize,
    pub retention_days: u32,
    /// Minimum time between two retention cleanups.
    pub cleanup_interval: Duration,
}

impl Tier {
    pub const ALL: [Tier; 2] = [Tier::Free, Tier::Pro];

    pub fn policy(&self) -> TierPolicy {
        match self {
            Tier::Free => TierPolicy {
                max_history_messages: 50,
                retention_days: 7,
                cleanup_interval: Duration::hours(24),
            },
            Tier::Pro => TierPolicy {
                max_history_messages: 10_000,
                retention_days: 365,
                cleanup_interval: Duration::days(7),
            },
        }
    }

    pub fn max_history_messages(&self) -> usize {
        self.policy().max_history_messages
    }

    pub fn retention_days(&self) -> u32 {
        self.policy().retention_days
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "pro" | "paid" => Ok(Tier::Pro),
            other => Err(format!("unknown tier '{other}': must be one of free, pro")),
        }
    }
}

/// Persisted tier state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    pub tier: Tier,
    pub tier_started_at: DateTime<Utc>,
    pub last_cleanup_at: Option<DateTime<Utc>>,
}

impl TierConfig {
    pub fn new(tier: Tier) -> Self {
        Self {
            tier,
            tier_started_at: Utc::now(),
            last_cleanup_at: None,
        }
    }

    /// True if no cleanup has ever run, or the tier's interval has elapsed.
    pub fn is_cleanup_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_cleanup_at {
            None => true,
            Some(last) => now - last > self.tier.policy().cleanup_interval,
        }
    }

    /// Oldest timestamp retained by a cleanup run at `now`.
    pub fn retention_cutoff(&self, now: DateTime<Utc>, older_than_days: Option<u32>) -> DateTime<Utc> {
        let days = older_than_days.unwrap_or_else(|| self.tier.retention_days());
        now - Duration::days(i64::from(days))
    }
}

impl Default for TierConfig {
    fn default() -> Self {
        Self::new(Tier::default())
    }
}
