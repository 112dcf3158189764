use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use std::time::Duration;

/// A UTC timestamp wrapper around `chrono::DateTime<Utc>`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UtcTime {
    inner: DateTime<Utc>,
}

impl UtcTime {
    /// The current UTC time.
    pub fn now() -> Self {
        Self { inner: Utc::now() }
    }

    /// Nanoseconds since the Unix epoch (saturating past year 2262).
    pub fn now_nanos() -> i64 {
        Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
    }

    pub fn timestamp(&self) -> i64 {
        self.inner.timestamp()
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.inner.timestamp_millis()
    }

    /// Whether `self + timeout` is in the past.
    pub fn expired(&self, timeout: Duration) -> bool {
        let deadline = self.inner + chrono::Duration::from_std(timeout).unwrap_or_default();
        deadline < Utc::now()
    }

    pub fn elapsed(&self) -> Duration {
        (Utc::now() - self.inner).to_std().unwrap_or(Duration::ZERO)
    }
}

impl fmt::Debug for UtcTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UtcTime({})", self.inner.to_rfc3339())
    }
}

impl fmt::Display for UtcTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.to_rfc3339())
    }
}

impl Default for UtcTime {
    fn default() -> Self {
        Self {
            inner: DateTime::<Utc>::default(),
        }
    }
}

impl From<DateTime<Utc>> for UtcTime {
    fn from(dt: DateTime<Utc>) -> Self {
        Self { inner: dt }
    }
}
