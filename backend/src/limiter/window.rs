use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Stale windows are swept once the table grows past this many clients, at
/// most once per period.
const PRUNE_THRESHOLD: usize = 10_000;

/// A request budget such as `10/minute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RateLimit {
    pub requests: u32,
    pub period: Duration,
}

impl RateLimit {
    pub fn per_minute(requests: u32) -> Self {
        Self {
            requests,
            period: Duration::from_secs(60),
        }
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::per_minute(10)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid rate limit '{0}', expected <count>/<second|minute|hour>")]
pub struct ParseRateLimitError(String);

impl FromStr for RateLimit {
    type Err = ParseRateLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseRateLimitError(s.to_string());
        let (count, unit) = s.trim().split_once('/').ok_or_else(invalid)?;
        let requests: u32 = count.trim().parse().map_err(|_| invalid())?;
        if requests == 0 {
            return Err(invalid());
        }
        let seconds = match unit.trim().to_ascii_lowercase().as_str() {
            "s" | "sec" | "second" => 1,
            "m" | "min" | "minute" => 60,
            "h" | "hour" => 3600,
            _ => return Err(invalid()),
        };
        Ok(Self {
            requests,
            period: Duration::from_secs(seconds),
        })
    }
}

impl TryFrom<String> for RateLimit {
    type Error = ParseRateLimitError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RateLimit> for String {
    fn from(limit: RateLimit) -> Self {
        limit.to_string()
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.period.as_secs() {
            1 => "second".to_string(),
            60 => "minute".to_string(),
            3600 => "hour".to_string(),
            other => format!("{other}s"),
        };
        write!(f, "{}/{}", self.requests, unit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rate limit exceeded, retry after {retry_after:?}")]
pub struct RateLimited {
    pub retry_after: Duration,
}

impl RateLimited {
    /// Whole seconds until the window resets, never zero.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs.max(1)
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window counter per client key. A window opens on a client's first
/// request and admits `limit.requests` requests until `limit.period` has
/// elapsed, then the count starts over.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    limit: RateLimit,
    table: Mutex<WindowTable>,
}

#[derive(Debug, Default)]
struct WindowTable {
    clients: HashMap<String, Window>,
    last_sweep: Option<Instant>,
}

impl WindowTable {
    fn sweep(&mut self, now: Instant, period: Duration) {
        if self.clients.len() < PRUNE_THRESHOLD {
            return;
        }
        if self
            .last_sweep
            .is_some_and(|at| now.saturating_duration_since(at) < period)
        {
            return;
        }
        self.clients
            .retain(|_, w| now.saturating_duration_since(w.started) < period);
        self.last_sweep = Some(now);
    }
}

impl FixedWindowLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            table: Mutex::new(WindowTable::default()),
        }
    }

    #[cfg(test)]
    fn tracked_clients(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clients
            .len()
    }

    pub fn check(&self, client: &str) -> Result<(), RateLimited> {
        self.check_at(client, Instant::now())
    }

    /// Counts one request from `client` at `now`.
    pub fn check_at(&self, client: &str, now: Instant) -> Result<(), RateLimited> {
        // The map only holds counters, so a poisoned lock is still usable.
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.sweep(now, self.limit.period);

        let window = table.clients.entry(client.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        let elapsed = now.saturating_duration_since(window.started);
        if elapsed >= self.limit.period {
            window.started = now;
            window.count = 0;
        }

        if window.count >= self.limit.requests {
            return Err(RateLimited {
                retry_after: self.limit.period - now.saturating_duration_since(window.started),
            });
        }

        window.count += 1;
        Ok(())
    }
}
