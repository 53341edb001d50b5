#![forbid(unsafe_code)]

//! Per-client admission control for new download jobs.
//!
//! Exact sliding window: we keep the actual admission instants per client and
//! prune them lazily, so admission is precise at window boundaries instead of
//! bursty the way a fixed-window counter would be. Memory cost is bounded by
//! the capacity per active client; clients whose window drained completely are
//! dropped from the map.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub const DEFAULT_RATE_LIMIT: usize = 10;
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(600);

/// Outcome of one admission check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Admitted; `remaining` is how many more jobs fit in the current window.
    Granted { remaining: usize },
    /// Rejected; the oldest admission leaves the window after `retry_after`.
    Denied { retry_after: Duration },
}

pub struct RateLimiter {
    capacity: usize,
    window: Duration,
    clients: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity,
            window,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Decides admission for `key` and records the attempt when granted.
    /// Windows are fully independent across client keys.
    pub fn admit(&self, key: &str) -> Admission {
        self.admit_at(key, Instant::now())
    }

    fn admit_at(&self, key: &str, now: Instant) -> Admission {
        let mut clients = self.clients.lock();

        // Sweep expired stamps for every client while we hold the lock; this
        // also drops clients whose window drained, bounding the map across
        // many distinct sources.
        clients.retain(|client, stamps| {
            while let Some(oldest) = stamps.front() {
                if now.duration_since(*oldest) >= self.window {
                    stamps.pop_front();
                } else {
                    break;
                }
            }
            client.as_str() == key || !stamps.is_empty()
        });

        let stamps = clients.entry(key.to_owned()).or_default();
        if stamps.len() < self.capacity {
            stamps.push_back(now);
            Admission::Granted {
                remaining: self.capacity - stamps.len(),
            }
        } else {
            let retry_after = stamps
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            Admission::Denied { retry_after }
        }
    }

    #[cfg(test)]
    fn tracked_clients(&self) -> usize {
        self.clients.lock().len()
    }
}
