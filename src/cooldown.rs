#![forbid(unsafe_code)]

//! Gate for a rare, shared maintenance action (the extractor self-update).
//! The check-and-stamp runs under one lock so two concurrent triggers can
//! never both pass.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub const DEFAULT_UPDATE_COOLDOWN: Duration = Duration::from_secs(600);

pub struct CooldownGuard {
    cooldown: Duration,
    last_action: Mutex<Option<Instant>>,
}

impl CooldownGuard {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_action: Mutex::new(None),
        }
    }

    /// Stamps the action time and returns `Ok` when the cooldown has elapsed
    /// (or the action never ran); otherwise returns how long is left, leaving
    /// the stamp untouched.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&self, now: Instant) -> Result<(), Duration> {
        let mut last = self.last_action.lock();
        if let Some(previous) = *last {
            let elapsed = now.duration_since(previous);
            if elapsed < self.cooldown {
                return Err(self.cooldown - elapsed);
            }
        }
        *last = Some(now);
        Ok(())
    }
}
