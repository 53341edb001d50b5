#![forbid(unsafe_code)]

use std::time::Duration;

use thiserror::Error;

/// Rejections surfaced synchronously at submission time. Anything that goes
/// wrong after a job was admitted is only visible through status polling.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("a video URL is required")]
    MissingUrl,
    #[error("download limit reached; retry in {}s", retry_after_secs(.0))]
    RateLimited(Duration),
}

impl SubmitError {
    /// Seconds the client should wait before retrying, rounded up so a caller
    /// never retries inside the window.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::MissingUrl => None,
            Self::RateLimited(remaining) => Some(retry_after_secs(remaining)),
        }
    }
}

fn retry_after_secs(remaining: &Duration) -> u64 {
    let secs = remaining.as_secs();
    if remaining.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Job ids are random and registry-unique; hitting this means id
    /// generation is broken, not that a caller raced.
    #[error("job {0} already exists")]
    DuplicateJob(String),
}
