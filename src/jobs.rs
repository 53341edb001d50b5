#![forbid(unsafe_code)]

//! In-memory ledger of download jobs.
//!
//! Each admitted download gets one entry here, written by its worker and read
//! by the polling endpoint. Entries are evicted by age before every new job is
//! created, so the map stays bounded without a background timer. Nothing in
//! this module survives a restart; artifacts on disk are the only durable
//! output.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use serde::Serialize;

use crate::error::RegistryError;

/// How long a finished or stalled job stays queryable.
pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Starting,
    Downloading,
    Processing,
    Complete,
    Error,
}

impl JobStatus {
    /// Terminal states absorb every later update.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Downloading => "downloading",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

/// Snapshot of one job as exposed to pollers. The registry hands out clones
/// only; workers never share a mutable alias with readers.
#[derive(Clone, Debug, Serialize)]
pub struct JobState {
    pub id: String,
    pub status: JobStatus,
    pub percent: f64,
    /// Bytes per second, present only while downloading.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Seconds remaining, present only while downloading.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<u64>,
    /// Bare file name of the artifact, set on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Sanitized failure description, set on error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobState {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            status: JobStatus::Starting,
            percent: 0.0,
            speed: None,
            eta: None,
            filename: None,
            error: None,
        }
    }
}

/// Partial state merged into an existing job by [`JobRegistry::update`].
#[derive(Debug, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub percent: Option<f64>,
    pub speed: Option<f64>,
    pub eta: Option<u64>,
    pub filename: Option<String>,
    pub error: Option<String>,
}

impl JobUpdate {
    pub fn downloading(percent: f64, speed: Option<f64>, eta: Option<u64>) -> Self {
        Self {
            status: Some(JobStatus::Downloading),
            percent: Some(percent),
            speed,
            eta,
            ..Self::default()
        }
    }

    pub fn processing() -> Self {
        Self {
            status: Some(JobStatus::Processing),
            ..Self::default()
        }
    }

    pub fn complete(filename: String) -> Self {
        Self {
            status: Some(JobStatus::Complete),
            filename: Some(filename),
            ..Self::default()
        }
    }

    pub fn failed(message: String) -> Self {
        Self {
            status: Some(JobStatus::Error),
            error: Some(message),
            ..Self::default()
        }
    }
}

struct JobEntry {
    state: JobState,
    last_updated: Instant,
}

/// Concurrent map from job id to progress state.
///
/// One coarse mutex is enough here: every critical section is a handful of
/// field writes, and job volume is interactive-scale, not a firehose.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, JobEntry>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a fresh `starting` entry. Ids must be registry-unique; a
    /// collision means the id generator is broken.
    pub fn create(&self, id: &str) -> Result<(), RegistryError> {
        self.create_at(id, Instant::now())
    }

    fn create_at(&self, id: &str, now: Instant) -> Result<(), RegistryError> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(id) {
            return Err(RegistryError::DuplicateJob(id.to_owned()));
        }
        jobs.insert(
            id.to_owned(),
            JobEntry {
                state: JobState::new(id),
                last_updated: now,
            },
        );
        Ok(())
    }

    /// Merges `update` into the job and refreshes its eviction stamp.
    ///
    /// Returns `false` without touching anything when the id is unknown (an
    /// update racing a completed eviction is dropped, never resurrected) or
    /// when the job already reached a terminal state.
    pub fn update(&self, id: &str, update: JobUpdate) -> bool {
        self.update_at(id, update, Instant::now())
    }

    fn update_at(&self, id: &str, update: JobUpdate, now: Instant) -> bool {
        let mut jobs = self.jobs.lock();
        let Some(entry) = jobs.get_mut(id) else {
            return false;
        };
        if entry.state.status.is_terminal() {
            return false;
        }

        let state = &mut entry.state;
        if let Some(next) = update.status {
            match next {
                // Jobs never re-enter `starting`.
                JobStatus::Starting => {}
                JobStatus::Downloading => state.status = JobStatus::Downloading,
                JobStatus::Processing => {
                    state.status = JobStatus::Processing;
                    state.percent = 100.0;
                    state.speed = None;
                    state.eta = None;
                }
                JobStatus::Complete => {
                    state.status = JobStatus::Complete;
                    state.percent = 100.0;
                    state.filename = update.filename.clone();
                    state.speed = None;
                    state.eta = None;
                }
                JobStatus::Error => {
                    state.status = JobStatus::Error;
                    state.error = Some(
                        update
                            .error
                            .clone()
                            .unwrap_or_else(|| "download failed".to_owned()),
                    );
                    state.speed = None;
                    state.eta = None;
                }
            }
        }

        if state.status == JobStatus::Downloading {
            if let Some(percent) = update.percent {
                // Progress is monotone within the downloading phase; a tool
                // restarting a fragment must not make the bar jump backwards.
                state.percent = state.percent.max(percent.clamp(0.0, 100.0));
            }
            state.speed = update.speed;
            state.eta = update.eta;
        }

        entry.last_updated = now;
        true
    }

    /// Returns an immutable snapshot of the job, if it is still tracked.
    pub fn snapshot(&self, id: &str) -> Option<JobState> {
        self.jobs.lock().get(id).map(|entry| entry.state.clone())
    }

    /// Drops every entry whose last update is older than `max_age`. Safe to
    /// call concurrently with creates and updates; runs before each create
    /// rather than on a timer.
    pub fn evict_older_than(&self, max_age: Duration) {
        self.evict_at(max_age, Instant::now());
    }

    fn evict_at(&self, max_age: Duration, now: Instant) {
        self.jobs
            .lock()
            .retain(|_, entry| now.duration_since(entry.last_updated) <= max_age);
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}

/// Generates an opaque 12-hex-character job id from the OS RNG. Short enough
/// to read in a URL, random enough that reuse within a registry lifetime is
/// not a practical concern.
pub fn generate_job_id() -> String {
    let mut bytes = [0u8; 6];
    OsRng.fill_bytes(&mut bytes);
    let mut id = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(id, "{byte:02x}");
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_starts_at_zero() {
        let registry = JobRegistry::new();
        registry.create("abc").unwrap();
        let state = registry.snapshot("abc").unwrap();
        assert_eq!(state.status, JobStatus::Starting);
        assert_eq!(state.percent, 0.0);
        assert!(state.filename.is_none());
        assert!(state.error.is_none());
    }

    #[test]
    fn create_rejects_duplicate_ids() {
        let registry = JobRegistry::new();
        registry.create("abc").unwrap();
        let err = registry.create("abc").unwrap_err();
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn update_unknown_job_is_dropped() {
        let registry = JobRegistry::new();
        assert!(!registry.update("ghost", JobUpdate::processing()));
        assert!(registry.is_empty());
    }

    #[test]
    fn percent_is_monotone_while_downloading() {
        let registry = JobRegistry::new();
        registry.create("abc").unwrap();
        registry.update("abc", JobUpdate::downloading(40.0, Some(1024.0), Some(30)));
        registry.update("abc", JobUpdate::downloading(25.0, Some(512.0), Some(60)));
        let state = registry.snapshot("abc").unwrap();
        assert_eq!(state.percent, 40.0);
        // Speed and eta always reflect the latest event.
        assert_eq!(state.speed, Some(512.0));
        assert_eq!(state.eta, Some(60));
    }

    #[test]
    fn percent_is_clamped() {
        let registry = JobRegistry::new();
        registry.create("abc").unwrap();
        registry.update("abc", JobUpdate::downloading(150.0, None, None));
        assert_eq!(registry.snapshot("abc").unwrap().percent, 100.0);
    }

    #[test]
    fn processing_freezes_percent_and_clears_rates() {
        let registry = JobRegistry::new();
        registry.create("abc").unwrap();
        registry.update("abc", JobUpdate::downloading(80.0, Some(2048.0), Some(5)));
        registry.update("abc", JobUpdate::processing());
        let state = registry.snapshot("abc").unwrap();
        assert_eq!(state.status, JobStatus::Processing);
        assert_eq!(state.percent, 100.0);
        assert!(state.speed.is_none());
        assert!(state.eta.is_none());
    }

    #[test]
    fn complete_sets_filename_only() {
        let registry = JobRegistry::new();
        registry.create("abc").unwrap();
        registry.update("abc", JobUpdate::complete("video.mp3".into()));
        let state = registry.snapshot("abc").unwrap();
        assert_eq!(state.status, JobStatus::Complete);
        assert_eq!(state.percent, 100.0);
        assert_eq!(state.filename.as_deref(), Some("video.mp3"));
        assert!(state.error.is_none());
    }

    #[test]
    fn error_sets_message_only() {
        let registry = JobRegistry::new();
        registry.create("abc").unwrap();
        registry.update("abc", JobUpdate::failed("tool exited with status 1".into()));
        let state = registry.snapshot("abc").unwrap();
        assert_eq!(state.status, JobStatus::Error);
        assert_eq!(state.error.as_deref(), Some("tool exited with status 1"));
        assert!(state.filename.is_none());
    }

    #[test]
    fn terminal_states_latch() {
        let registry = JobRegistry::new();
        registry.create("abc").unwrap();
        registry.update("abc", JobUpdate::complete("video.mp4".into()));
        assert!(!registry.update("abc", JobUpdate::failed("late failure".into())));
        assert!(!registry.update("abc", JobUpdate::downloading(10.0, None, None)));
        let state = registry.snapshot("abc").unwrap();
        assert_eq!(state.status, JobStatus::Complete);
        assert_eq!(state.filename.as_deref(), Some("video.mp4"));
        assert!(state.error.is_none());
    }

    #[test]
    fn eviction_removes_only_stale_entries() {
        let registry = JobRegistry::new();
        let start = Instant::now();
        registry.create_at("old", start).unwrap();
        registry
            .create_at("fresh", start + Duration::from_secs(3500))
            .unwrap();
        registry.evict_at(Duration::from_secs(3600), start + Duration::from_secs(3700));
        assert!(registry.snapshot("old").is_none());
        assert!(registry.snapshot("fresh").is_some());
    }

    #[test]
    fn updates_refresh_the_eviction_stamp() {
        let registry = JobRegistry::new();
        let start = Instant::now();
        registry.create_at("abc", start).unwrap();
        registry.update_at(
            "abc",
            JobUpdate::downloading(10.0, None, None),
            start + Duration::from_secs(3000),
        );
        registry.evict_at(Duration::from_secs(3600), start + Duration::from_secs(4000));
        assert!(registry.snapshot("abc").is_some());
    }

    #[test]
    fn job_ids_are_distinct_and_well_formed() {
        let first = generate_job_id();
        let second = generate_job_id();
        assert_eq!(first.len(), 12);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first, second);
    }

    #[test]
    fn status_serializes_lowercase() {
        let state = JobState::new("abc");
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["status"], "starting");
        assert_eq!(json["percent"], 0.0);
        assert!(json.get("filename").is_none());
    }
}
