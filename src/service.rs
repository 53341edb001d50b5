#![forbid(unsafe_code)]

//! Orchestrator tying admission, job creation, and worker dispatch together.
//!
//! Transport-free: the HTTP layer translates requests into these calls and
//! status codes out of the results. All shared state is owned here and
//! injected at construction; nothing module-global.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cooldown::{CooldownGuard, DEFAULT_UPDATE_COOLDOWN};
use crate::error::SubmitError;
use crate::extractor::{Extractor, FetchRequest, FormatChoice, VideoProbe};
use crate::jobs::{DEFAULT_JOB_RETENTION, JobRegistry, JobState, JobUpdate, generate_job_id};
use crate::ratelimit::{Admission, DEFAULT_RATE_LIMIT, DEFAULT_RATE_WINDOW, RateLimiter};
use crate::worker;

/// Tunables for admission and retention, normally filled from the runtime
/// config.
#[derive(Clone, Copy, Debug)]
pub struct ServiceLimits {
    pub rate_limit: usize,
    pub rate_window: Duration,
    pub job_retention: Duration,
    pub update_cooldown: Duration,
}

impl Default for ServiceLimits {
    fn default() -> Self {
        Self {
            rate_limit: DEFAULT_RATE_LIMIT,
            rate_window: DEFAULT_RATE_WINDOW,
            job_retention: DEFAULT_JOB_RETENTION,
            update_cooldown: DEFAULT_UPDATE_COOLDOWN,
        }
    }
}

/// Successful submission: the id to poll plus how much admission budget the
/// client has left in the current window.
#[derive(Clone, Debug)]
pub struct Submitted {
    pub job_id: String,
    pub rate_limit_remaining: usize,
}

/// Outcome of a tool-update request.
#[derive(Clone, Copy, Debug)]
pub struct UpdateDecision {
    pub accepted: bool,
    pub retry_after: Option<Duration>,
}

/// One downloaded file as listed to clients.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub filename: String,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

#[derive(Clone)]
pub struct DownloadService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    registry: Arc<JobRegistry>,
    limiter: RateLimiter,
    update_guard: CooldownGuard,
    extractor: Arc<dyn Extractor>,
    download_root: PathBuf,
    job_retention: Duration,
}

impl DownloadService {
    pub fn new(
        download_root: PathBuf,
        extractor: Arc<dyn Extractor>,
        limits: ServiceLimits,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                registry: Arc::new(JobRegistry::new()),
                limiter: RateLimiter::new(limits.rate_limit, limits.rate_window),
                update_guard: CooldownGuard::new(limits.update_cooldown),
                extractor,
                download_root,
                job_retention: limits.job_retention,
            }),
        }
    }

    /// Validates and admits a download, then dispatches its worker. Once this
    /// returns `Ok` the submit has succeeded for good; any later failure is
    /// only visible through [`DownloadService::status`].
    pub fn submit(
        &self,
        url: &str,
        format: &str,
        browser: Option<&str>,
        client_key: &str,
    ) -> Result<Submitted, SubmitError> {
        let url = normalize_url(url).ok_or(SubmitError::MissingUrl)?;

        let remaining = match self.inner.limiter.admit(client_key) {
            Admission::Granted { remaining } => remaining,
            Admission::Denied { retry_after } => return Err(SubmitError::RateLimited(retry_after)),
        };

        // Low job volume makes an opportunistic sweep before each create
        // cheaper than a background timer.
        self.inner.registry.evict_older_than(self.inner.job_retention);

        let job_id = generate_job_id();
        self.inner
            .registry
            .create(&job_id)
            .expect("freshly generated job id collided");

        let request = FetchRequest {
            url,
            format: FormatChoice::parse(format),
            browser: browser
                .map(str::trim)
                .filter(|value| !value.is_empty() && *value != "none")
                .map(str::to_owned),
            job_id: job_id.clone(),
            output_dir: self.inner.download_root.clone(),
        };

        let registry = self.inner.registry.clone();
        let extractor = self.inner.extractor.clone();
        let spawned_id = job_id.clone();
        tokio::spawn(async move {
            let worker_registry = registry.clone();
            let joined = tokio::task::spawn_blocking(move || {
                worker::run_job(&worker_registry, extractor.as_ref(), &request);
            })
            .await;

            // A panicked worker still leaves the job in a terminal state.
            if let Err(err) = joined {
                eprintln!("Worker for job {spawned_id} aborted: {err}");
                registry.update(
                    &spawned_id,
                    JobUpdate::failed("internal worker failure".to_owned()),
                );
            }
        });

        Ok(Submitted {
            job_id,
            rate_limit_remaining: remaining,
        })
    }

    /// Snapshot of one job, or `None` when unknown or already evicted.
    pub fn status(&self, job_id: &str) -> Option<JobState> {
        self.inner.registry.snapshot(job_id)
    }

    /// Fetches metadata and formats without admitting a job. Runs the blocking
    /// probe off the request path.
    pub async fn probe(&self, url: &str, browser: Option<&str>) -> Result<VideoProbe> {
        let url = normalize_url(url).ok_or_else(|| anyhow!("a video URL is required"))?;
        let extractor = self.inner.extractor.clone();
        let browser = browser.map(str::to_owned);
        tokio::task::spawn_blocking(move || extractor.probe(&url, browser.as_deref()))
            .await
            .map_err(|err| anyhow!("probe task aborted: {err}"))?
    }

    /// Lists downloaded artifacts, newest first. A missing download directory
    /// is an empty library, not an error.
    pub fn list_artifacts(&self) -> Result<Vec<Artifact>> {
        let mut files = Vec::new();
        let entries = match fs::read_dir(&self.inner.download_root) {
            Ok(entries) => entries,
            Err(_) => return Ok(files),
        };

        for entry in entries {
            let entry = entry.context("reading download directory")?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let metadata = entry.metadata().context("reading artifact metadata")?;
            if !metadata.is_file() {
                continue;
            }
            let modified: DateTime<Utc> = metadata
                .modified()
                .map(DateTime::from)
                .unwrap_or_else(|_| Utc::now());
            files.push(Artifact {
                filename: name,
                size_bytes: metadata.len(),
                modified,
            });
        }

        files.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(files)
    }

    /// Requests the shared extractor self-update. At most one update runs per
    /// cooldown interval, no matter how many clients ask.
    pub fn request_tool_update(&self) -> UpdateDecision {
        match self.inner.update_guard.try_acquire() {
            Ok(()) => {
                let extractor = self.inner.extractor.clone();
                tokio::spawn(async move {
                    match tokio::task::spawn_blocking(move || extractor.self_update()).await {
                        Ok(Ok(report)) if !report.is_empty() => {
                            println!("Extractor update: {report}");
                        }
                        Ok(Ok(_)) => println!("Extractor update finished"),
                        Ok(Err(err)) => eprintln!("Extractor update failed: {err:#}"),
                        Err(err) => eprintln!("Extractor update task aborted: {err}"),
                    }
                });
                UpdateDecision {
                    accepted: true,
                    retry_after: None,
                }
            }
            Err(remaining) => UpdateDecision {
                accepted: false,
                retry_after: Some(remaining),
            },
        }
    }
}

/// Trims the URL and defaults the scheme: bare hostnames become https URLs,
/// empty input is rejected.
fn normalize_url(url: &str) -> Option<String> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Some(trimmed.to_owned())
    } else {
        Some(format!("https://{trimmed}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::ProgressEvent;
    use crate::jobs::JobStatus;
    use anyhow::bail;
    use std::path::{Path, PathBuf};
    use tempfile::tempdir;

    struct ScriptedExtractor {
        events: Vec<ProgressEvent>,
        outcome: Result<PathBuf, String>,
    }

    impl ScriptedExtractor {
        fn succeeding(path: &str) -> Arc<Self> {
            Arc::new(Self {
                events: vec![
                    ProgressEvent::Downloading {
                        downloaded_bytes: 50,
                        total_bytes: Some(100),
                        speed: Some(2048.0),
                        eta: Some(2),
                    },
                    ProgressEvent::Downloading {
                        downloaded_bytes: 100,
                        total_bytes: Some(100),
                        speed: Some(2048.0),
                        eta: Some(0),
                    },
                    ProgressEvent::Finished,
                ],
                outcome: Ok(PathBuf::from(path)),
            })
        }

        fn failing(message: &str) -> Arc<Self> {
            Arc::new(Self {
                events: Vec::new(),
                outcome: Err(message.to_owned()),
            })
        }
    }

    impl Extractor for ScriptedExtractor {
        fn probe(&self, url: &str, _browser: Option<&str>) -> Result<VideoProbe> {
            Ok(VideoProbe {
                title: format!("probe of {url}"),
                thumbnail: String::new(),
                duration: 0,
                uploader: "Unknown".into(),
                view_count: 0,
                description: String::new(),
                formats: Vec::new(),
            })
        }

        fn fetch(
            &self,
            _request: &FetchRequest,
            on_progress: &mut dyn FnMut(ProgressEvent),
        ) -> Result<PathBuf> {
            for event in &self.events {
                on_progress(*event);
            }
            match &self.outcome {
                Ok(path) => Ok(path.clone()),
                Err(message) => bail!("{message}"),
            }
        }

        fn self_update(&self) -> Result<String> {
            Ok("yt-dlp is up to date".into())
        }
    }

    fn service_with(extractor: Arc<dyn Extractor>, root: &Path, limits: ServiceLimits) -> DownloadService {
        DownloadService::new(root.to_path_buf(), extractor, limits)
    }

    async fn wait_terminal(service: &DownloadService, job_id: &str) -> JobState {
        for _ in 0..400 {
            if let Some(state) = service.status(job_id)
                && state.status.is_terminal()
            {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn submit_runs_job_to_completion() {
        let dir = tempdir().unwrap();
        let service = service_with(
            ScriptedExtractor::succeeding("/downloads/deadbeef_video.mp3"),
            dir.path(),
            ServiceLimits::default(),
        );

        let submitted = service
            .submit("https://example.test/watch?v=abc", "audio", None, "1.2.3.4")
            .unwrap();
        assert_eq!(submitted.rate_limit_remaining, 9);
        assert!(matches!(
            service.status(&submitted.job_id).unwrap().status,
            JobStatus::Starting | JobStatus::Downloading | JobStatus::Processing | JobStatus::Complete
        ));

        let state = wait_terminal(&service, &submitted.job_id).await;
        assert_eq!(state.status, JobStatus::Complete);
        assert_eq!(state.percent, 100.0);
        assert_eq!(state.filename.as_deref(), Some("deadbeef_video.mp3"));
    }

    #[tokio::test]
    async fn submit_failure_is_observable_via_polling() {
        let dir = tempdir().unwrap();
        let service = service_with(
            ScriptedExtractor::failing("ERROR: unsupported URL /somewhere/on/disk"),
            dir.path(),
            ServiceLimits::default(),
        );

        let submitted = service
            .submit("https://example.test/broken", "best", None, "1.2.3.4")
            .unwrap();
        let state = wait_terminal(&service, &submitted.job_id).await;
        assert_eq!(state.status, JobStatus::Error);
        let message = state.error.unwrap();
        assert!(!message.contains("/somewhere"));
    }

    #[tokio::test]
    async fn submit_rejects_blank_urls_before_admission() {
        let dir = tempdir().unwrap();
        let service = service_with(
            ScriptedExtractor::succeeding("/x/y.mp4"),
            dir.path(),
            ServiceLimits {
                rate_limit: 1,
                ..ServiceLimits::default()
            },
        );

        assert!(matches!(
            service.submit("   ", "best", None, "1.2.3.4"),
            Err(SubmitError::MissingUrl)
        ));
        // The failed validation consumed no admission budget.
        assert!(service.submit("example.test/v", "best", None, "1.2.3.4").is_ok());
    }

    #[tokio::test]
    async fn submit_enforces_the_rate_limit_per_client() {
        let dir = tempdir().unwrap();
        let service = service_with(
            ScriptedExtractor::succeeding("/x/y.mp4"),
            dir.path(),
            ServiceLimits {
                rate_limit: 1,
                ..ServiceLimits::default()
            },
        );

        service
            .submit("https://example.test/a", "best", None, "1.2.3.4")
            .unwrap();
        let err = service
            .submit("https://example.test/b", "best", None, "1.2.3.4")
            .unwrap_err();
        assert!(matches!(err, SubmitError::RateLimited(_)));
        assert!(err.retry_after_seconds().unwrap() >= 1);

        // Another client is unaffected.
        assert!(
            service
                .submit("https://example.test/c", "best", None, "5.6.7.8")
                .is_ok()
        );
    }

    #[tokio::test]
    async fn probe_normalizes_the_url_scheme() {
        let dir = tempdir().unwrap();
        let service = service_with(
            ScriptedExtractor::succeeding("/x/y.mp4"),
            dir.path(),
            ServiceLimits::default(),
        );
        let probe = service.probe("example.test/v", None).await.unwrap();
        assert_eq!(probe.title, "probe of https://example.test/v");
    }

    #[tokio::test]
    async fn list_artifacts_orders_newest_first_and_skips_hidden() {
        let dir = tempdir().unwrap();
        let service = service_with(
            ScriptedExtractor::succeeding("/x/y.mp4"),
            dir.path(),
            ServiceLimits::default(),
        );

        fs::write(dir.path().join("older_clip.mp4"), b"aaaa").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        fs::write(dir.path().join("newer_song.mp3"), b"bb").unwrap();
        fs::write(dir.path().join(".DS_Store"), b"junk").unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();

        let files = service.list_artifacts().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].filename, "newer_song.mp3");
        assert_eq!(files[0].size_bytes, 2);
        assert_eq!(files[1].filename, "older_clip.mp4");
    }

    #[tokio::test]
    async fn list_artifacts_tolerates_missing_directory() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        let service = service_with(
            ScriptedExtractor::succeeding("/x/y.mp4"),
            &missing,
            ServiceLimits::default(),
        );
        assert!(service.list_artifacts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn tool_update_is_gated_by_the_cooldown() {
        let dir = tempdir().unwrap();
        let service = service_with(
            ScriptedExtractor::succeeding("/x/y.mp4"),
            dir.path(),
            ServiceLimits::default(),
        );

        let first = service.request_tool_update();
        assert!(first.accepted);
        assert!(first.retry_after.is_none());

        let second = service.request_tool_update();
        assert!(!second.accepted);
        assert!(second.retry_after.unwrap() > Duration::ZERO);
    }

    #[test]
    fn normalize_url_defaults_https() {
        assert_eq!(
            normalize_url("youtube.com/watch?v=abc").as_deref(),
            Some("https://youtube.com/watch?v=abc")
        );
        assert_eq!(
            normalize_url(" http://example.test ").as_deref(),
            Some("http://example.test")
        );
        assert!(normalize_url("").is_none());
        assert!(normalize_url("   ").is_none());
    }
}
