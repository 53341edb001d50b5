#![forbid(unsafe_code)]

//! Drives one admitted download to a terminal state.
//!
//! Runs on a blocking thread; the only work done from the progress callback is
//! a registry merge, so the tool's own execution never stalls on us.

use crate::extractor::{Extractor, FetchRequest, ProgressEvent};
use crate::jobs::{JobRegistry, JobUpdate};

/// Runs the fetch and records every state transition. Exactly one terminal
/// update is written per call; the job is never retried here.
pub fn run_job(registry: &JobRegistry, extractor: &dyn Extractor, request: &FetchRequest) {
    let job_id = request.job_id.as_str();

    let result = extractor.fetch(request, &mut |event| match event {
        ProgressEvent::Downloading {
            downloaded_bytes,
            total_bytes,
            speed,
            eta,
        } => {
            let percent = match total_bytes {
                // Round to one decimal; pollers render this directly.
                Some(total) if total > 0 => {
                    (downloaded_bytes as f64 / total as f64 * 1000.0).round() / 10.0
                }
                // Unknown total: report zero rather than inventing progress.
                _ => 0.0,
            };
            registry.update(job_id, JobUpdate::downloading(percent, speed, eta));
        }
        ProgressEvent::Finished => {
            registry.update(job_id, JobUpdate::processing());
        }
    });

    match result {
        Ok(path) => {
            // Only the bare name leaves the worker; clients never see paths.
            let filename = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| job_id.to_owned());
            registry.update(job_id, JobUpdate::complete(filename));
        }
        Err(err) => {
            // Full detail stays in the server log; pollers get the scrubbed
            // version.
            eprintln!("Job {job_id} failed: {err:#}");
            registry.update(job_id, JobUpdate::failed(sanitize_tool_error(&format!("{err:#}"))));
        }
    }
}

/// Reduces raw tool output to a short message safe to show a client: prefer
/// the tool's own ERROR line, drop every token that looks like a filesystem
/// path, and cap the length.
pub fn sanitize_tool_error(raw: &str) -> String {
    let line = raw
        .lines()
        .find(|line| line.trim_start().starts_with("ERROR:"))
        .or_else(|| raw.lines().find(|line| !line.trim().is_empty()))
        .unwrap_or("");

    let cleaned: Vec<&str> = line
        .split_whitespace()
        .filter(|token| !token.contains('/') && !token.contains('\\'))
        .collect();

    let mut message: String = cleaned.join(" ").chars().take(200).collect();
    if message.is_empty() {
        message = "download failed".to_owned();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{FormatChoice, VideoProbe};
    use crate::jobs::JobStatus;
    use anyhow::{Result, bail};
    use std::path::PathBuf;

    /// Scripted stand-in for yt-dlp: replays a fixed event sequence, then
    /// succeeds with a path or fails with a canned error.
    struct ScriptedExtractor {
        events: Vec<ProgressEvent>,
        outcome: Result<PathBuf, String>,
    }

    impl Extractor for ScriptedExtractor {
        fn probe(&self, _url: &str, _browser: Option<&str>) -> Result<VideoProbe> {
            bail!("not used in worker tests")
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
            Ok(String::new())
        }
    }

    fn request(job_id: &str) -> FetchRequest {
        FetchRequest {
            url: "https://example.test/watch?v=abc".into(),
            format: FormatChoice::Audio,
            browser: None,
            job_id: job_id.into(),
            output_dir: PathBuf::from("/tmp/ignored"),
        }
    }

    fn downloading(downloaded: u64, total: Option<u64>) -> ProgressEvent {
        ProgressEvent::Downloading {
            downloaded_bytes: downloaded,
            total_bytes: total,
            speed: Some(1024.0),
            eta: Some(3),
        }
    }

    #[test]
    fn successful_audio_job_reaches_complete() {
        let registry = JobRegistry::new();
        registry.create("job1").unwrap();
        let extractor = ScriptedExtractor {
            events: vec![
                downloading(50, Some(100)),
                downloading(100, Some(100)),
                ProgressEvent::Finished,
            ],
            outcome: Ok(PathBuf::from("/downloads/job1_video.mp3")),
        };

        run_job(&registry, &extractor, &request("job1"));

        let state = registry.snapshot("job1").unwrap();
        assert_eq!(state.status, JobStatus::Complete);
        assert_eq!(state.percent, 100.0);
        assert_eq!(state.filename.as_deref(), Some("job1_video.mp3"));
        assert!(state.error.is_none());
    }

    #[test]
    fn unknown_total_reports_zero_percent() {
        let registry = JobRegistry::new();
        registry.create("job1").unwrap();
        let extractor = ScriptedExtractor {
            events: vec![downloading(5000, None)],
            outcome: Err("ERROR: interrupted".into()),
        };

        run_job(&registry, &extractor, &request("job1"));

        // The downloading phase never showed fake progress.
        let state = registry.snapshot("job1").unwrap();
        assert_eq!(state.percent, 0.0);
        assert_eq!(state.status, JobStatus::Error);
    }

    #[test]
    fn mid_download_failure_yields_sanitized_error() {
        let registry = JobRegistry::new();
        registry.create("job1").unwrap();
        let extractor = ScriptedExtractor {
            events: vec![downloading(30, Some(100))],
            outcome: Err("ERROR: unable to write /srv/media/partial/job1_video.mp4.part".into()),
        };

        run_job(&registry, &extractor, &request("job1"));

        let state = registry.snapshot("job1").unwrap();
        assert_eq!(state.status, JobStatus::Error);
        let message = state.error.unwrap();
        assert!(!message.is_empty());
        assert!(!message.contains("/srv/media"));
        assert!(!message.contains("job1_video.mp4.part"));
    }

    #[test]
    fn failure_after_eviction_is_silently_dropped() {
        let registry = JobRegistry::new();
        // Never created: simulates the eviction sweep winning the race.
        let extractor = ScriptedExtractor {
            events: vec![downloading(10, Some(100))],
            outcome: Err("ERROR: too late".into()),
        };
        run_job(&registry, &extractor, &request("gone"));
        assert!(registry.snapshot("gone").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn sanitize_prefers_error_lines_and_strips_paths() {
        let raw = "WARNING: something minor\nERROR: HTTP 403 at /var/cache/yt/fragment_3\n";
        let message = sanitize_tool_error(raw);
        assert_eq!(message, "ERROR: HTTP 403 at");
        assert!(!message.contains("/var/cache"));
    }

    #[test]
    fn sanitize_never_returns_empty() {
        assert_eq!(sanitize_tool_error(""), "download failed");
        assert_eq!(sanitize_tool_error("/only/a/path"), "download failed");
    }

    #[test]
    fn sanitize_caps_length() {
        let raw = format!("ERROR: {}", "x".repeat(500));
        assert_eq!(sanitize_tool_error(&raw).chars().count(), 200);
    }
}
