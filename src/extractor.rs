#![forbid(unsafe_code)]

//! yt-dlp adapter.
//!
//! All extraction, format negotiation, and muxing happens inside yt-dlp (and
//! ffmpeg, which it drives); this module only builds invocations, parses the
//! machine-readable progress stream, and locates the artifact afterwards. The
//! [`Extractor`] trait is the seam the worker is tested through.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use std::{env, fs, thread};

use anyhow::{Context, Result, anyhow, bail};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Desktop UA sent on every tool invocation; some extractors behave
/// differently for unknown agents.
const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Player clients that avoid most YouTube 403s for anonymous requests.
const YOUTUBE_EXTRACTOR_ARGS: &str = "youtube:player_client=tv,web_safari";

/// Progress lines we ask yt-dlp to print on stdout. Fields are
/// whitespace-separated; missing values come through as the literal `NA`.
const PROGRESS_TEMPLATE: &str = "download:tubedrop %(progress.status)s \
     %(progress.downloaded_bytes)s %(progress.total_bytes)s \
     %(progress.total_bytes_estimate)s %(progress.speed)s %(progress.eta)s";
const PROGRESS_PREFIX: &str = "tubedrop ";

/// How many trailing stderr lines to keep for failure reporting.
const STDERR_TAIL_LINES: usize = 50;

/// Requested output flavour, mapped onto a yt-dlp format selector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FormatChoice {
    Best,
    /// Audio only, extracted to mp3.
    Audio,
    /// Capped video height (1080/720/480/360 presets).
    MaxHeight(u32),
    /// Anything else is passed to yt-dlp verbatim as a format selector.
    Other(String),
}

impl FormatChoice {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "" | "best" => Self::Best,
            "audio" => Self::Audio,
            "1080p" => Self::MaxHeight(1080),
            "720p" => Self::MaxHeight(720),
            "480p" => Self::MaxHeight(480),
            "360p" => Self::MaxHeight(360),
            other => Self::Other(other.to_owned()),
        }
    }

    /// Pre-combined formats are preferred to keep yt-dlp off the DASH paths
    /// that 403 without authentication.
    fn selector(&self) -> String {
        match self {
            Self::Best => "best[ext=mp4]/best".to_owned(),
            Self::Audio => "bestaudio/best".to_owned(),
            Self::MaxHeight(height) => {
                format!("best[height<={height}][ext=mp4]/best[height<={height}]/best")
            }
            Self::Other(selector) => selector.clone(),
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, Self::Audio)
    }
}

/// One download invocation, fully specified by the orchestrator.
#[derive(Clone, Debug)]
pub struct FetchRequest {
    pub url: String,
    pub format: FormatChoice,
    /// Browser to lift cookies from (passed straight to the tool), if any.
    pub browser: Option<String>,
    pub job_id: String,
    pub output_dir: PathBuf,
}

/// Progress events as the tool emits them, in order.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ProgressEvent {
    Downloading {
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
        speed: Option<f64>,
        eta: Option<u64>,
    },
    /// Transfer done; post-processing (audio extraction, remux) may follow.
    Finished,
}

/// Metadata returned by a probe, shaped for the info endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct VideoProbe {
    pub title: String,
    pub thumbnail: String,
    pub duration: u64,
    pub uploader: String,
    pub view_count: u64,
    pub description: String,
    pub formats: Vec<FormatSummary>,
}

#[derive(Clone, Debug, Serialize)]
pub struct FormatSummary {
    pub format_id: String,
    pub ext: String,
    pub resolution: String,
    pub filesize: Option<u64>,
    pub vcodec: String,
    pub acodec: String,
    pub fps: Option<f64>,
    pub tbr: Option<f64>,
}

/// Seam between the job machinery and the external tool. The worker only ever
/// talks to this trait, which is what lets tests script progress sequences
/// without spawning processes.
pub trait Extractor: Send + Sync {
    /// Fetches metadata and available formats without downloading.
    fn probe(&self, url: &str, browser: Option<&str>) -> Result<VideoProbe>;

    /// Runs the download to completion, invoking `on_progress` synchronously
    /// for every event the tool emits, and returns the artifact path.
    fn fetch(
        &self,
        request: &FetchRequest,
        on_progress: &mut dyn FnMut(ProgressEvent),
    ) -> Result<PathBuf>;

    /// Asks the tool to update itself; returns its report.
    fn self_update(&self) -> Result<String>;
}

/// The real tool. Binary resolution honours `TUBEDROP_YTDLP_BIN` so packaged
/// installs can pin a specific build.
pub struct YtDlp {
    binary: PathBuf,
    ffmpeg_dir: Option<PathBuf>,
}

impl YtDlp {
    pub fn new() -> Self {
        let binary = env::var("TUBEDROP_YTDLP_BIN")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("yt-dlp"));
        Self {
            binary,
            ffmpeg_dir: detect_ffmpeg_dir(),
        }
    }

    /// Runs `yt-dlp --version` to fail loudly at startup when the tool is
    /// missing, rather than on the first submitted job.
    pub fn ensure_available(&self) -> Result<()> {
        let status = Command::new(&self.binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .with_context(|| format!("running {} --version", self.binary.display()))?;
        if !status.success() {
            bail!("{} --version exited with {status}", self.binary.display());
        }
        Ok(())
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    fn apply_common_args(&self, command: &mut Command, url: &str, browser: Option<&str>) {
        command.arg("--no-warnings");
        command.arg("--user-agent").arg(DESKTOP_USER_AGENT);
        if is_youtube_url(url) {
            command.arg("--extractor-args").arg(YOUTUBE_EXTRACTOR_ARGS);
        }
        if let Some(browser) = browser.filter(|value| !value.is_empty() && *value != "none") {
            command.arg("--cookies-from-browser").arg(browser);
        }
        if let Some(dir) = &self.ffmpeg_dir {
            command.arg("--ffmpeg-location").arg(dir);
        }
    }
}

impl Default for YtDlp {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor for YtDlp {
    fn probe(&self, url: &str, browser: Option<&str>) -> Result<VideoProbe> {
        let mut command = self.command();
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-progress");
        self.apply_common_args(&mut command, url, browser);
        command.arg(url);

        let output = command
            .output()
            .with_context(|| format!("probing {url}"))?;
        if !output.status.success() {
            bail!(
                "yt-dlp probe failed for {url} (status {}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let info: RawInfo =
            serde_json::from_slice(&output.stdout).context("parsing yt-dlp metadata")?;
        Ok(build_probe(info))
    }

    fn fetch(
        &self,
        request: &FetchRequest,
        on_progress: &mut dyn FnMut(ProgressEvent),
    ) -> Result<PathBuf> {
        fs::create_dir_all(&request.output_dir).with_context(|| {
            format!("creating download dir {}", request.output_dir.display())
        })?;

        // The job id prefixes the artifact so it can be found afterwards and
        // so two jobs for the same title never collide.
        let template = request
            .output_dir
            .join(format!("{}_%(title)s.%(ext)s", request.job_id));

        let mut command = self.command();
        command
            .arg("--newline")
            .arg("--progress-template")
            .arg(PROGRESS_TEMPLATE)
            .arg("--output")
            .arg(&template)
            .arg("--format")
            .arg(request.format.selector());
        if request.format.is_audio() {
            command
                .arg("--extract-audio")
                .arg("--audio-format")
                .arg("mp3")
                .arg("--audio-quality")
                .arg("192K");
        }
        self.apply_common_args(&mut command, &request.url, request.browser.as_deref());
        command.arg(&request.url);

        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = command.spawn().context("launching yt-dlp")?;

        // Keep a bounded stderr tail on a side thread; stdout carries the
        // progress stream and is read here so callbacks stay in order.
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_handle = child.stderr.take().map(|stream| {
            let tail = stderr_tail.clone();
            thread::spawn(move || {
                for line in BufReader::new(stream).lines().map_while(|line| line.ok()) {
                    let mut tail = tail.lock();
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            })
        });

        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                let line = line.context("reading yt-dlp output")?;
                if let Some(event) = parse_progress_line(&line) {
                    on_progress(event);
                }
            }
        }

        let status = child.wait().context("waiting for yt-dlp")?;
        if let Some(handle) = stderr_handle {
            let _ = handle.join();
        }

        if !status.success() {
            let tail: Vec<String> = stderr_tail.lock().iter().cloned().collect();
            bail!("yt-dlp exited with {status}: {}", tail.join(" | "));
        }

        resolve_artifact(&request.output_dir, &request.job_id)
    }

    fn self_update(&self) -> Result<String> {
        let output = self
            .command()
            .arg("-U")
            .output()
            .context("launching yt-dlp self-update")?;
        if !output.status.success() {
            bail!(
                "yt-dlp -U exited with {} ({})",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }
}

/// Parses one `--progress-template` line. Anything that is not ours (merger
/// output, playlist banners) yields `None`.
fn parse_progress_line(line: &str) -> Option<ProgressEvent> {
    let rest = line.trim().strip_prefix(PROGRESS_PREFIX)?;
    let mut fields = rest.split_whitespace();
    match fields.next()? {
        "finished" => Some(ProgressEvent::Finished),
        "downloading" => {
            let downloaded_bytes = parse_count(fields.next()?).unwrap_or(0);
            let total = parse_count(fields.next()?);
            let estimate = parse_count(fields.next()?);
            let speed = parse_rate(fields.next()?);
            let eta = parse_count(fields.next()?);
            Some(ProgressEvent::Downloading {
                downloaded_bytes,
                total_bytes: total.or(estimate),
                speed,
                eta,
            })
        }
        _ => None,
    }
}

/// yt-dlp prints `NA` for unknown fields and occasionally formats integers as
/// floats, so parse both.
fn parse_count(field: &str) -> Option<u64> {
    if field == "NA" {
        return None;
    }
    field
        .parse::<u64>()
        .ok()
        .or_else(|| field.parse::<f64>().ok().map(|value| value.max(0.0) as u64))
}

fn parse_rate(field: &str) -> Option<f64> {
    if field == "NA" {
        return None;
    }
    field.parse::<f64>().ok()
}

/// Finds the artifact a finished run produced, by its unique job-id prefix.
/// The newest match wins because audio extraction replaces the container file
/// after the download itself finished.
fn resolve_artifact(dir: &Path, job_id: &str) -> Result<PathBuf> {
    let prefix = format!("{job_id}_");
    let mut best: Option<(SystemTime, PathBuf)> = None;
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(&prefix) || is_intermediate_file(&name) {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified().unwrap_or(UNIX_EPOCH);
        if best.as_ref().is_none_or(|(stamp, _)| modified >= *stamp) {
            best = Some((modified, entry.path()));
        }
    }
    best.map(|(_, path)| path)
        .ok_or_else(|| anyhow!("no output file produced for job {job_id}"))
}

fn is_intermediate_file(name: &str) -> bool {
    name.ends_with(".part") || name.ends_with(".ytdl") || name.ends_with(".temp")
}

fn is_youtube_url(url: &str) -> bool {
    url.contains("youtube.com") || url.contains("youtu.be")
}

/// Locates ffmpeg by scanning PATH, then the usual install spots. `None`
/// leaves the lookup to yt-dlp itself.
fn detect_ffmpeg_dir() -> Option<PathBuf> {
    if let Some(path_var) = env::var_os("PATH") {
        for dir in env::split_paths(&path_var) {
            if dir.join("ffmpeg").is_file() {
                return Some(dir);
            }
        }
    }
    for candidate in [
        "/opt/homebrew/bin/ffmpeg",
        "/usr/local/bin/ffmpeg",
        "/usr/bin/ffmpeg",
    ] {
        let candidate = Path::new(candidate);
        if candidate.is_file() {
            return candidate.parent().map(Path::to_path_buf);
        }
    }
    None
}

#[derive(Deserialize)]
struct RawInfo {
    title: Option<String>,
    thumbnail: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    view_count: Option<u64>,
    description: Option<String>,
    #[serde(default)]
    formats: Vec<RawFormat>,
}

#[derive(Deserialize)]
struct RawFormat {
    format_id: Option<String>,
    ext: Option<String>,
    resolution: Option<String>,
    filesize: Option<u64>,
    filesize_approx: Option<u64>,
    vcodec: Option<String>,
    acodec: Option<String>,
    fps: Option<f64>,
    tbr: Option<f64>,
}

fn build_probe(info: RawInfo) -> VideoProbe {
    let formats = info
        .formats
        .into_iter()
        .filter_map(build_format_summary)
        .collect();

    let description = info
        .description
        .map(|text| text.chars().take(500).collect())
        .unwrap_or_default();

    VideoProbe {
        title: info.title.unwrap_or_else(|| "Unknown".to_owned()),
        thumbnail: info.thumbnail.unwrap_or_default(),
        duration: info.duration.map(|value| value.max(0.0) as u64).unwrap_or(0),
        uploader: info.uploader.unwrap_or_else(|| "Unknown".to_owned()),
        view_count: info.view_count.unwrap_or(0),
        description,
        formats,
    }
}

/// Keeps formats that carry video, plus standalone audio tracks; everything
/// else (storyboards, manifests) is noise to a user picking a quality.
fn build_format_summary(raw: RawFormat) -> Option<FormatSummary> {
    let vcodec = raw.vcodec.unwrap_or_else(|| "none".to_owned());
    let acodec = raw.acodec.unwrap_or_else(|| "none".to_owned());
    let has_video = vcodec != "none";
    let audio_only = !has_video && acodec != "none";
    if !has_video && !audio_only {
        return None;
    }
    Some(FormatSummary {
        format_id: raw.format_id.unwrap_or_default(),
        ext: raw.ext.unwrap_or_default(),
        resolution: raw
            .resolution
            .unwrap_or_else(|| "audio only".to_owned()),
        filesize: raw.filesize.or(raw.filesize_approx),
        vcodec,
        acodec,
        fps: raw.fps,
        tbr: raw.tbr,
    })
}
