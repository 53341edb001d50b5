#![forbid(unsafe_code)]

//! Axum front end for the tubedrop download service.
//!
//! Routes translate HTTP requests into `DownloadService` calls and its results
//! back into status codes. Everything stateful lives in the service; handlers
//! stay small on purpose.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, Path as AxumPath, State},
    http::{HeaderMap, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio::{fs::File, signal};
use tokio_util::io::ReaderStream;
use tubedrop::config::{AuthConfig, RuntimeConfig, RuntimeOverrides, resolve_runtime_config};
use tubedrop::error::SubmitError;
use tubedrop::extractor::{VideoProbe, YtDlp};
use tubedrop::jobs::JobState;
use tubedrop::security::{credentials_match, ensure_not_root, parse_basic_auth};
use tubedrop::service::{Artifact, DownloadService, ServiceLimits};

struct ServerArgs;

impl ServerArgs {
    fn parse() -> Result<RuntimeConfig> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<RuntimeConfig>
    where
        I: IntoIterator<Item = String>,
    {
        let mut overrides = RuntimeOverrides::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--download-root=") {
                overrides.download_root = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--www-root=") {
                overrides.www_root = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                overrides.port = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                overrides.host = Some(parse_host_arg(value)?.to_string());
                continue;
            }

            match arg.as_str() {
                "--download-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--download-root requires a value"))?;
                    overrides.download_root = Some(PathBuf::from(value));
                }
                "--www-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--www-root requires a value"))?;
                    overrides.www_root = Some(PathBuf::from(value));
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    overrides.port = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    overrides.host = Some(parse_host_arg(&value)?.to_string());
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        resolve_runtime_config(overrides)
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/TUBEDROP_HOST")
}

/// Shared state injected into every handler.
#[derive(Clone)]
struct AppState {
    service: DownloadService,
    auth: Arc<AuthConfig>,
    www_root: Arc<PathBuf>,
    download_root: Arc<PathBuf>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    retry_after_seconds: Option<u64>,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            retry_after_seconds: None,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            retry_after_seconds: None,
        }
    }

    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "authentication required".into(),
            retry_after_seconds: None,
        }
    }

    fn too_many_requests(message: impl Into<String>, retry_after_seconds: Option<u64>) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: message.into(),
            retry_after_seconds,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        if self.status == StatusCode::UNAUTHORIZED {
            headers.insert(
                header::WWW_AUTHENTICATE,
                "Basic realm=\"tubedrop\"".parse().unwrap(),
            );
        }
        if let Some(seconds) = self.retry_after_seconds
            && let Ok(value) = seconds.to_string().parse()
        {
            headers.insert(header::RETRY_AFTER, value);
        }
        let mut body = serde_json::json!({
            "error": self.message,
        });
        if let Some(seconds) = self.retry_after_seconds {
            body["retryAfterSeconds"] = seconds.into();
        }
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InfoRequest {
    url: String,
    browser: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadRequest {
    url: String,
    format: Option<String>,
    browser: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadResponse {
    download_id: String,
    rate_limit_remaining: usize,
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FilesResponse {
    files: Vec<Artifact>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateResponse {
    accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerArgs::parse()?;

    ensure_not_root("server")?;

    std::fs::create_dir_all(&config.download_root).with_context(|| {
        format!("creating download root {}", config.download_root.display())
    })?;

    let extractor = YtDlp::new();
    extractor
        .ensure_available()
        .context("yt-dlp is required; install it and make sure it is on the PATH")?;

    let limits = ServiceLimits {
        rate_limit: config.limits.rate_limit,
        rate_window: config.limits.rate_window,
        job_retention: config.limits.job_retention,
        update_cooldown: config.limits.update_cooldown,
    };
    let service = DownloadService::new(config.download_root.clone(), Arc::new(extractor), limits);

    let state = AppState {
        service,
        auth: Arc::new(config.auth.clone()),
        www_root: Arc::new(config.www_root.clone()),
        download_root: Arc::new(config.download_root.clone()),
    };

    let app = Router::new()
        .route("/api/info", post(video_info))
        .route("/api/download", post(start_download))
        .route("/api/progress/{id}", get(download_progress))
        .route("/api/files", get(list_files))
        .route("/api/files/{filename}", get(download_artifact))
        .route("/api/update", post(request_update))
        .fallback(static_fallback)
        .with_state(state);

    let host = parse_host_arg(&config.host)?;
    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;

    println!("==================================================");
    println!("  tubedrop video download server");
    println!("==================================================");
    println!("Local:   http://localhost:{}", config.port);
    println!("Network: http://{}:{}", get_local_ip(), config.port);
    println!("Downloads: {}", config.download_root.display());
    if config.auth.required {
        println!("Authentication: enabled");
    }
    println!("Press Ctrl+C to stop");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("running server")?;

    Ok(())
}

async fn shutdown_signal() {
    // We do not propagate this error up because it only affects graceful
    // shutdown; the process still terminates when Ctrl+C fires.
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Failed to install Ctrl+C handler: {}", err);
    }
}

/// Discovers the LAN-reachable address for the startup banner. The socket is
/// never actually used to send anything.
fn get_local_ip() -> IpAddr {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn require_auth(auth: &AuthConfig, headers: &HeaderMap) -> ApiResult<()> {
    if !auth.required {
        return Ok(());
    }
    let supplied = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_basic_auth);
    match supplied {
        Some(credentials) if credentials_match(auth, &credentials) => Ok(()),
        _ => Err(ApiError::unauthorized()),
    }
}

async fn video_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<InfoRequest>,
) -> ApiResult<Json<VideoProbe>> {
    require_auth(&state.auth, &headers)?;
    if payload.url.trim().is_empty() {
        return Err(ApiError::bad_request("please enter a video URL"));
    }
    match state
        .service
        .probe(&payload.url, payload.browser.as_deref())
        .await
    {
        Ok(probe) => Ok(Json(probe)),
        Err(err) => {
            // Full detail stays server side; the client only learns that the
            // probe failed.
            eprintln!("Probe failed: {err:#}");
            Err(ApiError::bad_request("could not fetch video info"))
        }
    }
}

async fn start_download(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<DownloadRequest>,
) -> ApiResult<Json<DownloadResponse>> {
    require_auth(&state.auth, &headers)?;
    let client_key = addr.ip().to_string();
    let format = payload.format.as_deref().unwrap_or("best");
    match state.service.submit(
        &payload.url,
        format,
        payload.browser.as_deref(),
        &client_key,
    ) {
        Ok(submitted) => Ok(Json(DownloadResponse {
            download_id: submitted.job_id,
            rate_limit_remaining: submitted.rate_limit_remaining,
            message: "Download started".into(),
        })),
        Err(err @ SubmitError::MissingUrl) => Err(ApiError::bad_request(err.to_string())),
        Err(err @ SubmitError::RateLimited(_)) => {
            let retry = err.retry_after_seconds();
            Err(ApiError::too_many_requests(err.to_string(), retry))
        }
    }
}

async fn download_progress(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<JobState>> {
    require_auth(&state.auth, &headers)?;
    state
        .service
        .status(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("download not found"))
}

async fn list_files(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<FilesResponse>> {
    require_auth(&state.auth, &headers)?;
    let files = state.service.list_artifacts().map_err(|err| {
        eprintln!("Listing downloads failed: {err:#}");
        ApiError::not_found("downloads unavailable")
    })?;
    Ok(Json(FilesResponse { files }))
}

async fn download_artifact(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(filename): AxumPath<String>,
) -> ApiResult<Response> {
    require_auth(&state.auth, &headers)?;
    ensure_safe_path_segment(&filename)?;
    let path = state.download_root.join(&filename);
    stream_file(path, Some(&filename)).await
}

async fn request_update(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<UpdateResponse>> {
    require_auth(&state.auth, &headers)?;
    let decision = state.service.request_tool_update();
    Ok(Json(UpdateResponse {
        accepted: decision.accepted,
        retry_after_seconds: decision
            .retry_after
            .map(|remaining| remaining.as_secs().max(1)),
    }))
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }

    match serve_www_path(&state.www_root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => stream_file(root.join("index.html"), None).await,
        Ok(_) => stream_file(target, None).await,
        Err(_) => Err(ApiError::not_found("file not found")),
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

/// Validates that a single dynamic path segment never escapes its base folder.
fn ensure_safe_path_segment(value: &str) -> ApiResult<()> {
    if value.is_empty()
        || Path::new(value)
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }

    Ok(())
}

/// Streams a file to the client. With `attachment_name` set the response asks
/// the browser to save rather than render, which is how artifacts are served.
async fn stream_file(path: PathBuf, attachment_name: Option<&str>) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("file not found"));
    }

    let mime = MimeGuess::from_path(&path).first();
    let size = metadata.len();

    let stream = ReaderStream::new(file);
    let mut response = Body::from_stream(stream).into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, size.to_string().parse().unwrap());
    if let Some(mime) = mime
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    if let Some(name) = attachment_name {
        let safe_name = name.replace(['"', '\\'], "_");
        if let Ok(value) = format!("attachment; filename=\"{safe_name}\"").parse() {
            response
                .headers_mut()
                .insert(header::CONTENT_DISPOSITION, value);
        }
    }

    Ok(response)
}
