#![forbid(unsafe_code)]

//! Axum server exposing yt-dlp over HTTP.
//!
//! Metadata routes run yt-dlp on the blocking pool and answer within the same
//! request. Downloads become background jobs tracked in memory and polled
//! through `/api/status/{task_id}`. Nothing is persisted: a restart forgets
//! every job.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, Query, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use clap::Parser;
use mime_guess::{MimeGuess, mime::Mime};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal,
};
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use url::{Url, form_urlencoded};
use ytdlp_api::config::{RuntimeOverrides, RuntimeSettings, resolve_runtime_settings};
use ytdlp_api::credentials::{CredentialBundle, CredentialFields, default_bundle};
use ytdlp_api::dispatcher::{SubmitOptions, TaskDispatcher};
use ytdlp_api::provider::{ExtractOptions, ExtractionProvider, MediaMetadata};
use ytdlp_api::registry::{Job, JobKind, JobStatus, RegistryError, TaskRegistry};
use ytdlp_api::rendition::{self, Rendition};
use ytdlp_api::security::ensure_not_root;
use ytdlp_api::ytdlp::YtDlp;

const SERVICE_NAME: &str = "yt-dlp-api";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_LOG_FILTER: &str = "ytdlp_api=info,tower_http=info";

const DESCRIPTION_PREVIEW_CHARS: usize = 200;
const INFO_FORMAT_LIMIT: usize = 5;

// Upstream headers a player needs to seek within a proxied rendition.
const RELAYED_HEADERS: [HeaderName; 4] = [
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::CONTENT_RANGE,
    header::ACCEPT_RANGES,
];

#[derive(Debug, Parser)]
#[command(name = "ytdlp_api", version, about = "HTTP API in front of yt-dlp")]
struct Cli {
    /// Address to bind, overrides YTDLP_API_HOST.
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on, overrides PORT.
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    download_dir: Option<PathBuf>,
    #[arg(long)]
    ytdlp_bin: Option<PathBuf>,
    /// 0 removes the limit.
    #[arg(long)]
    max_concurrent_jobs: Option<usize>,
    /// Alternate dotenv file.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl From<Cli> for RuntimeOverrides {
    fn from(cli: Cli) -> Self {
        Self {
            host: cli.host,
            port: cli.port,
            download_dir: cli.download_dir,
            ytdlp_bin: cli.ytdlp_bin,
            max_concurrent_jobs: cli.max_concurrent_jobs,
            env_path: cli.env_file,
        }
    }
}

#[derive(Clone)]
struct AppState {
    provider: Arc<dyn ExtractionProvider>,
    dispatcher: TaskDispatcher,
    default_credentials: Option<CredentialBundle>,
    cookies_dir: Option<Arc<PathBuf>>,
    public_base_url: Option<Arc<str>>,
    download_dir: Arc<PathBuf>,
    http: reqwest::Client,
}

impl AppState {
    fn new(settings: &RuntimeSettings, provider: Arc<dyn ExtractionProvider>) -> Result<Self> {
        let dispatcher = TaskDispatcher::new(
            TaskRegistry::new(),
            provider.clone(),
            settings.download_dir.clone(),
            settings.max_concurrent_jobs,
        );
        let http = reqwest::Client::builder()
            .build()
            .context("building upstream HTTP client")?;
        Ok(Self {
            provider,
            dispatcher,
            default_credentials: default_bundle(settings.default_cookies_file.clone()),
            cookies_dir: settings.cookies_dir.clone().map(Arc::new),
            public_base_url: settings.public_base_url.as_deref().map(Arc::from),
            download_dir: Arc::new(settings.download_dir.clone()),
            http,
        })
    }

    fn registry(&self) -> &TaskRegistry {
        self.dispatcher.registry()
    }

    /// Request credentials win; the operator's cookie file fills the gap.
    fn credentials_for(&self, fields: &CredentialFields) -> Option<CredentialBundle> {
        fields
            .resolve(self.cookies_dir.as_deref().map(PathBuf::as_path))
            .or_else(|| self.default_credentials.clone())
    }

    async fn extract(
        &self,
        url: String,
        credentials: Option<CredentialBundle>,
    ) -> ApiResult<MediaMetadata> {
        let provider = self.provider.clone();
        let options = ExtractOptions {
            format: None,
            credentials,
        };
        tokio::task::spawn_blocking(move || provider.extract(&url, &options))
            .await
            .map_err(|err| ApiError::Internal(format!("extraction worker crashed: {err}")))?
            .map_err(|err| ApiError::Provider(err.to_string()))
    }

    /// Origin prepended to proxied stream links.
    fn public_origin(&self, headers: &HeaderMap) -> String {
        if let Some(base) = &self.public_base_url {
            return base.to_string();
        }
        headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(|host| format!("http://{host}"))
            .unwrap_or_default()
    }
}

#[derive(Debug, Error)]
enum ApiError {
    #[error("{0}")]
    MissingParameter(String),
    #[error("{0}")]
    NotFound(String),
    /// yt-dlp's own message, passed through verbatim.
    #[error("{0}")]
    Provider(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::MissingParameter(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Provider(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(_) => Self::NotFound(err.to_string()),
            RegistryError::DuplicateId(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::MissingParameter(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let settings = resolve_runtime_settings(Cli::parse().into())?;
    ensure_not_root("ytdlp_api", settings.allow_root)?;

    tokio::fs::create_dir_all(&settings.download_dir)
        .await
        .with_context(|| format!("creating {}", settings.download_dir.display()))?;

    let provider: Arc<dyn ExtractionProvider> = Arc::new(YtDlp::new(settings.ytdlp_bin.clone()));
    let state = AppState::new(&settings, provider)?;
    if settings.default_cookies_file.is_some() && state.default_credentials.is_none() {
        warn!("DEFAULT_COOKIES_FILE is set but unusable; requests run without default cookies");
    }

    let host = settings
        .host
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/YTDLP_API_HOST")?;
    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(
        %addr,
        download_dir = %settings.download_dir.display(),
        ytdlp = %settings.ytdlp_bin.display(),
        max_concurrent_jobs = settings.max_concurrent_jobs,
        "yt-dlp API listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT").is_ok_and(|value| value.eq_ignore_ascii_case("json"));
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(true))
            .with(env_filter)
            .init();
    }
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still ends the process.
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/info", get(media_info))
        .route("/api/formats", get(list_formats))
        .route("/api/download", post(start_download))
        .route("/api/audio", post(start_audio_download))
        .route("/api/status/{task_id}", get(task_status))
        .route("/api/tasks", get(list_tasks))
        .route(
            "/api/stream-links",
            get(stream_links_query).post(stream_links_body),
        )
        .route(
            "/api/playable-links",
            get(stream_links_query).post(stream_links_body),
        )
        .route("/api/proxy-stream", get(proxy_stream))
        .route("/api/files/{task_id}", get(download_file))
        .fallback(endpoint_not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct SourceRequest {
    url: Option<String>,
    #[serde(flatten)]
    credentials: CredentialFields,
}

#[derive(Debug, Default, Deserialize)]
struct DownloadRequest {
    url: Option<String>,
    #[serde(default)]
    options: DownloadOptions,
    #[serde(flatten)]
    credentials: CredentialFields,
}

#[derive(Debug, Default, Deserialize)]
struct DownloadOptions {
    format: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ProxyQuery {
    url: Option<String>,
    format_id: Option<String>,
    #[serde(flatten)]
    credentials: CredentialFields,
}

#[derive(Debug, Serialize)]
struct InfoResponse {
    title: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    upload_date: Option<String>,
    view_count: Option<u64>,
    description: Option<String>,
    formats: Vec<FormatPreview>,
}

#[derive(Debug, Serialize)]
struct FormatPreview {
    format_id: String,
    ext: Option<String>,
    format_note: Option<String>,
    filesize: Option<u64>,
    url: Option<String>,
}

#[derive(Debug, Serialize)]
struct FormatsResponse {
    title: Option<String>,
    formats: Vec<FormatSummary>,
}

#[derive(Debug, Serialize)]
struct FormatSummary {
    format_id: String,
    ext: Option<String>,
    resolution: Option<String>,
    fps: Option<f64>,
    filesize: Option<u64>,
    tbr: Option<f64>,
    vcodec: Option<String>,
    acodec: Option<String>,
    format_note: Option<String>,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    task_id: String,
    status: &'static str,
    message: &'static str,
}

#[derive(Debug, Serialize)]
struct TaskList {
    tasks: Vec<Job>,
    total: usize,
}

#[derive(Debug, Serialize)]
struct StreamLinks {
    title: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    thumbnail: Option<String>,
    audio_stream: Option<AudioStream>,
    video_stream: Option<VideoStream>,
}

#[derive(Debug, Serialize)]
struct AudioStream {
    url: Option<String>,
    proxy_url: String,
    format_id: String,
    ext: Option<String>,
    abr: Option<f64>,
    acodec: Option<String>,
    filesize: Option<u64>,
}

#[derive(Debug, Serialize)]
struct VideoStream {
    url: Option<String>,
    proxy_url: String,
    format_id: String,
    ext: Option<String>,
    resolution: Option<String>,
    height: Option<u32>,
    width: Option<u32>,
    vcodec: Option<String>,
    acodec: Option<String>,
    fps: Option<f64>,
    filesize: Option<u64>,
}

impl From<MediaMetadata> for InfoResponse {
    fn from(metadata: MediaMetadata) -> Self {
        let formats = metadata
            .renditions
            .into_iter()
            .take(INFO_FORMAT_LIMIT)
            .map(|rendition| FormatPreview {
                format_id: rendition.format_id,
                ext: rendition.ext,
                format_note: rendition.format_note,
                filesize: rendition.filesize,
                url: rendition.url,
            })
            .collect();
        Self {
            title: metadata.title,
            duration: metadata.duration,
            uploader: metadata.uploader,
            upload_date: metadata.upload_date,
            view_count: metadata.view_count,
            description: metadata.description.as_deref().and_then(preview_description),
            formats,
        }
    }
}

impl From<&Rendition> for FormatSummary {
    fn from(rendition: &Rendition) -> Self {
        Self {
            format_id: rendition.format_id.clone(),
            ext: rendition.ext.clone(),
            resolution: rendition.resolution.clone(),
            fps: rendition.fps,
            filesize: rendition.filesize,
            tbr: rendition.tbr,
            vcodec: rendition.vcodec.clone(),
            acodec: rendition.acodec.clone(),
            format_note: rendition.format_note.clone(),
        }
    }
}

impl AudioStream {
    fn new(rendition: &Rendition, proxy_url: String) -> Self {
        Self {
            url: rendition.url.clone(),
            proxy_url,
            format_id: rendition.format_id.clone(),
            ext: rendition.ext.clone(),
            abr: rendition.abr,
            acodec: rendition.acodec.clone(),
            filesize: rendition.filesize,
        }
    }
}

impl VideoStream {
    fn new(rendition: &Rendition, proxy_url: String) -> Self {
        Self {
            url: rendition.url.clone(),
            proxy_url,
            format_id: rendition.format_id.clone(),
            ext: rendition.ext.clone(),
            resolution: rendition.resolution.clone(),
            height: rendition.height,
            width: rendition.width,
            vcodec: rendition.vcodec.clone(),
            acodec: rendition.acodec.clone(),
            fps: rendition.fps,
            filesize: rendition.filesize,
        }
    }
}

/// First 200 characters followed by an ellipsis. Empty descriptions are
/// dropped.
fn preview_description(description: &str) -> Option<String> {
    if description.is_empty() {
        return None;
    }
    let mut preview: String = description.chars().take(DESCRIPTION_PREVIEW_CHARS).collect();
    preview.push_str("...");
    Some(preview)
}

fn required_url(url: Option<String>) -> ApiResult<String> {
    url.map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::MissingParameter("missing url parameter".into()))
}

fn proxy_url(origin: &str, source_url: &str, format_id: &str) -> String {
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("url", source_url)
        .append_pair("format_id", format_id)
        .finish();
    format!("{origin}/api/proxy-stream?{query}")
}

async fn index() -> Json<Value> {
    Json(json!({
        "name": "yt-dlp HTTP API",
        "version": SERVICE_VERSION,
        "description": "Query and download media through yt-dlp over HTTP",
        "endpoints": {
            "GET /health": "liveness check",
            "GET /api/info?url=<video_url>": "metadata preview without downloading",
            "GET /api/formats?url=<video_url>": "every available format",
            "POST /api/download": "start a download {\"url\": \"<video_url>\", \"options\": {\"format\": \"...\"}}",
            "POST /api/audio": "start an mp3 download {\"url\": \"<video_url>\"}",
            "GET /api/status/<task_id>": "state of one download",
            "GET /api/tasks": "every download since startup",
            "GET|POST /api/stream-links?url=<video_url>": "best audio and video stream links",
            "GET|POST /api/playable-links?url=<video_url>": "alias of /api/stream-links",
            "GET /api/proxy-stream?url=<video_url>&format_id=<id>": "relay one format through this server",
            "GET /api/files/<task_id>": "fetch the file of a completed download"
        },
        "credentials": "requests may carry one of cookies_from_browser, cookies_text or cookies_file (a name inside COOKIES_DIR)",
        "examples": {
            "get_info": "curl \"http://localhost:5000/api/info?url=https://www.youtube.com/watch?v=dQw4w9WgXcQ\"",
            "download": "curl -X POST -H \"Content-Type: application/json\" -d '{\"url\": \"https://www.youtube.com/watch?v=dQw4w9WgXcQ\", \"options\": {\"format\": \"best[height<=720]\"}}' \"http://localhost:5000/api/download\"",
            "check_status": "curl \"http://localhost:5000/api/status/<task_id>\"",
            "get_stream_links": "curl \"http://localhost:5000/api/stream-links?url=https://www.youtube.com/watch?v=dQw4w9WgXcQ\""
        }
    }))
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
    }))
}

async fn endpoint_not_found() -> ApiError {
    ApiError::NotFound("endpoint not found".into())
}

async fn media_info(
    State(state): State<AppState>,
    Query(request): Query<SourceRequest>,
) -> ApiResult<Json<InfoResponse>> {
    let url = required_url(request.url)?;
    let credentials = state.credentials_for(&request.credentials);
    let metadata = state.extract(url, credentials).await?;
    Ok(Json(InfoResponse::from(metadata)))
}

async fn list_formats(
    State(state): State<AppState>,
    Query(request): Query<SourceRequest>,
) -> ApiResult<Json<FormatsResponse>> {
    let url = required_url(request.url)?;
    let credentials = state.credentials_for(&request.credentials);
    let metadata = state.extract(url, credentials).await?;
    Ok(Json(FormatsResponse {
        formats: metadata.renditions.iter().map(FormatSummary::from).collect(),
        title: metadata.title,
    }))
}

async fn start_download(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> ApiResult<Json<SubmitResponse>> {
    let Json(request) = payload?;
    submit_job(&state, request, JobKind::Video)
}

async fn start_audio_download(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> ApiResult<Json<SubmitResponse>> {
    let Json(request) = payload?;
    submit_job(&state, request, JobKind::AudioOnly)
}

fn submit_job(
    state: &AppState,
    request: DownloadRequest,
    kind: JobKind,
) -> ApiResult<Json<SubmitResponse>> {
    let url = required_url(request.url)?;
    let credentials = state.credentials_for(&request.credentials);
    let (format, message) = match kind {
        JobKind::Video => (request.options.format, "download task created"),
        JobKind::AudioOnly => (None, "audio download task created"),
    };
    let task_id = state
        .dispatcher
        .submit(url, SubmitOptions { format, kind }, credentials)?;
    Ok(Json(SubmitResponse {
        task_id,
        status: JobStatus::Pending.as_str(),
        message,
    }))
}

async fn task_status(
    State(state): State<AppState>,
    AxumPath(task_id): AxumPath<String>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.registry().get(&task_id)?))
}

async fn list_tasks(State(state): State<AppState>) -> Json<TaskList> {
    let tasks = state.registry().list_all();
    Json(TaskList {
        total: tasks.len(),
        tasks,
    })
}

async fn stream_links_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(request): Query<SourceRequest>,
) -> ApiResult<Json<StreamLinks>> {
    stream_links(&state, &headers, request).await
}

async fn stream_links_body(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<SourceRequest>, JsonRejection>,
) -> ApiResult<Json<StreamLinks>> {
    let Json(request) = payload?;
    stream_links(&state, &headers, request).await
}

async fn stream_links(
    state: &AppState,
    headers: &HeaderMap,
    request: SourceRequest,
) -> ApiResult<Json<StreamLinks>> {
    let url = required_url(request.url)?;
    let credentials = state.credentials_for(&request.credentials);
    let metadata = state.extract(url.clone(), credentials).await?;

    let origin = state.public_origin(headers);
    let selection = rendition::select(&metadata.renditions);
    let audio_stream = selection.audio.map(|audio| {
        AudioStream::new(audio, proxy_url(&origin, &url, &audio.format_id))
    });
    let video_stream = selection.video.map(|video| {
        VideoStream::new(video, proxy_url(&origin, &url, &video.format_id))
    });

    Ok(Json(StreamLinks {
        title: metadata.title.clone(),
        duration: metadata.duration,
        uploader: metadata.uploader.clone(),
        thumbnail: metadata.thumbnail.clone(),
        audio_stream,
        video_stream,
    }))
}

/// Re-resolves the source and relays the bytes of one rendition, forwarding
/// the caller's `Range` header so players can seek.
async fn proxy_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ProxyQuery>,
) -> ApiResult<Response> {
    let url = required_url(query.url)?;
    let format_id = query
        .format_id
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::MissingParameter("missing format_id parameter".into()))?;
    let credentials = state.credentials_for(&query.credentials);
    let metadata = state.extract(url, credentials).await?;
    let rendition = metadata
        .renditions
        .iter()
        .find(|rendition| rendition.format_id == format_id)
        .ok_or_else(|| ApiError::NotFound(format!("format {format_id} not found")))?;
    relay_rendition(&state.http, rendition, headers.get(header::RANGE)).await
}

async fn relay_rendition(
    client: &reqwest::Client,
    rendition: &Rendition,
    range: Option<&HeaderValue>,
) -> ApiResult<Response> {
    let direct = rendition.url.as_deref().ok_or_else(|| {
        ApiError::Upstream(format!("format {} has no direct URL", rendition.format_id))
    })?;
    let target = Url::parse(direct)
        .map_err(|err| ApiError::Upstream(format!("invalid upstream URL: {err}")))?;
    if !matches!(target.scheme(), "http" | "https") {
        return Err(ApiError::Upstream(format!(
            "unsupported upstream scheme {}",
            target.scheme()
        )));
    }

    let mut request = client.get(target);
    for (name, value) in &rendition.http_headers {
        request = request.header(name, value);
    }
    if let Some(range) = range {
        request = request.header(header::RANGE, range.clone());
    }
    let upstream = request
        .send()
        .await
        .map_err(|err| ApiError::Upstream(format!("upstream request failed: {err}")))?;

    let status = upstream.status();
    let relayable = status.is_success()
        || status.is_redirection()
        || status == StatusCode::RANGE_NOT_SATISFIABLE;
    if !relayable {
        return Err(ApiError::Upstream(format!("upstream responded with {status}")));
    }

    let mut response = Response::builder().status(status);
    for name in RELAYED_HEADERS {
        if let Some(value) = upstream.headers().get(&name) {
            response = response.header(name, value.clone());
        }
    }
    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|err| ApiError::Internal(err.to_string()))
}

async fn download_file(
    State(state): State<AppState>,
    AxumPath(task_id): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let job = state.registry().get(&task_id)?;
    let location = match (job.status, job.filename) {
        (JobStatus::Completed, Some(location)) => location,
        _ => {
            return Err(ApiError::NotFound(format!(
                "task {task_id} has no completed file"
            )));
        }
    };
    let path = resolve_result_path(&state.download_dir, &location).await?;
    stream_file(path, None, Some(&headers)).await
}

/// Only files that still live under the download directory are served.
async fn resolve_result_path(root: &Path, location: &Path) -> ApiResult<PathBuf> {
    let root = tokio::fs::canonicalize(root)
        .await
        .map_err(|_| ApiError::NotFound("download directory missing".into()))?;
    let resolved = tokio::fs::canonicalize(location)
        .await
        .map_err(|_| ApiError::NotFound("file not found".into()))?;
    if !resolved.starts_with(&root) {
        return Err(ApiError::NotFound("file not found".into()));
    }
    Ok(resolved)
}

async fn stream_file(
    path: PathBuf,
    mime: Option<Mime>,
    headers: Option<&HeaderMap>,
) -> ApiResult<Response> {
    let gone = |_| ApiError::NotFound("file not found".into());
    let mut file = File::open(&path).await.map_err(gone)?;
    let size = file.metadata().await.map_err(gone)?.len();

    let requested = headers
        .and_then(|headers| headers.get(header::RANGE))
        .and_then(|value| parse_range_header(value, size));
    let mut response = match requested {
        None => {
            let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
            response
        }
        Some((start, _)) if start >= size => {
            let mut response = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_RANGE, header_value(format!("bytes */{size}"))?);
            return Ok(response);
        }
        Some((start, end)) => {
            let end = end.min(size - 1);
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start)).await.map_err(gone)?;
            let mut response = (
                StatusCode::PARTIAL_CONTENT,
                Body::from_stream(ReaderStream::new(file.take(length))),
            )
                .into_response();
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_RANGE,
                header_value(format!("bytes {start}-{end}/{size}"))?,
            );
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
    };

    let headers = response.headers_mut();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(value) = mime
        .or_else(|| MimeGuess::from_path(&path).first())
        .and_then(|mime| HeaderValue::from_str(mime.as_ref()).ok())
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}

fn header_value(value: String) -> ApiResult<HeaderValue> {
    HeaderValue::try_from(value).map_err(|err| ApiError::Internal(err.to_string()))
}

/// Single `bytes=` range resolved against `size` as an inclusive pair.
/// Multi-range and non-byte units yield `None`, which serves the whole file.
fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let ranges = value.to_str().ok()?.trim().strip_prefix("bytes")?;
    let ranges = ranges.trim_start().strip_prefix('=')?.trim();
    if ranges.contains(',') {
        return None;
    }
    let last = size.saturating_sub(1);
    match ranges.split_once('-')? {
        ("", "") => None,
        ("", suffix) => match suffix.parse::<u64>().ok()? {
            0 => None,
            len => Some((size.saturating_sub(len), last)),
        },
        (start, end) => {
            let start = start.parse::<u64>().ok()?;
            let end = match end {
                "" => last,
                end => end.parse::<u64>().ok()?,
            };
            (start <= end).then_some((start, end))
        }
    }
}
