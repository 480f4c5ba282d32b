#![forbid(unsafe_code)]

//! HTTP API server: search, info, download and cleanup, all backed by
//! yt-dlp invocations plus a flat directory of cached `.mp3` files.
//!
//! Every endpoint accepts its parameters from the query string, an
//! urlencoded form body, or a JSON body, in that order. Responses are
//! pretty-printed JSON envelopes carrying a `success` flag; cached files are
//! additionally served as downloadable attachments under `/downloads/`.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Path as AxumPath, RawQuery, Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mime_guess::MimeGuess;
use serde_json::{Value, json};
use songfetch::config::{RuntimeOverrides, resolve_runtime_settings};
use songfetch::security::ensure_not_root;
use songfetch::store::DownloadStore;
use songfetch::ytdlp::{FetchError, YtDlp};
use tokio::{fs::File, signal};
use tokio_util::io::ReaderStream;

/// Host used for absolute download URLs when the client sends no Host
/// header.
const DEFAULT_PUBLIC_HOST: &str = "localhost:5000";

const DEFAULT_SEARCH_LIMIT: i64 = 10;
const MAX_SEARCH_LIMIT: i64 = 20;
const DEFAULT_CLEAN_HOURS: u64 = 24;

#[derive(Clone)]
struct AppState {
    ytdlp: Arc<YtDlp>,
    store: Arc<DownloadStore>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    detail: Option<String>,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            detail: None,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            detail: None,
        }
    }

    fn method_not_allowed(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::METHOD_NOT_ALLOWED,
            message: message.into(),
            detail: None,
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            detail: None,
        }
    }
}

impl From<FetchError> for ApiError {
    /// Every handled operation failure maps to a 400 envelope; the captured
    /// tool output rides along in `details` when there is any.
    fn from(err: FetchError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: err.to_string(),
            detail: err.details().map(str::to_string),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut payload = json!({
            "success": false,
            "error": self.message,
        });
        if let Some(detail) = self.detail {
            payload["details"] = Value::String(detail);
        }
        json_response(self.status, &payload)
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Pretty-printed JSON response; serde_json leaves unicode and forward
/// slashes unescaped, which is exactly the documented wire format.
fn json_response(status: StatusCode, value: &Value) -> Response {
    let body = serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string());
    let mut response = (status, body).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// Ordered parameter sources for one request: query string first, then an
/// urlencoded form body, then a JSON body. The first non-empty value wins.
struct RequestParams {
    sources: Vec<ParamSource>,
}

enum ParamSource {
    Pairs(HashMap<String, String>),
    Json(Value),
}

impl RequestParams {
    fn gather(query: Option<&str>, headers: &HeaderMap, body: &[u8]) -> Self {
        let mut sources = Vec::new();

        if let Some(query) = query
            && let Ok(pairs) = serde_urlencoded::from_str::<HashMap<String, String>>(query)
        {
            sources.push(ParamSource::Pairs(pairs));
        }

        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        if content_type.starts_with("application/x-www-form-urlencoded")
            && let Ok(pairs) = serde_urlencoded::from_bytes::<HashMap<String, String>>(body)
        {
            sources.push(ParamSource::Pairs(pairs));
        }

        if !body.is_empty()
            && let Ok(value) = serde_json::from_slice::<Value>(body)
        {
            sources.push(ParamSource::Json(value));
        }

        Self { sources }
    }

    fn get(&self, key: &str) -> Option<String> {
        for source in &self.sources {
            let value = match source {
                ParamSource::Pairs(pairs) => pairs.get(key).cloned(),
                ParamSource::Json(value) => match value.get(key) {
                    Some(Value::String(text)) => Some(text.clone()),
                    Some(Value::Number(number)) => Some(number.to_string()),
                    _ => None,
                },
            };
            if let Some(value) = value
                && !value.is_empty()
            {
                return Some(value);
            }
        }
        None
    }
}

fn require_song(params: &RequestParams) -> ApiResult<String> {
    params
        .get("song")
        .ok_or_else(|| ApiError::bad_request("Missing required parameter: song"))
}

fn clamp_limit(value: Option<String>) -> u32 {
    value
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(DEFAULT_SEARCH_LIMIT)
        .clamp(1, MAX_SEARCH_LIMIT) as u32
}

fn parse_hours(value: Option<String>) -> u64 {
    value
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(DEFAULT_CLEAN_HOURS)
}

/// Scheme and host for absolute download URLs. The service itself never
/// terminates TLS, so `https` is only reported when a proxy says so.
fn request_base_url(headers: &HeaderMap) -> String {
    let scheme = match headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
    {
        Some("https") => "https",
        _ => "http",
    };
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or(DEFAULT_PUBLIC_HOST);
    format!("{scheme}://{host}")
}

async fn api_index() -> Response {
    let doc = json!({
        "success": true,
        "message": "YouTube MP3 Download API",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Download songs from YouTube by name or URL in MP3 format",
        "endpoints": [
            {
                "path": "/search",
                "method": "GET/POST",
                "description": "Search songs by name",
                "parameters": {
                    "song": "Song name to search (required)",
                    "limit": "Number of results (optional, default: 10, max: 20)"
                }
            },
            {
                "path": "/info",
                "method": "GET/POST",
                "description": "Get song information by name or URL",
                "parameters": {
                    "song": "Song name or YouTube URL (required)"
                }
            },
            {
                "path": "/download",
                "method": "GET/POST",
                "description": "Download song as MP3 by name or URL",
                "parameters": {
                    "song": "Song name or YouTube URL (required)"
                }
            },
            {
                "path": "/clean",
                "method": "POST",
                "description": "Clean old downloaded files",
                "parameters": {
                    "hours": "Max age in hours (optional, default: 24)"
                }
            }
        ],
        "example_usage": {
            "search_by_name": "/search?song=shape of you",
            "info_by_name": "/info?song=believer imagine dragons",
            "info_by_url": "/info?song=https://youtube.com/watch?v=VIDEO_ID",
            "download_by_name": "/download?song=despacito",
            "download_by_url": "/download?song=https://youtube.com/watch?v=VIDEO_ID"
        }
    });
    json_response(StatusCode::OK, &doc)
}

async fn search_songs(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let params = RequestParams::gather(query.as_deref(), &headers, &body);
    let song = require_song(&params)?;
    let limit = clamp_limit(params.get("limit"));

    let ytdlp = state.ytdlp.clone();
    let song_for_task = song.clone();
    let results = tokio::task::spawn_blocking(move || ytdlp.search(&song_for_task, limit))
        .await
        .map_err(|err| ApiError::internal(err.to_string()))??;

    Ok(json_response(
        StatusCode::OK,
        &json!({
            "success": true,
            "query": song,
            "count": results.len(),
            "results": results,
        }),
    ))
}

async fn song_info(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let params = RequestParams::gather(query.as_deref(), &headers, &body);
    let song = require_song(&params)?;

    let ytdlp = state.ytdlp.clone();
    let info = tokio::task::spawn_blocking(move || {
        let resolved = ytdlp.resolve(&song)?;
        ytdlp.fetch_info(&resolved.url)
    })
    .await
    .map_err(|err| ApiError::internal(err.to_string()))??;

    Ok(json_response(
        StatusCode::OK,
        &json!({
            "success": true,
            "data": info,
        }),
    ))
}

struct DownloadOutcome {
    title: String,
    filename: String,
    file_size: u64,
    cached: bool,
}

async fn download_song(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let params = RequestParams::gather(query.as_deref(), &headers, &body);
    let song = require_song(&params)?;

    let ytdlp = state.ytdlp.clone();
    let store = state.store.clone();
    let outcome = tokio::task::spawn_blocking(move || -> ApiResult<DownloadOutcome> {
        let resolved = ytdlp.resolve(&song)?;
        let video_id = resolved.video_id.clone().ok_or(FetchError::NoVideoId)?;

        // Metadata lookup is best-effort: a failed info call degrades the
        // title to the video ID without failing the download.
        let title = ytdlp
            .fetch_info(&resolved.url)
            .map(|info| info.title)
            .unwrap_or_else(|_| video_id.clone());

        let dest = store.resolve_path(&video_id);
        let filename = format!("{video_id}.mp3");

        if store.exists(&dest) {
            let file_size = store
                .file_size(&dest)
                .map_err(|err| ApiError::internal(err.to_string()))?;
            return Ok(DownloadOutcome {
                title,
                filename,
                file_size,
                cached: true,
            });
        }

        ytdlp.download_audio(&resolved.url, &dest)?;
        let file_size = store
            .file_size(&dest)
            .map_err(|err| ApiError::internal(err.to_string()))?;
        Ok(DownloadOutcome {
            title,
            filename,
            file_size,
            cached: false,
        })
    })
    .await
    .map_err(|err| ApiError::internal(err.to_string()))??;

    let download_url = format!(
        "{}/downloads/{}",
        request_base_url(&headers),
        outcome.filename
    );
    Ok(json_response(
        StatusCode::OK,
        &json!({
            "success": true,
            "data": {
                "title": outcome.title,
                "download_url": download_url,
                "filename": outcome.filename,
                "format": "mp3",
                "quality": "192kbps",
                "file_size": outcome.file_size,
                "cached": outcome.cached,
            },
        }),
    ))
}

async fn clean_files(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let params = RequestParams::gather(query.as_deref(), &headers, &body);
    let hours = parse_hours(params.get("hours"));

    let store = state.store.clone();
    let deleted = tokio::task::spawn_blocking(move || store.cleanup(hours))
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
        .map_err(|err| ApiError::internal(err.to_string()))?;

    Ok(json_response(
        StatusCode::OK,
        &json!({
            "success": true,
            "message": format!("Cleaned {deleted} old files"),
        }),
    ))
}

async fn clean_method_not_allowed() -> ApiError {
    ApiError::method_not_allowed("Method not allowed. Use POST.")
}

async fn serve_download(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> ApiResult<Response> {
    // Only the final path component is honored, so a crafted name can never
    // escape the download directory.
    let filename = Path::new(&name)
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| ApiError::not_found("File not found"))?;
    let path = state.store.root().join(&filename);

    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("File not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("File not found"))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("File not found"));
    }

    let mime = MimeGuess::from_path(&path).first_or_octet_stream();
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
        .map_err(|_| ApiError::not_found("File not found"))?;

    let stream = ReaderStream::new(file);
    let mut response = Body::from_stream(stream).into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.as_ref()).unwrap_or(HeaderValue::from_static(
            "application/octet-stream",
        )),
    );
    response_headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .unwrap_or(HeaderValue::from_static("0")),
    );
    response_headers.insert(header::CONTENT_DISPOSITION, disposition);
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    Ok(response)
}

async fn endpoint_not_found() -> ApiError {
    ApiError::not_found("Endpoint not found")
}

/// Adds the permissive CORS headers to every response and short-circuits
/// OPTIONS pre-flight requests with an empty 200.
async fn cors(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut response = StatusCode::OK.into_response();
        apply_cors_headers(response.headers_mut());
        return response;
    }

    let mut response = next.run(req).await;
    apply_cors_headers(response.headers_mut());
    response
}

fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(api_index))
        .route("/search", get(search_songs).post(search_songs))
        .route("/info", get(song_info).post(song_info))
        .route("/download", get(download_song).post(download_song))
        .route("/clean", post(clean_files).fallback(clean_method_not_allowed))
        .route("/downloads/{name}", get(serve_download))
        .fallback(endpoint_not_found)
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

fn parse_overrides<I>(iter: I) -> Result<RuntimeOverrides>
where
    I: IntoIterator<Item = String>,
{
    let mut overrides = RuntimeOverrides::default();
    let mut args = iter.into_iter();
    while let Some(arg) = args.next() {
        let (flag, inline_value) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg, None),
        };
        let mut take_value = || -> Result<String> {
            inline_value
                .clone()
                .or_else(|| args.next())
                .ok_or_else(|| anyhow!("{flag} requires a value"))
        };
        match flag.as_str() {
            "--download-root" => overrides.download_root = Some(PathBuf::from(take_value()?)),
            "--port" => {
                overrides.port = Some(
                    take_value()?
                        .parse::<u16>()
                        .context("expected a numeric port between 0 and 65535")?,
                )
            }
            "--host" => overrides.host = Some(take_value()?),
            "--cookies" => overrides.cookies_file = Some(PathBuf::from(take_value()?)),
            "--ytdlp-bin" => overrides.ytdlp_bin = Some(PathBuf::from(take_value()?)),
            "--env-file" => overrides.env_path = Some(PathBuf::from(take_value()?)),
            _ => return Err(anyhow!("unknown argument: {flag}")),
        }
    }
    Ok(overrides)
}

#[tokio::main]
async fn main() -> Result<()> {
    let overrides = parse_overrides(std::env::args().skip(1))?;
    ensure_not_root("server")?;

    let settings = resolve_runtime_settings(overrides)?;
    let host = settings
        .host
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/SONGFETCH_HOST")?;

    let store = DownloadStore::open(&settings.download_root)?;
    let ytdlp = YtDlp::new(&settings.ytdlp_bin, &settings.cookies_file);

    let state = AppState {
        ytdlp: Arc::new(ytdlp),
        store: Arc::new(store),
    };
    let app = router(state);

    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    println!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn shutdown_signal() {
    // Only graceful shutdown is affected if the handler fails to install;
    // the process still dies on Ctrl+C.
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Failed to install Ctrl+C handler: {}", err);
    }
}
