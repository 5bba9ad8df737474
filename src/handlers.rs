use crate::{
    config::StreamMode,
    display::content_type_for,
    download::DownloadRequest,
    error::AppError,
    models::{DownloadParams, StatusResponse, VideoInfoRequest, VideoInfoResponse},
    AppState,
};
use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, HeaderValue},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio_stream::StreamExt;

// ===================================================================
//                          VIDEO INFO HANDLER
// ===================================================================

/// # POST /video-info - Fetches metadata and the downloadable formats for a URL.
pub async fn video_info(
    State(state): State<AppState>,
    Json(payload): Json<VideoInfoRequest>,
) -> Result<impl IntoResponse, AppError> {
    let url = payload.url.trim();
    if url.is_empty() {
        return Err(AppError::InvalidRequest("URL is required".to_string()));
    }

    let meta = state.metadata.fetch(url).await?;
    Ok(Json(VideoInfoResponse::from(&meta)))
}

// ===================================================================
//                          DOWNLOAD HANDLER
// ===================================================================

/// # GET /download - Streams a download as progress events or as raw bytes.
pub async fn download(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<DownloadParams>,
) -> Result<Response, AppError> {
    let request = DownloadRequest::from_params(&params)?;

    let client = client_id(&headers, peer, state.config.trust_forwarded_for);
    if !state.limiter.admit(&client) {
        return Err(AppError::RateLimited);
    }

    let tool = state.locator.ensure_available().await?;
    tracing::info!("Download request from {}: {} {} from {}", client, request.kind.as_str(), request.quality, request.url);

    match request.mode.unwrap_or(state.config.stream_mode) {
        StreamMode::Events => {
            let events = state
                .orchestrator
                .start_download(tool, request)
                .map(|event| Event::default().event(event.kind()).json_data(&event));
            Ok(Sse::new(events).keep_alive(KeepAlive::default()).into_response())
        }
        StreamMode::Raw => {
            let raw = state.orchestrator.start_raw(&tool, &request).await?;

            let mut headers = HeaderMap::new();
            let content_type = content_type_for(std::path::Path::new(&raw.filename));
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
            headers.insert(header::CONTENT_DISPOSITION, attachment(&raw.filename)?);

            Ok((headers, Body::from_stream(raw.body)).into_response())
        }
    }
}

/// The peer address, or the first `X-Forwarded-For` hop when the deployment
/// sits behind a trusted proxy.
pub fn client_id(headers: &HeaderMap, peer: SocketAddr, trust_forwarded_for: bool) -> String {
    if !trust_forwarded_for {
        return peer.ip().to_string();
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string())
}

fn attachment(filename: &str) -> Result<HeaderValue, AppError> {
    let disposition = format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        filename.replace('"', "_"),
        utf8_percent_encode(filename, NON_ALPHANUMERIC)
    );
    HeaderValue::from_str(&disposition).map_err(|e| AppError::Internal(e.into()))
}

// ===================================================================
//                          STATUS & FILE HANDLERS
// ===================================================================

/// # GET /status - Reports the yt-dlp installation and in-flight downloads.
pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let tool = state.locator.status().await;
    Json(StatusResponse { tool, active_downloads: state.orchestrator.active_jobs() })
}

/// # GET /get-file/:filename - Serves a finished download once, then deletes it.
/// The extractor has already percent-decoded the segment.
pub async fn get_file(State(state): State<AppState>, Path(filename): Path<String>) -> Result<Response, AppError> {
    if !is_safe_filename(&filename) {
        return Err(AppError::InvalidRequest("Invalid filename".to_string()));
    }

    let file_path = state.orchestrator.temp_dir().join(&filename);
    let file = match tokio::fs::File::open(&file_path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::NotFound(format!("File '{}' not found.", filename)));
        }
        Err(e) => return Err(e.into()),
    };
    let length = file.metadata().await?.len();

    // Removed once the body is dropped: after the last chunk, on error, or on disconnect.
    let guard = RemoveOnDrop(file_path.clone());
    let stream = tokio_util::io::ReaderStream::new(file).map(move |chunk| {
        let _held = &guard;
        chunk
    });
    let body = Body::from_stream(stream);

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type_for(&file_path)));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(header::CONTENT_DISPOSITION, attachment(&filename)?);

    tracing::info!("Serving {} ({} bytes)", filename, length);
    Ok((headers, body).into_response())
}

/// Only bare names inside the temp directory; checked before touching the filesystem.
pub fn is_safe_filename(name: &str) -> bool {
    !name.is_empty() && !name.contains("..") && !name.contains(['/', '\\', '\0', '%'])
}

struct RemoveOnDrop(PathBuf);

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => tracing::info!("Deleted served file {}", self.0.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to delete served file {}: {}", self.0.display(), e),
        }
    }
}
