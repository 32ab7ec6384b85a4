//! HTTP delivery of transcoder output
//!
//! Serves `/<prefix>/<identity>[/<path>]` from the identity's output
//! directory and a plain-text listing of active streams at `/`. The router
//! keeps no state besides the registry handle.

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower::ServiceExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeFile;

use crate::registry::SessionRegistry;
use crate::server::ServerConfig;

const NO_CACHE: [(header::HeaderName, &str); 3] = [
    (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
    (header::PRAGMA, "no-cache"),
    (header::EXPIRES, "0"),
];

/// Shared state of the delivery router
#[derive(Clone)]
pub struct DeliveryState {
    registry: Arc<SessionRegistry>,
    output_dir: PathBuf,
    prefix: String,
    playlist: String,
}

impl DeliveryState {
    pub fn new(
        registry: Arc<SessionRegistry>,
        output_dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        playlist: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            output_dir: output_dir.into(),
            prefix: prefix.into().trim_matches('/').to_string(),
            playlist: playlist.into(),
        }
    }

    /// State for the directories and URLs described by `config`
    pub fn from_config(registry: Arc<SessionRegistry>, config: &ServerConfig) -> Self {
        Self::new(
            registry,
            config.output_dir.clone(),
            config.delivery_prefix.clone(),
            config.playlist_name.clone(),
        )
    }

    /// URL path of an identity's playlist
    pub fn playlist_path(&self, identity: &str) -> String {
        format!("{}/{}/{}", self.base(), identity, self.playlist)
    }

    fn base(&self) -> String {
        if self.prefix.is_empty() {
            String::new()
        } else {
            format!("/{}", self.prefix)
        }
    }
}

/// Build the delivery router
pub fn router(state: DeliveryState) -> Router {
    let base = state.base();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::ORIGIN, header::CONTENT_TYPE]);

    Router::new()
        .route("/", get(list_streams))
        .route(&format!("{base}/:identity"), get(serve_playlist))
        .route(&format!("{base}/:identity/"), get(serve_playlist))
        .route(&format!("{base}/:identity/*path"), get(serve_artifact))
        .with_state(state)
        .layer(cors)
}

async fn list_streams(State(state): State<DeliveryState>) -> impl IntoResponse {
    let body: String = state
        .registry
        .active_identities()
        .iter()
        .map(|identity| format!("{} {}\n", identity, state.playlist_path(identity)))
        .collect();

    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body)
}

async fn serve_playlist(
    State(state): State<DeliveryState>,
    Path(identity): Path<String>,
    request: Request,
) -> Response {
    let playlist = state.playlist.clone();
    serve_file(&state, &identity, &playlist, request).await
}

async fn serve_artifact(
    State(state): State<DeliveryState>,
    Path((identity, path)): Path<(String, String)>,
    request: Request,
) -> Response {
    serve_file(&state, &identity, &path, request).await
}

/// Serve one artifact through `ServeFile`, which handles ranges and
/// conditional requests
async fn serve_file(
    state: &DeliveryState,
    identity: &str,
    relative: &str,
    request: Request,
) -> Response {
    let Some(relative) = sanitize(relative) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !is_segment(identity) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let dir = state.output_dir.join(identity);
    if !is_dir(&dir).await {
        return StatusCode::NOT_FOUND.into_response();
    }

    let relative = if relative.as_os_str().is_empty() {
        PathBuf::from(&state.playlist)
    } else {
        relative
    };
    let file = dir.join(&relative);
    if is_dir(&file).await {
        return StatusCode::NOT_FOUND.into_response();
    }

    let mut response = match ServeFile::new(&file).oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(never) => match never {},
    };

    if let Some(mime) = hls_content_type(&file) {
        let status = response.status();
        let headers = response.headers_mut();
        if response_has_body(status) {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(mime));
        }
        for (name, value) in NO_CACHE {
            headers.insert(name, HeaderValue::from_static(value));
        }
    }

    response
}

async fn is_dir(path: &FsPath) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

fn response_has_body(status: StatusCode) -> bool {
    status == StatusCode::OK || status == StatusCode::PARTIAL_CONTENT
}

/// Relative path with empty and `.` components dropped; `None` if it escapes
fn sanitize(path: &str) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => return None,
            part if part.contains('\\') || part.contains('\0') => return None,
            part => clean.push(part),
        }
    }
    Some(clean)
}

fn is_segment(s: &str) -> bool {
    !s.is_empty() && s != "." && s != ".." && !s.contains(['/', '\\', '\0'])
}

/// Playlists and segments get the HLS media types and no-cache headers
fn hls_content_type(path: &FsPath) -> Option<&'static str> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("m3u8") => Some("application/vnd.apple.mpegurl"),
        Some("ts") => Some("video/mp2t"),
        _ => None,
    }
}
