use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;

pub mod cache;
pub mod config;
pub mod negotiate;
pub mod pipeline;
pub mod transform;

use crate::cache::{CacheControl, DiskCache, KeyDeriver, ShardKey};
use crate::config::{ConfigError, SipConfig, SupportedFormat};
use crate::negotiate::negotiate;
use crate::pipeline::{Transcode, TranscodeJob, TranscodePipeline};
use crate::transform::{EncodeError, Encoder};

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("{0}")]
    Validation(&'static str),
    #[error("No format found")]
    NoAcceptableFormat,
    #[error("Source not found")]
    SourceNotFound,
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),
    #[error("Cache write error: {0}")]
    CacheWrite(#[source] std::io::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, SipError>;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
}

impl SipError {
    pub fn status(&self) -> StatusCode {
        match self {
            SipError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            SipError::Validation(_) => StatusCode::BAD_REQUEST,
            SipError::NoAcceptableFormat => StatusCode::NOT_ACCEPTABLE,
            SipError::SourceNotFound => StatusCode::NOT_FOUND,
            SipError::Encode(_)
            | SipError::CacheWrite(_)
            | SipError::Io(_)
            | SipError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for SipError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            SipError::MethodNotAllowed => status.into_response(),
            other => (status, Json(ErrorBody { message: other.to_string() })).into_response(),
        }
    }
}

/// What the handler needs from an HTTP request.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub accept: Option<String>,
}

impl InboundRequest {
    /// Raw `path?query` as received; the identifier hashed by
    /// [`cache::KeyPolicy::FullRequest`].
    pub fn target(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| self.uri.path())
    }
}

/// Query parameters of the image endpoint: `?src=<url-encoded path>`.
#[derive(Debug, Deserialize)]
pub struct SourceQuery {
    #[serde(default)]
    pub src: Option<String>,
}

/// Decoded `src` parameter, required and non-empty.
pub fn source_param(uri: &Uri) -> Result<String> {
    let query = uri
        .query()
        .filter(|q| !q.is_empty())
        .ok_or(SipError::Validation("No query"))?;
    let parsed: SourceQuery =
        serde_urlencoded::from_str(query).map_err(|_| SipError::Validation("Invalid query"))?;
    match parsed.src {
        Some(src) if !src.trim().is_empty() => Ok(src),
        _ => Err(SipError::Validation("Src is empty")),
    }
}

/// Resolves `src` under `context`, refusing anything that could escape it.
pub fn resolve_source(context: &Path, src: &str) -> Result<PathBuf> {
    if src.contains('\0') {
        return Err(SipError::Validation("Invalid src"));
    }
    let relative = Path::new(src.trim_start_matches('/'));
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(SipError::Validation("Invalid src"));
    }
    Ok(context.join(relative))
}

pub struct AppState {
    config: SipConfig,
    cache: Arc<DiskCache>,
    pipeline: TranscodePipeline,
    keys: KeyDeriver,
    cache_control: HeaderValue,
}

impl AppState {
    fn image_headers(&self, format: SupportedFormat) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(format.mime_type()));
        headers.insert(header::CACHE_CONTROL, self.cache_control.clone());
        headers.insert(header::VARY, HeaderValue::from_static("Accept"));
        headers
    }

    /// Runs one request through validation, negotiation, cache and transcode.
    pub async fn serve(&self, req: &InboundRequest) -> Result<Response> {
        if req.method != Method::GET {
            return Err(SipError::MethodNotAllowed);
        }
        let accept = req
            .accept
            .as_deref()
            .filter(|a| !a.trim().is_empty())
            .ok_or(SipError::Validation("No accept header"))?;
        let format = negotiate(Some(accept), &self.config.formats)?;
        let src = source_param(&req.uri)?;
        let source_path = resolve_source(&self.config.context, &src)?;
        let shard = self.keys.derive(req.target(), &src);

        if let Some(response) = self.serve_cached(&shard, format).await? {
            return Ok(response);
        }

        // Only one request per (shard, format) transcodes; the rest wait
        // here and then find its entry.
        let guard = self.cache.lock(&shard, format).await;
        if let Some(response) = self.serve_cached(&shard, format).await? {
            return Ok(response);
        }

        let source = open_source(&source_path).await?;
        tracing::info!(shard = %shard, %format, src = %src, "Cache miss, transcoding");
        let transcode = self.pipeline.start(TranscodeJob { shard, format, source, guard });
        self.stream_transcode(transcode, format).await
    }

    async fn serve_cached(&self, shard: &ShardKey, format: SupportedFormat) -> Result<Option<Response>> {
        let Some(entry) = self.cache.lookup(shard, format).await else {
            return Ok(None);
        };
        let Some(file) = self.cache.open_entry(&entry).await? else {
            return Ok(None);
        };
        tracing::info!(shard = %shard, file = %entry.filename, "Cache hit");
        let body = Body::from_stream(ReaderStream::new(file));
        Ok(Some((self.image_headers(format), body).into_response()))
    }

    /// Waits for the first encoded chunk so that an encoder failing up
    /// front still gets a proper error status; after that, headers are sent
    /// and the rest is streamed as it arrives.
    async fn stream_transcode(&self, transcode: Transcode, format: SupportedFormat) -> Result<Response> {
        let Transcode { mut body, done } = transcode;
        let first = match body.recv().await {
            Some(Ok(chunk)) => Some(chunk),
            Some(Err(e)) => return Err(SipError::Encode(e)),
            None => match done.await {
                Ok(Err(SipError::Encode(e))) => return Err(SipError::Encode(e)),
                Err(e) => return Err(SipError::Io(std::io::Error::other(e.to_string()))),
                Ok(_) => None,
            },
        };

        let rest = futures::stream::unfold(body, |mut rx: mpsc::Receiver<std::result::Result<Bytes, EncodeError>>| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let stream = futures::stream::iter(first.map(Ok::<Bytes, EncodeError>)).chain(rest);
        Ok((self.image_headers(format), Body::from_stream(stream)).into_response())
    }
}

async fn open_source(path: &Path) -> Result<fs::File> {
    let file = match fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(SipError::SourceNotFound),
        Err(e) => return Err(e.into()),
    };
    if !file.metadata().await?.is_file() {
        return Err(SipError::SourceNotFound);
    }
    Ok(file)
}

async fn handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let req = InboundRequest {
        method,
        uri,
        accept: headers
            .get(header::ACCEPT)
            .map(|v| v.to_str().unwrap_or_default().to_string()),
    };
    tracing::debug!(method = %req.method, uri = %req.uri, accept = ?req.accept, "Image request");

    match state.serve(&req).await {
        Ok(response) => response,
        Err(e) => {
            if e.status().is_server_error() {
                tracing::error!(uri = %req.uri, error = %e, "Request failed");
            } else {
                tracing::debug!(uri = %req.uri, status = %e.status(), error = %e, "Request rejected");
            }
            e.into_response()
        }
    }
}

/// Image proxy: owns the cache and the injected encoder.
pub struct SipServer {
    state: Arc<AppState>,
}

impl SipServer {
    /// Validates `config`, creates the cache root and loads its index.
    pub async fn new(config: SipConfig, encoder: Arc<dyn Encoder>) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(DiskCache::open(&config.output, config.ttl).await?);
        let pipeline = TranscodePipeline::new(cache.clone(), encoder, config.encode_timeout)
            .with_client_timeout(config.client_timeout);
        let keys = KeyDeriver::new(config.key_policy);
        let cache_control = HeaderValue::from_str(&CacheControl::for_ttl(config.ttl).value())
            .unwrap_or(HeaderValue::from_static("public, must-revalidate"));

        Ok(Self {
            state: Arc::new(AppState { config, cache, pipeline, keys, cache_control }),
        })
    }

    pub fn cache(&self) -> &Arc<DiskCache> {
        &self.state.cache
    }

    pub fn config(&self) -> &SipConfig {
        &self.state.config
    }

    /// Every path and method lands on the image handler.
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(handler)
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }
}
