use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderValue, Uri, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use futures::StreamExt as _;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::*;
use crate::normalizer::StreamMetadata;
use crate::provider::{GenerateRequest, validate_generate_request};
use crate::registry::SessionRegistry;
use crate::schema::SCHEMA_VERSION;
use crate::session::{StreamMode, StreamSession, Transport};
use crate::state::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const TRACE_ID_HEADER: &str = "x-trace-id";

// ============================================================================
// Middleware
// ============================================================================

/// Correlation ids supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub request_id: Option<String>,
    pub trace_id: Option<String>,
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub async fn request_context_middleware(mut request: Request, next: Next) -> Response {
    let context = RequestContext {
        request_id: header_string(request.headers(), REQUEST_ID_HEADER),
        trace_id: header_string(request.headers(), TRACE_ID_HEADER),
    };
    request.extensions_mut().insert(context.clone());

    let mut response = next.run(request).await;
    if let Some(request_id) = context.request_id {
        if !response.headers().contains_key(REQUEST_ID_HEADER) {
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                response.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
        }
    }
    response
}

// ============================================================================
// Negotiation
// ============================================================================

fn transport_for_media(media: &str) -> Option<Transport> {
    match media.to_ascii_lowercase().as_str() {
        "text/event-stream" => Some(Transport::Sse),
        "application/x-ndjson" | "application/ndjson" | "application/jsonl" => {
            Some(Transport::Ndjson)
        }
        _ => None,
    }
}

fn is_passthrough_param(param: &str) -> bool {
    let Some((key, value)) = param.split_once('=') else {
        return false;
    };
    let key = key.trim();
    (key.eq_ignore_ascii_case("profile") || key.eq_ignore_ascii_case("mode"))
        && value.trim().trim_matches('"').eq_ignore_ascii_case("passthrough")
}

/// Picks mode and transport from the `Accept` header, then the path.
///
/// The first recognized media range decides the transport. Anything left
/// undecided falls back to path hints and finally to normalized SSE.
pub fn negotiate(headers: &HeaderMap, path: &str) -> (StreamMode, Transport) {
    let mut transport = None;
    let mut mode = None;

    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    for range in accept.split(',') {
        let mut parts = range.split(';');
        let media = parts.next().unwrap_or_default().trim();
        let Some(found) = transport_for_media(media) else {
            continue;
        };
        transport = Some(found);
        if parts.any(is_passthrough_param) {
            mode = Some(StreamMode::Passthrough);
        }
        break;
    }

    let path = path.trim_end_matches('/');
    let transport = transport.unwrap_or(if path.ends_with(".ndjson") || path.ends_with("/ndjson") {
        Transport::Ndjson
    } else {
        Transport::Sse
    });
    let mode = mode.unwrap_or(
        if path.ends_with("/chat/completions") || path.ends_with("/passthrough") {
            StreamMode::Passthrough
        } else {
            StreamMode::Normalized
        },
    );
    (mode, transport)
}

/// Forces streaming and settles the request and trace ids.
///
/// Ids in the body win over headers; a UUIDv7 request id is generated when
/// neither carries one.
pub fn prepare_request(mut request: GenerateRequest, context: &RequestContext) -> GenerateRequest {
    request.stream = true;
    let request_id = request
        .request_id
        .take()
        .filter(|id| !id.trim().is_empty())
        .or_else(|| context.request_id.clone())
        .unwrap_or_else(|| Uuid::now_v7().to_string());
    request.request_id = Some(request_id);
    if request.trace_id.is_none() {
        request.trace_id = context.trace_id.clone();
    }
    request
}

// ============================================================================
// STREAM HANDLER
// ============================================================================

/// POST /v1/generate/stream (and the NDJSON / passthrough aliases)
///
/// Body: GenerateRequest JSON. Errors before the first byte are JSON error
/// responses carrying the request id; afterwards failures only end the
/// stream.
pub async fn generate_stream_handler(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    uri: Uri,
    headers: HeaderMap,
    payload: std::result::Result<Json<GenerateRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => prepare_request(request, &context),
        Err(rejection) => {
            log::warn!("rejected body: {}", rejection);
            return error_response(AppError::from(rejection), context.request_id);
        }
    };
    let request_id = request.request_id.clone().unwrap_or_default();
    let (mode, transport) = negotiate(&headers, uri.path());

    match open_session(&state, request, mode, transport).await {
        Ok(session) => stream_response(session, state.sessions.clone(), request_id),
        Err(err) => {
            log_error(&err);
            error_response(err, Some(request_id))
        }
    }
}

fn error_response(error: AppError, request_id: Option<String>) -> Response {
    let mut body = ErrorResponse::new(error);
    if let Some(request_id) = request_id {
        body = body.with_request_id(request_id);
    }
    body.into_response()
}

/// Validates, claims the request id and opens the upstream source.
async fn open_session(
    state: &AppState,
    request: GenerateRequest,
    mode: StreamMode,
    transport: Transport,
) -> Result<StreamSession> {
    validate_generate_request(&request)?;
    let request_id = request.request_id.clone().unwrap_or_default();

    let cancel = state.sessions.register(&request_id).await?;
    let source = match state.provider.open_stream(&request).await {
        Ok(source) => source,
        Err(err) => {
            state.sessions.unregister(&request_id).await;
            return Err(err);
        }
    };

    let metadata = StreamMetadata::new(state.provider.id(), request.model.as_str())
        .with_request_id(request_id.as_str())
        .with_trace_id(request.trace_id.clone());
    Ok(StreamSession::new(
        mode,
        transport,
        metadata,
        source,
        state.settings.clone(),
        cancel,
    ))
}

/// Runs the session in the background and hands its output to the body.
///
/// Dropping the body (client gone, or server shutting the connection)
/// cancels the session.
fn stream_response(session: StreamSession, sessions: SessionRegistry, request_id: String) -> Response {
    let (writer, reader) = tokio::io::duplex(session.write_buffer_size().max(1));
    let mut headers = session.transport.headers();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }

    let guard = session.cancel_token().clone().drop_guard();
    tokio::spawn(async move {
        // outcome already logged by the session
        let _ = session.run(writer).await;
        sessions.unregister(&request_id).await;
    });

    let body = async_stream::stream! {
        let _guard = guard;
        let mut chunks = ReaderStream::new(reader);
        while let Some(chunk) = chunks.next().await {
            yield chunk;
        }
    };
    (headers, Body::from_stream(body)).into_response()
}

// ============================================================================
// CANCEL HANDLER
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub success: bool,
    pub request_id: String,
    pub message: String,
}

/// DELETE /v1/streams/{request_id}
pub async fn cancel_stream_handler(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> Result<Json<CancelResponse>> {
    if !state.sessions.cancel(&request_id).await {
        return Err(AppError::not_found(format!("Stream {}", request_id)));
    }
    log::info!("stream {} cancelled by request", request_id);
    Ok(Json(CancelResponse {
        success: true,
        message: format!("Stream {} cancelled", request_id),
        request_id,
    }))
}

// ============================================================================
// HEALTH
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub schema: String,
    pub provider: String,
    pub active_streams: usize,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        schema: SCHEMA_VERSION.to_string(),
        provider: state.provider.id().to_string(),
        active_streams: state.sessions.active().await,
    })
}

// ============================================================================
// Router
// ============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/generate/stream", post(generate_stream_handler))
        .route("/v1/generate/stream/ndjson", post(generate_stream_handler))
        .route("/v1/chat/completions", post(generate_stream_handler))
        .route("/v1/passthrough", post(generate_stream_handler))
        .route("/v1/streams/{request_id}", delete(cancel_stream_handler))
        .route("/health", get(health_check))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_str(value).expect("header"));
        headers
    }

    #[test]
    fn defaults_to_normalized_sse() {
        let none = HeaderMap::new();
        assert_eq!(
            negotiate(&none, "/v1/generate/stream"),
            (StreamMode::Normalized, Transport::Sse)
        );
        assert_eq!(
            negotiate(&accept("*/*"), "/v1/generate/stream"),
            (StreamMode::Normalized, Transport::Sse)
        );
    }

    #[test]
    fn first_recognized_media_range_wins() {
        let headers = accept("text/html, application/x-ndjson, text/event-stream");
        assert_eq!(
            negotiate(&headers, "/v1/generate/stream"),
            (StreamMode::Normalized, Transport::Ndjson)
        );
        let headers = accept("Text/Event-Stream;q=0.9, application/jsonl");
        assert_eq!(negotiate(&headers, "/v1/generate/stream").1, Transport::Sse);
    }

    #[test]
    fn accept_profile_selects_passthrough() {
        let headers = accept("application/ndjson; profile=\"passthrough\"");
        assert_eq!(
            negotiate(&headers, "/v1/generate/stream"),
            (StreamMode::Passthrough, Transport::Ndjson)
        );
        let headers = accept("text/event-stream;mode=passthrough");
        assert_eq!(negotiate(&headers, "/v1/generate/stream").0, StreamMode::Passthrough);
    }

    #[test]
    fn path_hints_fill_the_gaps() {
        let none = HeaderMap::new();
        assert_eq!(
            negotiate(&none, "/v1/generate/stream/ndjson"),
            (StreamMode::Normalized, Transport::Ndjson)
        );
        assert_eq!(
            negotiate(&none, "/v1/chat/completions"),
            (StreamMode::Passthrough, Transport::Sse)
        );
        assert_eq!(
            negotiate(&accept("application/x-ndjson"), "/v1/passthrough/"),
            (StreamMode::Passthrough, Transport::Ndjson)
        );
    }

    #[tokio::test]
    async fn middleware_attaches_context_and_echoes_request_id() {
        use tower::ServiceExt as _;

        async fn ids(Extension(context): Extension<RequestContext>) -> String {
            format!("{:?}|{:?}", context.request_id, context.trace_id)
        }
        let app = Router::new()
            .route("/ids", get(ids))
            .layer(middleware::from_fn(request_context_middleware));

        let request = axum::http::Request::builder()
            .uri("/ids")
            .header(REQUEST_ID_HEADER, " req-1 ")
            .header(TRACE_ID_HEADER, "")
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "req-1");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        assert_eq!(&bytes[..], b"Some(\"req-1\")|None");
    }

    #[test]
    fn prepare_forces_streaming_and_assigns_ids() {
        let context = RequestContext {
            request_id: Some("hdr-id".into()),
            trace_id: Some("trace-9".into()),
        };
        let prepared = prepare_request(GenerateRequest::default(), &context);
        assert!(prepared.stream);
        assert_eq!(prepared.request_id.as_deref(), Some("hdr-id"));
        assert_eq!(prepared.trace_id.as_deref(), Some("trace-9"));

        let body = GenerateRequest {
            request_id: Some("body-id".into()),
            ..Default::default()
        };
        let prepared = prepare_request(body, &context);
        assert_eq!(prepared.request_id.as_deref(), Some("body-id"));

        let generated = prepare_request(GenerateRequest::default(), &RequestContext::default());
        let id = generated.request_id.expect("generated");
        assert!(Uuid::parse_str(&id).is_ok());
        assert!(generated.trace_id.is_none());
    }
}
