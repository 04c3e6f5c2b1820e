use crate::buffer::BatchBuffer;
use crate::config::ApiConfig;
use crate::enricher::{
    parse_body, query_to_body, EnrichError, Enricher, RawEvent, SetCookie, CLIENT_ID_COOKIE,
    SESSION_ID_COOKIE,
};
use crate::sink::{SinkError, MAX_RECORD_BYTES};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{ConnectInfo, DefaultBodyLimit, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use chrono::Utc;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

/// 1x1 transparent GIF returned to pixel requests
pub const TRANSPARENT_PIXEL: &[u8] = b"GIF89a\x01\x00\x01\x00\x80\x00\x00\x00\x00\x00\x00\x00\x00\x21\xF9\x04\x01\x00\x00\x00\x00\x2C\x00\x00\x00\x00\x01\x00\x01\x00\x00\x02\x02\x44\x01\x00\x3B";

/// Country code header set by the CDN edge
const VIEWER_COUNTRY_HEADER: &str = "cloudfront-viewer-country";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub buffer: Arc<BatchBuffer>,
    pub enricher: Arc<Enricher>,
}

/// Errors surfaced to the client of the tracking endpoint
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Enrich(#[from] EnrichError),

    /// The flush triggered by this request failed; the event itself is still buffered
    #[error(transparent)]
    Sink(#[from] SinkError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Enrich(e @ EnrichError::RecordTooLarge { .. }) => {
                warn!(error = %e, "Rejected oversized tracking event");
                StatusCode::PAYLOAD_TOO_LARGE
            }
            ApiError::Enrich(e) => {
                warn!(error = %e, "Rejected tracking request");
                StatusCode::BAD_REQUEST
            }
            ApiError::Sink(e) => {
                warn!(error = %e, "Flush triggered by request failed");
                StatusCode::BAD_REQUEST
            }
        };
        (status, self.to_string()).into_response()
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([Method::POST, Method::GET, Method::OPTIONS, Method::PUT])
        .allow_headers([
            header::ACCEPT,
            header::CONTENT_TYPE,
            header::CONTENT_LENGTH,
            header::ACCEPT_ENCODING,
            HeaderName::from_static("x-csrf-token"),
            header::AUTHORIZATION,
        ]);

    Router::new()
        .route("/_healthcheck", get(health_check))
        .route("/api/pixel", any(track))
        .fallback(not_found)
        // A body over the record limit could never be delivered
        .layer(DefaultBodyLimit::max(MAX_RECORD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "collector-service",
        "pending_records": state.buffer.pending(),
    }))
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Tracking endpoint: GET takes the event from the query string and answers
/// with a pixel, POST takes a JSON object body. OPTIONS never gets here, the
/// CORS layer answers it.
#[instrument(skip_all, fields(method = %method))]
async fn track(
    State(state): State<AppState>,
    method: Method,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Query(query): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Response {
    let body = match method {
        Method::GET => query_to_body(query),
        Method::POST => match parse_body(&body) {
            Ok(body) => body,
            Err(e) => return ApiError::from(e).into_response(),
        },
        _ => return StatusCode::NOT_ACCEPTABLE.into_response(),
    };

    let event = RawEvent {
        body,
        user_agent: header_str(&headers, header::USER_AGENT.as_str()),
        ip: client_ip(&headers, peer.map(|ConnectInfo(addr)| addr)),
        country_code: header_str(&headers, VIEWER_COUNTRY_HEADER),
        client_cookie: cookie_value(&headers, CLIENT_ID_COOKIE),
        session_cookie: cookie_value(&headers, SESSION_ID_COOKIE),
    };

    let enriched = match state.enricher.enrich(event) {
        Ok(enriched) => enriched,
        Err(e) => return ApiError::from(e).into_response(),
    };

    let mut response = match state.buffer.append(enriched.record).await {
        Ok(()) if method == Method::GET => pixel_response(),
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => ApiError::from(e).into_response(),
    };

    // Identifiers were already written into the buffered record, so the
    // client keeps them even when the flush failed
    set_cookies(&mut response, &enriched.cookies);
    response
}

fn pixel_response() -> Response {
    let last_modified = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/gif".to_string()),
            (header::LAST_MODIFIED, last_modified),
            (header::EXPIRES, "Wed, 11 Nov 1998 11:11:11 GMT".to_string()),
            (
                header::CACHE_CONTROL,
                "no-store, no-cache, must-revalidate, post-check=0, pre-check=0".to_string(),
            ),
            (header::PRAGMA, "no-cache".to_string()),
        ],
        TRANSPARENT_PIXEL,
    )
        .into_response()
}

fn set_cookies(response: &mut Response, cookies: &[SetCookie]) {
    for cookie in cookies {
        if let Ok(value) = HeaderValue::from_str(&cookie.header_value()) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(String::from)
}

/// Resolve the client address, preferring proxy headers over the peer address
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    header_str(headers, "x-forwarded-for")
        .and_then(|forwarded| {
            forwarded
                .split(',')
                .map(str::trim)
                .find(|ip| !ip.is_empty())
                .map(String::from)
        })
        .or_else(|| header_str(headers, "x-real-ip"))
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

/// Start the tracking API server, serving until `shutdown` resolves
pub async fn start_api_server<F>(state: AppState, config: &ApiConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting tracking API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("API server error")?;

    Ok(())
}
