//! Request pipeline: CORS, client tracking, sealing and authentication

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, FromRequest, Request, State};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::SESSION_HEADER;
use crate::api::ErrorResponse;
use crate::config::Settings;
use crate::error::BridgeError;
use crate::overlay::{OverlayError, Plaintext};
use crate::state::AppState;

/// Settings snapshot captured when the request entered the pipeline
fn snapshot(state: &AppState, request: &Request) -> Arc<Settings> {
    request
        .extensions()
        .get::<Arc<Settings>>()
        .cloned()
        .unwrap_or_else(|| state.settings().snapshot())
}

/// Value of the session header, if any
pub(crate) fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
}

fn apply_cors(headers: &mut HeaderMap) {
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
        HeaderValue::from_static("Authorization, Content-Type, X-Remo-Session"),
    );
}

/// Permissive CORS; preflight requests are answered here
pub(crate) async fn cors(request: Request, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };
    apply_cors(response.headers_mut());
    response
}

/// Record the caller and pin the settings snapshot for this request
pub(crate) async fn track(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_owned(), |ConnectInfo(addr)| addr.ip().to_string());
    state.activity().touch(&client);

    debug!(%client, method = %request.method(), path = %request.uri().path(), "Request");
    request.extensions_mut().insert(state.settings().snapshot());
    next.run(request).await
}

/// Reject callers without the configured bearer credential
pub(crate) async fn auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let settings = snapshot(&state, &request);
    if settings.encryption_enabled() && bearer(request.headers()) != Some(settings.password.as_str())
    {
        return BridgeError::Unauthorized.into_response();
    }
    next.run(request).await
}

/// Seal response bodies with the overlay
///
/// Responses carrying the [`Plaintext`] extension are passed through.
pub(crate) async fn seal(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let settings = snapshot(&state, &request);
    let session = session_header(request.headers());

    let response = next.run(request).await;
    if !settings.encryption_enabled() || response.extensions().get::<Plaintext>().is_some() {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => return BridgeError::Internal(e.to_string()).into_response(),
    };

    match state.overlay(&settings).wrap(session.as_deref(), &body) {
        Ok(sealed) => {
            parts.headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            parts.headers.remove(header::CONTENT_LENGTH);
            Response::from_parts(parts, Body::from(sealed))
        }
        Err(OverlayError::InvalidSession) => BridgeError::InvalidSession.into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to seal response");
            let error = ErrorResponse {
                error: format!("Encryption failed: {e}"),
                code: Some("encryption_failed".to_owned()),
            };
            (parts.status, Json(error)).into_response()
        }
    }
}

/// JSON body opened by the overlay
#[derive(Debug, Clone)]
pub(crate) struct Sealed<T>(pub(crate) T);

impl<T> FromRequest<AppState> for Sealed<T>
where
    T: DeserializeOwned + Send,
{
    type Rejection = BridgeError;

    async fn from_request(request: Request, state: &AppState) -> Result<Self, Self::Rejection> {
        let settings = snapshot(state, &request);
        let session = session_header(request.headers());

        let body = Bytes::from_request(request, state)
            .await
            .map_err(|e| BridgeError::Protocol(e.body_text()))?;
        let plain = state.overlay(&settings).unwrap(session.as_deref(), &body)?;

        serde_json::from_slice(&plain)
            .map(Self)
            .map_err(|e| BridgeError::Protocol(format!("Invalid request body: {e}")))
    }
}

/// Run hardware work on the blocking pool
pub(crate) async fn blocking<F, T>(work: F) -> Result<T, BridgeError>
where
    F: FnOnce() -> Result<T, BridgeError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| BridgeError::Internal(e.to_string()))?
}
