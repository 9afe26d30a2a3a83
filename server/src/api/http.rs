use axum::{
    body::Bytes,
    extract::State as AxumState,
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::{ActionError, Dispatcher};

#[derive(Serialize)]
struct HealthzResponse {
    ok: bool,
}

#[derive(Serialize)]
struct ErrorResponse<'a> {
    ok: bool,
    error: &'a str,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            ok: false,
            error: message,
        }),
    )
        .into_response()
}

pub(super) async fn healthz() -> Response {
    Json(HealthzResponse { ok: true }).into_response()
}

/// The action endpoint. `OPTIONS` answers pre-flight, `POST` dispatches,
/// everything else is refused.
pub(super) async fn action(
    AxumState(dispatcher): AxumState<Arc<Dispatcher>>,
    method: Method,
    body: Bytes,
) -> Response {
    if method == Method::OPTIONS {
        return StatusCode::NO_CONTENT.into_response();
    }
    if method != Method::POST {
        return error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
    }

    let start = Instant::now();
    let result = dispatcher.handle(&body).await;
    dispatcher.metrics().record_dispatch(start.elapsed());
    match result {
        Ok(outcome) => Json(outcome.into_envelope()).into_response(),
        Err(err) => {
            let status = err.status();
            let message = err.to_string();
            log_failure(&err, &message);
            error_response(status, &message)
        }
    }
}

fn log_failure(err: &ActionError, message: &str) {
    if err.status().is_server_error() {
        tracing::error!(error = %message, "action failed");
    } else {
        tracing::warn!(error = %message, "action rejected");
    }
}

pub(super) async fn metrics(
    headers: HeaderMap,
    AxumState(dispatcher): AxumState<Arc<Dispatcher>>,
) -> Response {
    if let Some(status) = metrics_auth_error(
        &headers,
        dispatcher.config().metrics_auth_token.as_deref(),
    ) {
        return status.into_response();
    }
    Json(dispatcher.metrics().snapshot()).into_response()
}

fn metrics_auth_error(headers: &HeaderMap, token: Option<&str>) -> Option<StatusCode> {
    let token = token.filter(|token| !token.is_empty())?;
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let header_token = headers
        .get("x-metrics-token")
        .and_then(|value| value.to_str().ok());
    if bearer == Some(token) || header_token == Some(token) {
        None
    } else {
        Some(StatusCode::UNAUTHORIZED)
    }
}
