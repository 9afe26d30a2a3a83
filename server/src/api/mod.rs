use axum::{
    extract::{DefaultBodyLimit, Request},
    http::{header, HeaderValue},
    middleware::{self, Next},
    response::Response,
    routing::{any, get},
    Router,
};
use governor::middleware::NoOpMiddleware;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::Dispatcher;

mod http;

const REQUEST_ID_HEADER: &str = "x-request-id";

pub struct Api {
    dispatcher: Arc<Dispatcher>,
}

type IpGovernorConfig =
    tower_governor::governor::GovernorConfig<SmartIpKeyExtractor, NoOpMiddleware>;

fn governor_config(rate_per_second: u64, burst_size: u32) -> Option<Arc<IpGovernorConfig>> {
    if rate_per_second == 0 || burst_size == 0 {
        return None;
    }
    let nanos_per_request = (1_000_000_000u64 / rate_per_second).max(1);
    let config = GovernorConfigBuilder::default()
        .period(Duration::from_nanos(nanos_per_request))
        .burst_size(burst_size)
        .key_extractor(SmartIpKeyExtractor)
        .finish();
    if config.is_none() {
        tracing::warn!("invalid rate-limit config; rate limiting disabled");
    }
    config.map(Arc::new)
}

impl Api {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn router(&self) -> Router {
        let config = self.dispatcher.config();

        let router = Router::new()
            .route("/", any(http::action))
            .route("/api/action", any(http::action))
            .route("/healthz", get(http::healthz))
            .route("/metrics", get(http::metrics));

        let governor_conf = match (
            config.http_rate_limit_per_second,
            config.http_rate_limit_burst,
        ) {
            (Some(rate_per_second), Some(burst_size)) => {
                governor_config(rate_per_second, burst_size)
            }
            _ => None,
        };
        let router = match governor_conf {
            Some(config) => router.layer(GovernorLayer { config }),
            None => router,
        };

        let router = router.layer(middleware::from_fn(cors_headers));
        let router = match config.http_body_limit_bytes {
            Some(limit) if limit > 0 => router.layer(DefaultBodyLimit::max(limit)),
            _ => router,
        };
        let router = router.layer(middleware::from_fn(request_id_middleware));
        let router = router.layer(TraceLayer::new_for_http());

        router.with_state(self.dispatcher.clone())
    }
}

/// Every response, including errors and pre-flight replies, allows any
/// origin.
async fn cors_headers(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    response
}

async fn request_id_middleware(req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let mut response = next.run(req).await;
    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(
            header::HeaderName::from_static(REQUEST_ID_HEADER),
            header_value,
        );
    }
    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "http.request"
    );
    response
}
