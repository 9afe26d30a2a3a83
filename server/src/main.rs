use anyhow::{Context, Result};
use clap::Parser;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tapvault_gateway::{Gateway, GatewayConfig};
use tapvault_server::{
    Api, Dispatcher, ServerConfig, DEFAULT_CAS_MAX_ATTEMPTS, DEFAULT_HTTP_BODY_LIMIT_BYTES,
    DEFAULT_SWAP_POINTS_PER_USDT,
};
use tapvault_types::{ACTIONS_LOG_TABLE, USERS_TABLE};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() -> Result<()> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            (!trimmed.is_empty()).then_some(trimmed)
        });

    if let Some(endpoint) = endpoint {
        let service_name =
            std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "tapvault-server".to_string());
        let rate = std::env::var("OTEL_SAMPLING_RATE")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .map(|value| value.clamp(0.0, 1.0))
            .unwrap_or(1.0);
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
            .context("failed to build OTLP exporter")?;
        let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_sampler(opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(rate))
            .with_resource(
                opentelemetry_sdk::Resource::builder_empty()
                    .with_attributes([opentelemetry::KeyValue::new("service.name", service_name)])
                    .build(),
            )
            .with_batch_exporter(exporter)
            .build();
        let tracer = tracer_provider.tracer("tapvault-server");
        opentelemetry::global::set_tracer_provider(tracer_provider);

        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(LevelFilter::INFO))
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    Ok(())
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host interface to bind (default: localhost).
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Table holding account state.
    #[arg(long, default_value = USERS_TABLE)]
    users_table: String,

    /// Table receiving one audit entry per request.
    #[arg(long, default_value = ACTIONS_LOG_TABLE)]
    audit_table: String,

    /// Timeout for each call to the data service in milliseconds (must be > 0).
    #[arg(long, default_value_t = 10_000)]
    request_timeout_ms: u64,

    /// Attempts per conditional account update before giving up (must be > 0).
    #[arg(long, default_value_t = DEFAULT_CAS_MAX_ATTEMPTS)]
    cas_max_attempts: u32,

    /// Points exchanged for one unit of usdt (must be > 0).
    #[arg(long, default_value_t = DEFAULT_SWAP_POINTS_PER_USDT)]
    swap_points_per_usdt: f64,

    /// Max request body size in bytes (0 disables limit).
    #[arg(long)]
    http_body_limit_bytes: Option<usize>,

    /// HTTP rate limit per IP in requests per second (0 disables rate limiting).
    #[arg(long)]
    http_rate_limit_per_second: Option<u64>,

    /// HTTP rate limit burst size (0 disables rate limiting).
    #[arg(long)]
    http_rate_limit_burst: Option<u32>,
}

fn is_production() -> bool {
    matches!(
        std::env::var("NODE_ENV").as_deref(),
        Ok("production") | Ok("prod")
    )
}

/// Maps an optional arg value to Option: 0 => None, Some(v) => Some(v), None => default
fn map_optional_limit<T: Copy + PartialEq + From<u8>>(
    arg: Option<T>,
    default: Option<T>,
) -> Option<T> {
    match arg {
        Some(v) if v == T::from(0) => None,
        Some(v) => Some(v),
        None => default,
    }
}

fn build_config(args: &Args, metrics_auth_token: Option<String>) -> Result<ServerConfig> {
    if args.cas_max_attempts == 0 {
        anyhow::bail!("cas_max_attempts must be > 0");
    }
    if !(args.swap_points_per_usdt.is_finite() && args.swap_points_per_usdt > 0.0) {
        anyhow::bail!("swap_points_per_usdt must be a positive number");
    }
    if args.users_table.trim().is_empty() {
        anyhow::bail!("users_table must not be empty");
    }
    let defaults = ServerConfig::default();
    Ok(ServerConfig {
        users_table: args.users_table.clone(),
        cas_max_attempts: args.cas_max_attempts,
        swap_points_per_usdt: args.swap_points_per_usdt,
        http_body_limit_bytes: map_optional_limit(
            args.http_body_limit_bytes,
            Some(DEFAULT_HTTP_BODY_LIMIT_BYTES),
        ),
        http_rate_limit_per_second: map_optional_limit(
            args.http_rate_limit_per_second,
            defaults.http_rate_limit_per_second,
        ),
        http_rate_limit_burst: map_optional_limit(
            args.http_rate_limit_burst,
            defaults.http_rate_limit_burst,
        ),
        metrics_auth_token,
    })
}

fn build_gateway_config(args: &Args, base_url: String, api_key: String) -> Result<GatewayConfig> {
    if args.request_timeout_ms == 0 {
        anyhow::bail!("request_timeout_ms must be > 0");
    }
    if args.audit_table.trim().is_empty() {
        anyhow::bail!("audit_table must not be empty");
    }
    Ok(GatewayConfig {
        request_timeout: Duration::from_millis(args.request_timeout_ms),
        audit_table: args.audit_table.clone(),
        ..GatewayConfig::new(base_url, api_key)
    })
}

fn require_env(var: &str) -> Result<String> {
    let value = std::env::var(var).unwrap_or_default();
    if value.trim().is_empty() {
        anyhow::bail!("Missing required env: {var}");
    }
    Ok(value)
}

fn optional_env(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .and_then(|value| (!value.trim().is_empty()).then_some(value))
}

fn ensure_production_config(config: &ServerConfig) -> Result<()> {
    if !is_production() {
        return Ok(());
    }
    if config.metrics_auth_token.is_none() {
        anyhow::bail!("Missing required env: METRICS_AUTH_TOKEN");
    }
    if config.http_rate_limit_per_second.is_none() || config.http_rate_limit_burst.is_none() {
        anyhow::bail!("rate limiting must be configured in production");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse args
    let args = Args::parse();

    // Create logger
    init_tracing()?;

    let config = build_config(&args, optional_env("METRICS_AUTH_TOKEN"))?;
    ensure_production_config(&config)?;

    let gateway_config = build_gateway_config(
        &args,
        require_env("SUPABASE_URL")?,
        require_env("SUPABASE_KEY")?,
    )?;
    let gateway = Gateway::new(gateway_config).context("failed to build data service gateway")?;
    info!(
        users_table = %config.users_table,
        audit_table = %gateway.audit_table(),
        cas_max_attempts = config.cas_max_attempts,
        "gateway configured"
    );

    let dispatcher = Arc::new(Dispatcher::new(gateway, config));
    let app = Api::new(dispatcher).router();

    // Start server
    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("axum server error")?;

    Ok(())
}
