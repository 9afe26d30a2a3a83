use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tapvault_gateway::Gateway;
use tapvault_types::{Action, ActionLogEntry, USERS_TABLE};

mod api;
pub use api::Api;

mod actions;
use actions::ActionSettings;
mod error;
pub use error::ActionError;
mod ledger;
pub use ledger::Ledger;
mod metrics;
pub use metrics::{ActionMetrics, ActionMetricsSnapshot};
mod request;
pub use request::ActionRequest;


pub const DEFAULT_CAS_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_SWAP_POINTS_PER_USDT: f64 = 1_000.0;
pub const DEFAULT_HTTP_BODY_LIMIT_BYTES: usize = 64 * 1024;

#[derive(Clone, Debug, Serialize)]
pub struct ServerConfig {
    pub users_table: String,
    /// Attempts per conditional update before reporting a conflict.
    pub cas_max_attempts: u32,
    /// Points spent per unit of usdt credited by `executeSwap`.
    pub swap_points_per_usdt: f64,
    pub http_body_limit_bytes: Option<usize>,
    pub http_rate_limit_per_second: Option<u64>,
    pub http_rate_limit_burst: Option<u32>,
    #[serde(skip)]
    pub metrics_auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            users_table: USERS_TABLE.to_string(),
            cas_max_attempts: DEFAULT_CAS_MAX_ATTEMPTS,
            swap_points_per_usdt: DEFAULT_SWAP_POINTS_PER_USDT,
            http_body_limit_bytes: Some(DEFAULT_HTTP_BODY_LIMIT_BYTES),
            http_rate_limit_per_second: None,
            http_rate_limit_burst: None,
            metrics_auth_token: None,
        }
    }
}

/// Result of a successful action, before it is wrapped in the response
/// envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct ActionOutcome {
    pub action: String,
    pub payload: Map<String, Value>,
}

impl ActionOutcome {
    /// `{ok: true, action, ...payload}`.
    pub fn into_envelope(self) -> Value {
        let mut envelope = Map::new();
        envelope.insert("ok".to_string(), Value::Bool(true));
        envelope.insert("action".to_string(), Value::String(self.action));
        envelope.extend(self.payload);
        Value::Object(envelope)
    }
}

/// Handles one action request end to end.
pub struct Dispatcher {
    gateway: Gateway,
    ledger: Ledger,
    config: ServerConfig,
    metrics: Arc<ActionMetrics>,
}

impl Dispatcher {
    pub fn new(gateway: Gateway, config: ServerConfig) -> Self {
        let ledger = Ledger::new(
            gateway.clone(),
            config.users_table.clone(),
            config.cas_max_attempts,
        );
        Self {
            gateway,
            ledger,
            config,
            metrics: Arc::new(ActionMetrics::default()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ActionMetrics {
        &self.metrics
    }

    /// Parse, audit and perform the action in `body`.
    pub async fn handle(&self, body: &[u8]) -> Result<ActionOutcome, ActionError> {
        self.metrics.inc_request();
        let result = self.dispatch(body).await;
        if let Err(err) = &result {
            if err.status().is_server_error() {
                self.metrics.inc_failed();
            } else {
                self.metrics.inc_rejected();
            }
            if matches!(err, ActionError::Conflict) {
                self.metrics.inc_conflict();
            }
        }
        result
    }

    async fn dispatch(&self, body: &[u8]) -> Result<ActionOutcome, ActionError> {
        let request = ActionRequest::parse(body)?;
        self.spawn_audit(&request);

        let action: Action = request.action.parse()?;
        let settings = ActionSettings {
            swap_points_per_usdt: self.config.swap_points_per_usdt,
        };
        let result = actions::run(
            &self.ledger,
            settings,
            action,
            &request.user_id,
            &request.data,
        )
        .await;
        self.metrics.record_action(action, result.is_ok());
        Ok(ActionOutcome {
            action: request.action,
            payload: result?,
        })
    }

    /// Write the audit entry on a detached task. Failures only reach the
    /// logs and metrics.
    fn spawn_audit(&self, request: &ActionRequest) {
        let gateway = self.gateway.clone();
        let metrics = Arc::clone(&self.metrics);
        let entry = ActionLogEntry {
            action: request.action.clone(),
            user_id: request.user_id.clone(),
            payload: request.body.clone(),
        };
        tokio::spawn(async move {
            if let Err(err) = gateway.insert(gateway.audit_table(), &entry).await {
                metrics.inc_audit_failure();
                tracing::warn!(
                    action = %entry.action,
                    user_id = %entry.user_id,
                    "audit log write failed: {err}"
                );
            }
        });
    }
}
