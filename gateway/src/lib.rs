//! Client for the hosted REST data service.
//!
//! Every read and write issued by tapvault goes through [`Gateway::call_table`],
//! which turns a `(table, method, body, filter)` tuple into one HTTP request
//! against `{base_url}/rest/v1/{table}` and normalizes the row-set it gets
//! back.

mod filter;
pub use filter::Filter;

#[cfg(any(test, feature = "mocks"))]
#[doc(hidden)]
pub mod mocks;

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::time::Duration;
use tapvault_types::ACTIONS_LOG_TABLE;
use thiserror::Error;

const REST_PREFIX: &str = "rest/v1";

/// Upper bound on a single upstream call unless configured otherwise.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Error type for gateway operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("missing configuration: {0}")]
    MissingConfig(&'static str),
    #[error("invalid table name")]
    InvalidTable,
    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed: {status}: {body}")]
    FailedWithBody {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("unexpected response")]
    UnexpectedResponse,
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Patch,
}

impl Method {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
        }
    }
}

/// Successful response from the data service.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    /// The service answered without a body (e.g. `return=minimal`).
    Empty,
    /// Parsed body after [`normalize_rows`].
    Json(Value),
}

impl Reply {
    /// Undo single-row unwrapping so callers that care about row counts can
    /// treat every reply as a row-set.
    pub fn into_rows(self) -> Vec<Value> {
        match self {
            Reply::Empty => Vec::new(),
            Reply::Json(Value::Array(rows)) => rows,
            Reply::Json(row) => vec![row],
        }
    }
}

/// The data service returns row-sets even for point queries. A set with
/// exactly one row collapses to that row; anything else passes through.
pub fn normalize_rows(value: Value) -> Value {
    match value {
        Value::Array(mut rows) if rows.len() == 1 => rows.remove(0),
        other => other,
    }
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: String,
    pub request_timeout: Duration,
    /// Inserts into this table skip reading the row back.
    pub audit_table: String,
}

impl GatewayConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            audit_table: ACTIONS_LOG_TABLE.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct Gateway {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    audit_table: String,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let base_url = config.base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(Error::MissingConfig("base_url"));
        }
        let api_key = config.api_key.trim().to_string();
        if api_key.is_empty() {
            return Err(Error::MissingConfig("api_key"));
        }
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_key,
            audit_table: config.audit_table,
        })
    }

    pub fn audit_table(&self) -> &str {
        &self.audit_table
    }

    fn table_url(&self, table: &str, filter: Option<&str>) -> String {
        match filter.filter(|filter| !filter.is_empty()) {
            Some(filter) => format!("{}/{REST_PREFIX}/{table}?{filter}", self.base_url),
            None => format!("{}/{REST_PREFIX}/{table}", self.base_url),
        }
    }

    fn prefer(&self, table: &str, method: Method) -> Option<&'static str> {
        match method {
            Method::Get => None,
            Method::Post if table == self.audit_table => Some("return=minimal"),
            Method::Post | Method::Patch => Some("return=representation"),
        }
    }

    /// Issue one request against `table`.
    pub async fn call_table(
        &self,
        table: &str,
        method: Method,
        body: Option<&Value>,
        filter: Option<&str>,
    ) -> Result<Reply> {
        if table.trim().is_empty() {
            return Err(Error::InvalidTable);
        }
        let url = self.table_url(table, filter);
        let mut request = self
            .http
            .request(method.as_reqwest(), &url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json");
        if let Some(prefer) = self.prefer(table, method) {
            request = request.header("Prefer", prefer);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        tracing::debug!(table, ?method, status = status.as_u16(), "data service call");
        if !status.is_success() {
            return Err(Error::FailedWithBody { status, body: text });
        }
        if text.trim().is_empty() {
            return Ok(Reply::Empty);
        }
        let value: Value = serde_json::from_str(&text)?;
        Ok(Reply::Json(normalize_rows(value)))
    }

    /// Fetch at most one row. More than one match is an error.
    pub async fn select_one<T: DeserializeOwned>(
        &self,
        table: &str,
        filter: &Filter,
    ) -> Result<Option<T>> {
        let filter = filter.to_string();
        match self
            .call_table(table, Method::Get, None, Some(&filter))
            .await?
        {
            Reply::Empty => Ok(None),
            Reply::Json(Value::Array(rows)) if rows.is_empty() => Ok(None),
            Reply::Json(Value::Array(_)) => Err(Error::UnexpectedResponse),
            Reply::Json(row) => Ok(Some(serde_json::from_value(row)?)),
        }
    }

    pub async fn insert<T: Serialize>(&self, table: &str, record: &T) -> Result<Reply> {
        let body = serde_json::to_value(record)?;
        self.call_table(table, Method::Post, Some(&body), None).await
    }

    /// Apply `patch` to every row matching `filter` and return the rows that
    /// were changed. An empty result means nothing matched.
    pub async fn update_where<T: Serialize>(
        &self,
        table: &str,
        patch: &T,
        filter: &Filter,
    ) -> Result<Vec<Value>> {
        let body = serde_json::to_value(patch)?;
        let filter = filter.to_string();
        let reply = self
            .call_table(table, Method::Patch, Some(&body), Some(&filter))
            .await?;
        Ok(reply.into_rows())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockRest;
    use serde_json::json;

    const KEY: &str = "service-key";

    fn gateway_for(base_url: &str) -> Gateway {
        Gateway::new(GatewayConfig::new(base_url, KEY)).unwrap()
    }

    #[test]
    fn normalize_unwraps_single_row_only() {
        assert_eq!(normalize_rows(json!([{"a": 1}])), json!({"a": 1}));
        assert_eq!(normalize_rows(json!([])), json!([]));
        assert_eq!(
            normalize_rows(json!([{"a": 1}, {"a": 2}])),
            json!([{"a": 1}, {"a": 2}])
        );
        assert_eq!(normalize_rows(json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn rejects_missing_secrets() {
        let err = Gateway::new(GatewayConfig::new("", KEY)).err().unwrap();
        assert!(matches!(err, Error::MissingConfig("base_url")));
        let err = Gateway::new(GatewayConfig::new("http://db", "  ")).err().unwrap();
        assert!(matches!(err, Error::MissingConfig("api_key")));
    }

    #[test]
    fn builds_table_urls() {
        let gateway = gateway_for("https://db.example.com/");
        assert_eq!(
            gateway.table_url("users", Some("id=eq.1")),
            "https://db.example.com/rest/v1/users?id=eq.1"
        );
        assert_eq!(
            gateway.table_url("users", Some("")),
            "https://db.example.com/rest/v1/users"
        );
        assert_eq!(
            gateway.table_url("users", None),
            "https://db.example.com/rest/v1/users"
        );
    }

    #[test]
    fn prefer_depends_on_table_and_method() {
        let gateway = gateway_for("https://db.example.com");
        assert_eq!(gateway.prefer("users", Method::Get), None);
        assert_eq!(
            gateway.prefer(ACTIONS_LOG_TABLE, Method::Post),
            Some("return=minimal")
        );
        assert_eq!(
            gateway.prefer("users", Method::Post),
            Some("return=representation")
        );
        assert_eq!(
            gateway.prefer("users", Method::Patch),
            Some("return=representation")
        );
    }

    #[tokio::test]
    async fn empty_table_is_rejected_without_a_request() {
        let mock = MockRest::new(KEY);
        let server = mock.serve().await;
        let gateway = gateway_for(&server.base_url);

        let err = gateway
            .call_table(" ", Method::Get, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTable));
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn single_row_reads_are_unwrapped() {
        let mock = MockRest::new(KEY);
        mock.insert_row("users", json!({"id": "1", "points": 10}));
        mock.insert_row("users", json!({"id": "2", "points": 20}));
        let server = mock.serve().await;
        let gateway = gateway_for(&server.base_url);

        let reply = gateway
            .call_table("users", Method::Get, None, Some("id=eq.1"))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Json(json!({"id": "1", "points": 10})));

        let reply = gateway
            .call_table("users", Method::Get, None, None)
            .await
            .unwrap();
        assert_eq!(reply.into_rows().len(), 2);

        let reply = gateway
            .call_table("users", Method::Get, None, Some("id=eq.3"))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Json(json!([])));

        let request = &mock.requests()[0];
        assert_eq!(request.api_key.as_deref(), Some(KEY));
        assert_eq!(request.authorization.as_deref(), Some("Bearer service-key"));
        assert_eq!(request.prefer, None);
    }

    #[tokio::test]
    async fn audit_inserts_return_nothing() {
        let mock = MockRest::new(KEY);
        let server = mock.serve().await;
        let gateway = gateway_for(&server.base_url);

        let reply = gateway
            .insert(
                ACTIONS_LOG_TABLE,
                &json!({"action": "spin", "user_id": "1", "payload": {}}),
            )
            .await
            .unwrap();
        assert_eq!(reply, Reply::Empty);
        assert_eq!(mock.rows(ACTIONS_LOG_TABLE).len(), 1);
        assert_eq!(
            mock.requests()[0].prefer.as_deref(),
            Some("return=minimal")
        );
    }

    #[tokio::test]
    async fn conditional_update_reports_touched_rows() {
        let mock = MockRest::new(KEY);
        mock.insert_row("users", json!({"id": "1", "ads_left": 0, "points": 3}));
        let server = mock.serve().await;
        let gateway = gateway_for(&server.base_url);

        let guard = Filter::new().eq("id", "1").gt("ads_left", 0);
        let rows = gateway
            .update_where("users", &json!({"ads_left": -1}), &guard)
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert_eq!(mock.rows("users")[0]["ads_left"], json!(0));

        let guard = Filter::new().eq("id", "1").eq("points", 3);
        let rows = gateway
            .update_where("users", &json!({"points": 8}), &guard)
            .await
            .unwrap();
        assert_eq!(rows, vec![json!({"id": "1", "ads_left": 0, "points": 8})]);
        assert_eq!(
            mock.requests()[1].prefer.as_deref(),
            Some("return=representation")
        );
    }

    #[tokio::test]
    async fn non_success_status_carries_body() {
        let mock = MockRest::new(KEY);
        let server = mock.serve().await;
        let gateway = Gateway::new(GatewayConfig::new(&server.base_url, "wrong")).unwrap();

        let err = gateway
            .call_table("users", Method::Get, None, None)
            .await
            .unwrap_err();
        match err {
            Error::FailedWithBody { status, body } => {
                assert_eq!(status.as_u16(), 401);
                assert!(body.contains("Invalid API key"), "body: {body}");
            }
            other => panic!("unexpected error: {other}"),
        }

        mock.fail_table("users");
        let gateway = gateway_for(&server.base_url);
        let err = gateway
            .call_table("users", Method::Get, None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("failed: 500"), "{err}");
    }

    #[tokio::test]
    async fn projections_must_name_existing_columns() {
        let mock = MockRest::new(KEY);
        mock.insert_row("users", json!({"id": "1", "points": 4}));
        let server = mock.serve().await;
        let gateway = gateway_for(&server.base_url);

        let err = gateway
            .select_one::<Value>("users", &Filter::new().select("points,games_played").eq("id", "1"))
            .await
            .unwrap_err();
        match err {
            Error::FailedWithBody { status, body } => {
                assert_eq!(status.as_u16(), 400);
                assert!(body.contains("users.games_played"), "body: {body}");
            }
            other => panic!("unexpected error: {other}"),
        }

        let row: Option<Value> = gateway
            .select_one("users", &Filter::new().select("*").eq("id", "1"))
            .await
            .unwrap();
        assert_eq!(row, Some(json!({"id": "1", "points": 4})));
    }

    #[tokio::test]
    async fn select_one_rejects_ambiguous_matches() {
        let mock = MockRest::new(KEY);
        mock.insert_row("users", json!({"id": "1", "points": 1}));
        mock.insert_row("users", json!({"id": "1", "points": 2}));
        let server = mock.serve().await;
        let gateway = gateway_for(&server.base_url);

        let result: Result<Option<Value>> = gateway
            .select_one("users", &Filter::new().eq("id", "1"))
            .await;
        assert!(matches!(result, Err(Error::UnexpectedResponse)));

        let missing: Option<Value> = gateway
            .select_one("users", &Filter::new().eq("id", "9"))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn transport_failures_surface_as_reqwest_errors() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let gateway = gateway_for(&format!("http://{addr}"));
        let err = gateway
            .call_table("users", Method::Get, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Reqwest(_)), "{err}");
    }
}
