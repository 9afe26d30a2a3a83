//! In-process stand-in for the hosted REST data service.
//!
//! Understands the slice of the filter grammar the gateway emits (`eq`, `gt`,
//! `is.null`, `select`) and honours `Prefer: return=minimal`. Each request is
//! evaluated under one lock, so filtered `PATCH`es behave like the service's
//! single-statement updates. Like the real service, selecting a column no
//! stored row has is a 400.
//!
//! Test-only: setup helpers panic on misuse (non-object rows, a poisoned
//! lock, no local port to bind) instead of returning errors.

use axum::{
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

/// What the mock saw for one request.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub table: String,
    pub query: Option<String>,
    pub prefer: Option<String>,
    pub api_key: Option<String>,
    pub authorization: Option<String>,
    pub body: Option<Value>,
}

#[derive(Default)]
struct Tables {
    rows: HashMap<String, Vec<Map<String, Value>>>,
    failing: HashSet<String>,
    stale_patches: HashMap<String, usize>,
    requests: Vec<RecordedRequest>,
}

#[derive(Clone)]
pub struct MockRest {
    api_key: String,
    state: Arc<Mutex<Tables>>,
}

/// Running mock; the server task stops when this is dropped.
pub struct MockServer {
    pub base_url: String,
    handle: JoinHandle<()>,
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

enum Condition {
    Eq(String, String),
    Gt(String, f64),
    IsNull(String),
}

impl Condition {
    fn matches(&self, row: &Map<String, Value>) -> bool {
        match self {
            Condition::Eq(column, operand) => row
                .get(column)
                .is_some_and(|value| value_matches(value, operand)),
            Condition::Gt(column, floor) => row
                .get(column)
                .and_then(Value::as_f64)
                .is_some_and(|value| value > *floor),
            Condition::IsNull(column) => row.get(column).map_or(true, Value::is_null),
        }
    }
}

fn value_matches(value: &Value, operand: &str) -> bool {
    match value {
        Value::String(text) => text == operand,
        Value::Number(number) => match (number.as_f64(), operand.parse::<f64>()) {
            (Some(left), Ok(right)) => left == right,
            _ => number.to_string() == operand,
        },
        Value::Bool(flag) => flag.to_string() == operand,
        Value::Null => operand == "null",
        _ => false,
    }
}

struct Query {
    select: Option<Vec<String>>,
    conditions: Vec<Condition>,
}

impl Query {
    fn parse(raw: Option<&str>) -> Result<Self, String> {
        let mut select = None;
        let mut conditions = Vec::new();
        for (key, value) in url::form_urlencoded::parse(raw.unwrap_or_default().as_bytes()) {
            if key == "select" {
                select = Some(value.split(',').map(str::to_string).collect());
                continue;
            }
            let (op, operand) = value
                .split_once('.')
                .ok_or_else(|| format!("malformed filter on {key}"))?;
            let condition = match op {
                "eq" => Condition::Eq(key.to_string(), operand.to_string()),
                "gt" => Condition::Gt(
                    key.to_string(),
                    operand
                        .parse()
                        .map_err(|_| format!("non-numeric gt operand on {key}"))?,
                ),
                "is" if operand == "null" => Condition::IsNull(key.to_string()),
                other => return Err(format!("unsupported operator {other}")),
            };
            conditions.push(condition);
        }
        Ok(Self { select, conditions })
    }

    fn matches(&self, row: &Map<String, Value>) -> bool {
        self.conditions.iter().all(|condition| condition.matches(row))
    }

    /// First selected column that no row of a non-empty table carries.
    fn unknown_column<'a>(&'a self, rows: &[Map<String, Value>]) -> Option<&'a str> {
        if rows.is_empty() {
            return None;
        }
        self.select
            .iter()
            .flatten()
            .filter(|column| column.as_str() != "*")
            .find(|column| rows.iter().all(|row| !row.contains_key(column.as_str())))
            .map(String::as_str)
    }

    fn project(&self, row: &Map<String, Value>) -> Value {
        match &self.select {
            Some(columns) if !columns.iter().any(|column| column == "*") => Value::Object(
                columns
                    .iter()
                    .filter_map(|column| row.get(column).map(|value| (column.clone(), value.clone())))
                    .collect(),
            ),
            _ => Value::Object(row.clone()),
        }
    }
}

fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "message": message }))).into_response()
}

impl MockRest {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            state: Arc::new(Mutex::new(Tables::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.state.lock().expect("mock state poisoned")
    }

    /// Seed a row. `row` must be a JSON object.
    pub fn insert_row(&self, table: &str, row: Value) {
        let Value::Object(row) = row else {
            panic!("mock rows must be objects");
        };
        self.lock()
            .rows
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.lock()
            .rows
            .get(table)
            .map(|rows| rows.iter().cloned().map(Value::Object).collect())
            .unwrap_or_default()
    }

    /// Make every request against `table` fail with a 500.
    pub fn fail_table(&self, table: &str) {
        self.lock().failing.insert(table.to_string());
    }

    /// Make the next `count` `PATCH`es against `table` match no rows, as if
    /// another writer changed them between read and write.
    pub fn stale_patches(&self, table: &str, count: usize) {
        self.lock()
            .stale_patches
            .insert(table.to_string(), count);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/rest/v1/:table", any(handle))
            .with_state(self.clone())
    }

    /// Bind to an ephemeral local port and serve until the returned handle
    /// is dropped.
    pub async fn serve(&self) -> MockServer {
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .expect("bind mock listener");
        let addr = listener.local_addr().expect("mock listener address");
        let router = self.router();
        let handle = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router).await {
                tracing::warn!("mock data service stopped: {err}");
            }
        });
        MockServer {
            base_url: format!("http://{addr}"),
            handle,
        }
    }
}

async fn handle(
    State(mock): State<MockRest>,
    method: Method,
    Path(table): Path<String>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(value) => Some(value),
            Err(_) => return error_response(StatusCode::BAD_REQUEST, "Invalid JSON body"),
        }
    };
    let prefer = header_text(&headers, "prefer");
    let api_key = header_text(&headers, "apikey");
    let authorization = header_text(&headers, header::AUTHORIZATION.as_str());

    let mut state = mock.lock();
    state.requests.push(RecordedRequest {
        method: method.to_string(),
        table: table.clone(),
        query: raw_query.clone(),
        prefer: prefer.clone(),
        api_key: api_key.clone(),
        authorization: authorization.clone(),
        body: body.clone(),
    });

    let expected_bearer = format!("Bearer {}", mock.api_key);
    if api_key.as_deref() != Some(mock.api_key.as_str())
        || authorization.as_deref() != Some(expected_bearer.as_str())
    {
        return error_response(StatusCode::UNAUTHORIZED, "Invalid API key");
    }
    if state.failing.contains(&table) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "simulated failure");
    }
    let query = match Query::parse(raw_query.as_deref()) {
        Ok(query) => query,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
    };
    let minimal = prefer.as_deref() == Some("return=minimal");

    match method {
        Method::GET => {
            let stored = state.rows.get(&table).map(Vec::as_slice).unwrap_or_default();
            if let Some(column) = query.unknown_column(stored) {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("column {table}.{column} does not exist"),
                );
            }
            let rows = stored
                .iter()
                .filter(|row| query.matches(row))
                .map(|row| query.project(row))
                .collect::<Vec<_>>();
            Json(Value::Array(rows)).into_response()
        }
        Method::POST => {
            let records = match body {
                Some(Value::Object(record)) => vec![record],
                Some(Value::Array(records)) => {
                    let mut objects = Vec::with_capacity(records.len());
                    for record in records {
                        match record {
                            Value::Object(record) => objects.push(record),
                            _ => {
                                return error_response(StatusCode::BAD_REQUEST, "rows must be objects")
                            }
                        }
                    }
                    objects
                }
                _ => return error_response(StatusCode::BAD_REQUEST, "missing body"),
            };
            let inserted = records.iter().cloned().map(Value::Object).collect::<Vec<_>>();
            state.rows.entry(table).or_default().extend(records);
            if minimal {
                StatusCode::CREATED.into_response()
            } else {
                (StatusCode::CREATED, Json(Value::Array(inserted))).into_response()
            }
        }
        Method::PATCH => {
            let Some(Value::Object(patch)) = body else {
                return error_response(StatusCode::BAD_REQUEST, "missing body");
            };
            let mut updated = Vec::new();
            let stale = match state.stale_patches.get_mut(&table) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            };
            if let Some(rows) = state.rows.get_mut(&table).filter(|_| !stale) {
                for row in rows.iter_mut().filter(|row| query.matches(row)) {
                    for (column, value) in &patch {
                        row.insert(column.clone(), value.clone());
                    }
                    updated.push(Value::Object(row.clone()));
                }
            }
            if minimal {
                StatusCode::NO_CONTENT.into_response()
            } else {
                Json(Value::Array(updated)).into_response()
            }
        }
        _ => error_response(StatusCode::METHOD_NOT_ALLOWED, "unsupported method"),
    }
}
