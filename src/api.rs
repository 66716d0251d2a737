//! HTTP/JSON surface.
//!
//! Routes: health, database listing and lifecycle, and the per-database
//! query/execute endpoints. Errors render as problem-style `{title, detail}`
//! bodies with the status mapping of the service error taxonomy.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::error::Error;
use crate::executor::{Change, Executor};
use crate::registry::{RecordSnapshot, Registry};
use crate::stage::StageManager;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub manager: Arc<StageManager>,
    pub executor: Arc<Executor>,
    pub server: ServerConfig,
}

pub fn router(state: AppState) -> Router {
    let timeout = state.server.read_timeout;
    Router::new()
        .route("/health", get(health))
        .route("/databases", get(list_databases).post(create_database))
        .route("/databases/{name}", delete(delete_database))
        .route("/databases/{name}/query", post(query_database))
        .route("/databases/{name}/execute", post(execute_database))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(timeout))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: String,
}

#[derive(Debug, Serialize)]
struct DatabaseSummary {
    name: String,
    stage: u8,
    last_accessed_at: String,
    request_count: u64,
}

impl From<RecordSnapshot> for DatabaseSummary {
    fn from(snapshot: RecordSnapshot) -> Self {
        Self {
            name: snapshot.name,
            stage: snapshot.stage,
            last_accessed_at: snapshot
                .last_accessed_at
                .format(&Rfc3339)
                .unwrap_or_default(),
            request_count: snapshot.request_count,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
struct StatementsRequest {
    queries: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ResultsResponse {
    results: Vec<SlotResponse>,
}

#[derive(Debug, Serialize)]
struct SlotResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl SlotResponse {
    fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

#[derive(Debug, Serialize)]
struct ExecuteData {
    #[serde(rename = "RowsAffected")]
    rows_affected: u64,
    #[serde(rename = "LastInsertID")]
    last_insert_id: i64,
}

impl From<Change> for ExecuteData {
    fn from(change: Change) -> Self {
        Self {
            rows_affected: change.rows_affected,
            last_insert_id: change.last_insert_id,
        }
    }
}

#[derive(Debug, Serialize)]
struct Problem {
    title: String,
    detail: String,
}

impl Error {
    fn status(&self) -> StatusCode {
        match self {
            Error::DatabaseNotFound { .. } => StatusCode::NOT_FOUND,
            Error::DatabaseExists { .. } => StatusCode::CONFLICT,
            Error::InvalidName { .. }
            | Error::StageOutOfRange { .. }
            | Error::ActiveStage { .. }
            | Error::InvalidStatementCount { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let problem = Problem {
            title: status
                .canonical_reason()
                .unwrap_or("Internal Server Error")
                .to_string(),
            detail: self.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(error = %problem.detail, "request failed");
        }
        (status, Json(problem)).into_response()
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: state.server.version.clone(),
    })
}

async fn list_databases(State(state): State<AppState>) -> Json<Vec<DatabaseSummary>> {
    let snapshots = state.registry.list().await;
    Json(snapshots.into_iter().map(DatabaseSummary::from).collect())
}

async fn create_database(
    State(state): State<AppState>,
    Json(request): Json<CreateRequest>,
) -> Result<(StatusCode, Json<DatabaseSummary>), Error> {
    let stage = state.manager.settings().default_creation_stage;
    let record = state.registry.create(&request.name, stage).await?;
    let snapshot = {
        let record_state = record.read().await;
        RecordSnapshot {
            name: record.name().to_string(),
            stage: record_state.stage,
            last_accessed_at: record_state.last_accessed_at,
            request_count: record_state.request_count,
        }
    };
    Ok((StatusCode::CREATED, Json(snapshot.into())))
}

async fn delete_database(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, Error> {
    let record = state
        .registry
        .find_by_name(&name)
        .await
        .ok_or_else(|| Error::DatabaseNotFound { name: name.clone() })?;
    state.registry.delete(&state.manager, &record).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn query_database(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<StatementsRequest>,
) -> Result<Json<ResultsResponse>, Error> {
    let results = state.executor.query(&name, request.queries).await?;
    Ok(Json(ResultsResponse {
        results: results
            .into_iter()
            .map(|slot| match slot {
                Ok(rows) => SlotResponse::ok(Value::Array(
                    rows.into_iter().map(Value::Object).collect(),
                )),
                Err(message) => SlotResponse::err(message),
            })
            .collect(),
    }))
}

async fn execute_database(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<StatementsRequest>,
) -> Result<Json<ResultsResponse>, Error> {
    let results = state.executor.execute(&name, request.queries).await?;
    Ok(Json(ResultsResponse {
        results: results
            .into_iter()
            .map(|slot| match slot {
                Ok(change) => match serde_json::to_value(ExecuteData::from(change)) {
                    Ok(data) => SlotResponse::ok(data),
                    Err(err) => SlotResponse::err(err.to_string()),
                },
                Err(message) => SlotResponse::err(message),
            })
            .collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_status_mapping() {
        assert_eq!(
            Error::DatabaseNotFound { name: "x".into() }.status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::DatabaseExists { name: "x".into() }.status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::InvalidStatementCount { count: 0, max: 16 }.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Config { detail: "x".into() }.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn execute_data_uses_wire_field_names() {
        let data = ExecuteData {
            rows_affected: 3,
            last_insert_id: 9,
        };
        assert_eq!(
            serde_json::to_value(data).unwrap(),
            serde_json::json!({"RowsAffected": 3, "LastInsertID": 9})
        );
    }

    #[test]
    fn slot_response_omits_absent_fields() {
        let ok = serde_json::to_value(SlotResponse::ok(Value::Array(vec![]))).unwrap();
        assert_eq!(ok, serde_json::json!({"success": true, "data": []}));

        let err = serde_json::to_value(SlotResponse::err("boom".into())).unwrap();
        assert_eq!(err, serde_json::json!({"success": false, "error": "boom"}));
    }
}
