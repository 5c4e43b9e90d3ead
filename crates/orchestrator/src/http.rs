use std::path::Path;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Query, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::api::{
    ErrorBody, ListResponse, StatsResponse, SubmitRequest, SubmitResponse,
};
use serde::Deserialize;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::allocator::PortAllocationError;
use crate::error::OrchestratorError;
use crate::source::DeploymentSource;
use crate::state::Orchestrator;
use crate::telemetry;

pub type AppState = Arc<Orchestrator>;

/// Uploads beyond this are rejected before they touch disk.
const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

const DEFAULT_OWNER: &str = "anonymous";

/// Error shape every handler returns; serialized as [`ErrorBody`].
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        error!(error = %err, "internal error");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error",
            message: "internal server error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            code: self.code.to_string(),
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let code = err.code();
        let status = match &err {
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::IllegalTransition { .. } => StatusCode::CONFLICT,
            OrchestratorError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::Runtime(runtime_err) if runtime_err.is_not_found() => {
                StatusCode::NOT_FOUND
            }
            OrchestratorError::PortAllocation(PortAllocationError::Exhausted { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err.detail(), "internal error");
            "internal server error".to_string()
        } else {
            err.detail()
        };
        Self {
            status,
            code,
            message,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/deployments", post(submit_deployment).get(list_deployments))
        .route(
            "/deployments/{id}",
            get(get_deployment).delete(delete_deployment),
        )
        .route("/deployments/{id}/stats", get(deployment_stats))
        .route("/deployments/{id}/approve", post(approve_deployment))
        .route("/deployments/{id}/reject", post(reject_deployment))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the API server and run it until the shutdown flag flips.
pub async fn serve(state: AppState, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.cfg().http_host, state.cfg().http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %listener.local_addr()?, "api server listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Accepts either a JSON body naming a git repository or a multipart form
/// with an archive upload.
async fn submit_deployment(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    telemetry::record_api_request("POST", "/deployments");

    let is_multipart = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("multipart/form-data"));

    let (owner, source) = if is_multipart {
        let multipart = Multipart::from_request(req, &())
            .await
            .map_err(|err| ApiError::bad_request(err.to_string()))?;
        read_upload(&state, multipart).await?
    } else {
        let Json(body) = Json::<SubmitRequest>::from_request(req, &())
            .await
            .map_err(|err| ApiError::bad_request(err.to_string()))?;
        (
            body.owner.unwrap_or_else(|| DEFAULT_OWNER.to_string()),
            DeploymentSource::Repository {
                url: body.repository,
            },
        )
    };

    let record = state.submit(owner, source).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            deployment_id: record.id,
            status: record.status,
        }),
    ))
}

/// Pull the archive and owner out of a multipart submission and stage the
/// archive under the upload directory.
async fn read_upload(
    state: &AppState,
    mut multipart: Multipart,
) -> ApiResult<(String, DeploymentSource)> {
    let mut owner = None;
    let mut staged = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(err.to_string()))?
    {
        match field.name() {
            Some("owner") => {
                owner = Some(
                    field
                        .text()
                        .await
                        .map_err(|err| ApiError::bad_request(err.to_string()))?,
                );
            }
            Some("file") => {
                let file_name = field
                    .file_name()
                    .and_then(|name| Path::new(name).file_name())
                    .and_then(|name| name.to_str())
                    .unwrap_or("upload.tar.gz")
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| ApiError::bad_request(err.to_string()))?;
                if bytes.is_empty() {
                    return Err(ApiError::bad_request("uploaded file is empty"));
                }

                let upload_dir = Path::new(&state.cfg().upload_dir).to_path_buf();
                tokio::fs::create_dir_all(&upload_dir)
                    .await
                    .map_err(ApiError::internal)?;
                let archive_path = upload_dir.join(format!("{}-{file_name}", Uuid::new_v4()));
                tokio::fs::write(&archive_path, &bytes)
                    .await
                    .map_err(ApiError::internal)?;
                staged = Some(archive_path);
            }
            _ => {}
        }
    }

    let archive_path =
        staged.ok_or_else(|| ApiError::bad_request("multipart submission needs a `file` field"))?;
    Ok((
        owner.unwrap_or_else(|| DEFAULT_OWNER.to_string()),
        DeploymentSource::Upload { archive_path },
    ))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    owner: Option<String>,
}

async fn list_deployments(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<ListResponse>> {
    telemetry::record_api_request("GET", "/deployments");
    let records = state.list(params.owner.as_deref()).await?;
    let deployments: Vec<_> = records.iter().map(|record| state.to_view(record)).collect();
    let count = deployments.len();
    Ok(Json(ListResponse { deployments, count }))
}

async fn get_deployment(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<Uuid>,
) -> ApiResult<Json<common::api::DeploymentView>> {
    telemetry::record_api_request("GET", "/deployments/{id}");
    let record = state.get(id).await?;
    Ok(Json(state.to_view(&record)))
}

async fn deployment_stats(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<Uuid>,
) -> ApiResult<Json<StatsResponse>> {
    telemetry::record_api_request("GET", "/deployments/{id}/stats");
    let usage = state.stats(id).await?;
    Ok(Json(StatsResponse {
        cpu_percent: usage.cpu_percent,
        memory_bytes: usage.memory_bytes,
        network_rx_bytes: usage.network_rx_bytes,
        network_tx_bytes: usage.network_tx_bytes,
    }))
}

async fn approve_deployment(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<Uuid>,
) -> ApiResult<Json<common::api::DeploymentView>> {
    telemetry::record_api_request("POST", "/deployments/{id}/approve");
    let record = state.approve(id).await?;
    Ok(Json(state.to_view(&record)))
}

async fn reject_deployment(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<Uuid>,
) -> ApiResult<Json<common::api::DeploymentView>> {
    telemetry::record_api_request("POST", "/deployments/{id}/reject");
    let record = state.reject(id).await?;
    Ok(Json(state.to_view(&record)))
}

async fn delete_deployment(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<Uuid>,
) -> ApiResult<StatusCode> {
    telemetry::record_api_request("DELETE", "/deployments/{id}");
    state.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
