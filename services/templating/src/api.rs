use crate::config::ApiConfig;
use crate::object_store::{ObjectStore, StorageError};
use crate::processor::{
    ProcessError, RenderRequest, TemplateProcessor, PROCESSED_ARCHIVE_NAME, PROJECT_NOT_FOUND,
};
use crate::project_registry::{Project, ProjectRegistry, RegistryError};
use crate::upload::{self, TemplateUpload, USER_NOT_FOUND};
use anyhow::{Context, Result};
use axum::{
    body::{Body, Bytes},
    extract::{
        multipart::{Multipart, MultipartError, MultipartRejection},
        rejection::{BytesRejection, PathRejection, QueryRejection},
        DefaultBodyLimit, Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Header carrying the caller's email, set by the authenticating proxy
pub const USER_EMAIL_HEADER: &str = "x-user-email";

const NOT_AUTHENTICATED: &str = "Authentication credentials were not provided";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<TemplateProcessor>,
    pub projects: Arc<dyn ProjectRegistry>,
    pub objects: Arc<dyn ObjectStore>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Project summary in the template listing
#[derive(Debug, Serialize)]
pub struct ProjectSummary {
    pub project_id: i64,
    pub project_name: String,
    pub description: String,
    pub project_type: String,
    pub status: String,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
}

impl From<Project> for ProjectSummary {
    fn from(p: Project) -> Self {
        Self {
            project_id: p.id,
            project_name: p.project_name,
            description: p.description,
            project_type: p.project_type,
            status: p.status,
            file_name: p.file_name,
            created_at: p.created_at,
        }
    }
}

/// Project entry in a user's project list
#[derive(Debug, Serialize)]
pub struct UserProject {
    pub project_name: String,
    pub description: String,
    pub project_type: String,
    pub status: String,
    pub file_name: String,
    pub file_id: i64,
    pub created_at: DateTime<Utc>,
}

impl From<Project> for UserProject {
    fn from(p: Project) -> Self {
        Self {
            project_name: p.project_name,
            description: p.description,
            project_type: p.project_type,
            status: p.status,
            file_name: p.file_name,
            file_id: p.id,
            created_at: p.created_at,
        }
    }
}

/// Response to a successful upload
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub project_id: i64,
    pub download_url: String,
}

/// Query parameters for template processing
#[derive(Debug, Deserialize)]
pub struct ProcessTemplateQuery {
    pub project_id: Option<String>,
}

impl ProcessError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProcessError::BadRequest(_) | ProcessError::InvalidArchiveOrContext(_) => {
                StatusCode::BAD_REQUEST
            }
            ProcessError::NotFound(_) => StatusCode::NOT_FOUND,
            ProcessError::RenderTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProcessError::StorageUnavailable(_)
            | ProcessError::RenderFailure(_)
            | ProcessError::StreamingFailure(_)
            | ProcessError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Handler error, always rendered as `{"error": ...}`.
///
/// Covers pipeline failures as well as requests axum rejects before a
/// handler runs (oversized bodies, malformed paths or multipart data).
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<ProcessError> for ApiError {
    fn from(e: ProcessError) -> Self {
        Self::new(e.status_code(), e.to_string())
    }
}

macro_rules! impl_from_rejection {
    ($($rejection:ty),+ $(,)?) => {
        $(
            impl From<$rejection> for ApiError {
                fn from(rejection: $rejection) -> Self {
                    Self::new(rejection.status(), rejection.body_text())
                }
            }
        )+
    };
}

impl_from_rejection!(
    BytesRejection,
    PathRejection,
    QueryRejection,
    MultipartRejection,
    MultipartError,
);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/process-template/", post(process_template))
        .route(
            "/upload-template/",
            post(upload_template).layer(DefaultBodyLimit::max(config.max_upload_bytes)),
        )
        .route("/download-template/:project_id", get(download_template))
        .route("/template-json/:project_id", get(template_json))
        .route("/templates", get(list_templates))
        .route("/user-projects/:email", get(user_projects))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "templating-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.projects.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Render a project's template against the JSON body and stream the result
#[instrument(skip_all)]
async fn process_template(
    State(state): State<AppState>,
    query: Result<Query<ProcessTemplateQuery>, QueryRejection>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = query?;
    let body = body?;
    let request = RenderRequest::from_parts(params.project_id.as_deref(), &body)?;
    let processed = state.processor.process(request).await?;

    info!(
        request_id = %processed.request_id,
        project_id = processed.project_id,
        entries = processed.entry_count,
        "Streaming processed template"
    );

    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", PROCESSED_ARCHIVE_NAME),
            ),
        ],
        Body::from_stream(processed.stream),
    )
        .into_response())
}

async fn find_project(state: &AppState, project_id: i64) -> Result<Project, ProcessError> {
    state
        .projects
        .get_by_id(project_id)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to get project");
            ProcessError::StorageUnavailable(e.to_string())
        })?
        .ok_or_else(|| ProcessError::NotFound(PROJECT_NOT_FOUND.to_string()))
}

async fn fetch_object(state: &AppState, key: &str) -> Result<Bytes, ProcessError> {
    state.objects.get(key).await.map_err(|e| match e {
        StorageError::NotFound(_) => ProcessError::NotFound("File not found".to_string()),
        StorageError::Backend(_) => {
            error!(error = %e, key = %key, "Failed to fetch object");
            ProcessError::StorageUnavailable(e.to_string())
        }
    })
}

/// Create a project from a multipart upload and store its archive and context
#[instrument(skip_all)]
async fn upload_template(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, ApiError> {
    let owner = headers
        .get(USER_EMAIL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, NOT_AUTHENTICATED))?
        .to_string();

    let mut multipart = multipart?;
    let mut upload = TemplateUpload::default();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                upload.file_name = field.file_name().map(str::to_string);
                upload.archive = Some(field.bytes().await?);
            }
            "json_file" => upload.context = Some(field.bytes().await?),
            "project_name" => upload.project_name = Some(field.text().await?),
            "description" => upload.description = Some(field.text().await?),
            "project_type" => upload.project_type = Some(field.text().await?),
            "status" => upload.status = Some(field.text().await?),
            _ => {}
        }
    }

    let project =
        upload::store_template(state.projects.as_ref(), state.objects.as_ref(), &owner, upload)
            .await?;

    Ok(Json(UploadResponse {
        project_id: project.id,
        download_url: format!("/download-template/{}", project.id),
    }))
}

/// Download a project's stored template archive
#[instrument(skip(state))]
async fn download_template(
    State(state): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
) -> Result<Response, ApiError> {
    let Path(project_id) = path?;
    let project = find_project(&state, project_id).await?;
    let data = fetch_object(&state, &project.storage_key()).await?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!(
                    "attachment; filename=\"{}\"",
                    project.file_name.replace(['"', '\\', '\r', '\n'], "_")
                ),
            ),
        ],
        data,
    )
        .into_response())
}

/// Return the context blob uploaded with a project
#[instrument(skip(state))]
async fn template_json(
    State(state): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
) -> Result<Response, ApiError> {
    let Path(project_id) = path?;
    let project = find_project(&state, project_id).await?;
    let data = fetch_object(&state, &project.context_key()).await?;

    Ok(([(header::CONTENT_TYPE, "application/json")], data).into_response())
}

/// List every project
#[instrument(skip(state))]
async fn list_templates(
    State(state): State<AppState>,
) -> Result<Json<Vec<ProjectSummary>>, ApiError> {
    let projects = state.projects.list_all().await.map_err(|e| {
        error!(error = %e, "Failed to list projects");
        ProcessError::StorageUnavailable(e.to_string())
    })?;

    Ok(Json(projects.into_iter().map(Into::into).collect()))
}

/// List a user's projects in creation order
#[instrument(skip(state))]
async fn user_projects(
    State(state): State<AppState>,
    path: Result<Path<String>, PathRejection>,
) -> Result<Json<Vec<UserProject>>, ApiError> {
    let Path(email) = path?;
    let unavailable = |e: RegistryError| {
        error!(error = %e, "Failed to list user projects");
        ProcessError::StorageUnavailable(e.to_string())
    };

    let user_id = state
        .projects
        .find_user_id(&email)
        .await
        .map_err(unavailable)?
        .ok_or_else(|| ProcessError::NotFound(USER_NOT_FOUND.to_string()))?;

    let projects = state
        .projects
        .list_by_owner(user_id)
        .await
        .map_err(unavailable)?;

    Ok(Json(projects.into_iter().map(Into::into).collect()))
}

/// Start the HTTP API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting templating API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
