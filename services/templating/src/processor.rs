//! Template processing pipeline.
//!
//! One call to [`TemplateProcessor::process`] walks a request through
//!
//! ```text
//! Validating -> Fetching -> Staging -> Rendering -> Streaming -> Cleanup -> Done
//! ```
//!
//! failing into a [`ProcessError`] at any step. Once a request has been
//! staged, its staging directory is removed exactly once: right away when a
//! later step fails, or after the last zip chunk has been produced (or the
//! client went away) when streaming.

use crate::config::ContextSource;
use crate::object_store::{ObjectStore, StorageError};
use crate::project_registry::{Project, ProjectRegistry};
use crate::render::RenderingEngine;
use crate::staging::{StagingArea, StagingHandle};
use crate::zip_stream::{ZipStream, ZipStreamEncoder};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// File name offered to clients for the rendered archive
pub const PROCESSED_ARCHIVE_NAME: &str = "processed_template.zip";

pub const MISSING_PROJECT_ID: &str = "Project ID is required in query parameters";
pub const MISSING_CONTEXT: &str = "Context data is required in the request body";
pub const PROJECT_NOT_FOUND: &str = "Project not found";

/// Failures of the processing pipeline, one variant per error kind
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    StorageUnavailable(String),

    #[error("{0}")]
    InvalidArchiveOrContext(String),

    #[error("{0}")]
    RenderFailure(String),

    #[error("Template rendering timed out after {0}s")]
    RenderTimeout(u64),

    #[error("{0}")]
    StreamingFailure(String),

    #[error("{0}")]
    Internal(String),
}

impl ProcessError {
    /// Stable label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessError::BadRequest(_) => "bad_request",
            ProcessError::NotFound(_) => "not_found",
            ProcessError::StorageUnavailable(_) => "storage_unavailable",
            ProcessError::InvalidArchiveOrContext(_) => "invalid_archive_or_context",
            ProcessError::RenderFailure(_) => "render_failure",
            ProcessError::RenderTimeout(_) => "render_timeout",
            ProcessError::StreamingFailure(_) => "streaming_failure",
            ProcessError::Internal(_) => "internal",
        }
    }
}

/// Pipeline steps, used to tag log records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    Fetching,
    Staging,
    Rendering,
    Streaming,
    Cleanup,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validating => "validating",
            Stage::Fetching => "fetching",
            Stage::Staging => "staging",
            Stage::Rendering => "rendering",
            Stage::Streaming => "streaming",
            Stage::Cleanup => "cleanup",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// A single processing call
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub project_id: i64,
    /// Caller-supplied context; absent when contexts come from storage
    pub context: Option<Value>,
}

impl RenderRequest {
    pub fn new(project_id: i64, context: Value) -> Self {
        Self {
            project_id,
            context: Some(context),
        }
    }

    /// Build a request from a raw query parameter and request body.
    ///
    /// The project ID is checked first. An empty body counts as a missing
    /// context; whether a context is required is decided by the processor.
    pub fn from_parts(project_id: Option<&str>, body: &[u8]) -> Result<Self, ProcessError> {
        let raw_id = project_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ProcessError::BadRequest(MISSING_PROJECT_ID.to_string()))?;

        let project_id = raw_id.parse::<i64>().map_err(|_| {
            ProcessError::BadRequest(format!("Invalid project ID: {}", raw_id))
        })?;

        let context = if body.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            let value: Value = serde_json::from_slice(body)
                .map_err(|e| ProcessError::BadRequest(format!("Invalid JSON: {}", e)))?;
            Some(value)
        };

        Ok(Self { project_id, context })
    }
}

/// A rendered template ready to be sent
pub struct ProcessedTemplate {
    pub request_id: Uuid,
    pub project_id: i64,
    /// Number of files in the archive
    pub entry_count: usize,
    /// Zip bytes; the staging directory is gone once this ends
    pub stream: ZipStream,
}

impl fmt::Debug for ProcessedTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessedTemplate")
            .field("request_id", &self.request_id)
            .field("project_id", &self.project_id)
            .field("entry_count", &self.entry_count)
            .finish_non_exhaustive()
    }
}

/// Falsy JSON values do not count as a context
fn is_empty_context(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

/// Orchestrates fetch, staging, rendering and streaming for each request
pub struct TemplateProcessor {
    projects: Arc<dyn ProjectRegistry>,
    objects: Arc<dyn ObjectStore>,
    engine: Arc<dyn RenderingEngine>,
    staging: StagingArea,
    encoder: ZipStreamEncoder,
    render_timeout: Duration,
    context_source: ContextSource,
}

impl TemplateProcessor {
    pub fn new(
        projects: Arc<dyn ProjectRegistry>,
        objects: Arc<dyn ObjectStore>,
        engine: Arc<dyn RenderingEngine>,
        staging: StagingArea,
        encoder: ZipStreamEncoder,
    ) -> Self {
        Self {
            projects,
            objects,
            engine,
            staging,
            encoder,
            render_timeout: Duration::from_secs(120),
            context_source: ContextSource::RequestBody,
        }
    }

    /// Set the upper bound on a single render
    pub fn with_render_timeout(mut self, timeout: Duration) -> Self {
        self.render_timeout = timeout;
        self
    }

    /// Set where render contexts come from
    pub fn with_context_source(mut self, source: ContextSource) -> Self {
        self.context_source = source;
        self
    }

    /// Run one request through the pipeline
    #[instrument(skip(self, request), fields(project_id = request.project_id))]
    pub async fn process(&self, request: RenderRequest) -> Result<ProcessedTemplate, ProcessError> {
        let request_id = Uuid::new_v4();
        metrics::counter!("templating.requests").increment(1);

        let result = self.run(request_id, request).await;

        if let Err(ref e) = result {
            match e {
                ProcessError::BadRequest(_) | ProcessError::NotFound(_) => {
                    debug!(request_id = %request_id, kind = e.kind(), error = %e, "Request rejected");
                }
                _ => {
                    warn!(request_id = %request_id, kind = e.kind(), error = %e, "Template processing failed");
                }
            }
            metrics::counter!("templating.requests.failed", "kind" => e.kind()).increment(1);
        }

        result
    }

    async fn run(
        &self,
        request_id: Uuid,
        request: RenderRequest,
    ) -> Result<ProcessedTemplate, ProcessError> {
        let project_id = request.project_id;

        debug!(request_id = %request_id, stage = %Stage::Validating, "Validating request");
        let inline_context = self.validate(request)?;

        debug!(request_id = %request_id, stage = %Stage::Fetching, "Fetching template");
        let project = self.fetch_project(project_id).await?;
        let archive = self.fetch_archive(&project).await?;
        let context = match inline_context {
            Some(context) => context,
            None => self.fetch_stored_context(&project).await?,
        };

        debug!(
            request_id = %request_id,
            stage = %Stage::Staging,
            archive_bytes = archive.len(),
            "Staging template"
        );
        let handle = self.stage(archive, project.file_name.clone(), context).await?;

        debug!(
            request_id = %request_id,
            stage = %Stage::Rendering,
            staging_id = %handle.id(),
            "Rendering template"
        );
        let (mut handle, output_dir) = self.render(request_id, handle).await?;

        if !handle.adopt(&output_dir) {
            self.cleanup(request_id, handle).await;
            return Err(ProcessError::RenderFailure(format!(
                "Rendering engine returned an unusable output directory: {}",
                output_dir.display()
            )));
        }

        debug!(
            request_id = %request_id,
            stage = %Stage::Streaming,
            output_dir = %output_dir.display(),
            "Streaming rendered output"
        );
        let encoder = self.encoder.clone();
        let planned = tokio::task::spawn_blocking(move || encoder.plan(&output_dir)).await;

        let plan = match planned {
            Ok(Ok(plan)) => plan,
            Ok(Err(e)) => {
                self.cleanup(request_id, handle).await;
                return Err(ProcessError::StreamingFailure(format!(
                    "Failed to read rendered output: {}",
                    e
                )));
            }
            Err(e) => {
                self.cleanup(request_id, handle).await;
                return Err(ProcessError::Internal(format!("Output scan panicked: {}", e)));
            }
        };

        let entry_count = plan.len();
        let stream = self.encoder.stream(plan, move |outcome| {
            match outcome {
                Ok(summary) => {
                    info!(
                        request_id = %request_id,
                        project_id = project_id,
                        entries = summary.entries,
                        size_bytes = summary.bytes,
                        "Processed template streamed"
                    );
                }
                Err(e) => {
                    let failure = ProcessError::StreamingFailure(e.to_string());
                    warn!(
                        request_id = %request_id,
                        project_id = project_id,
                        kind = failure.kind(),
                        error = %failure,
                        "Streaming aborted"
                    );
                    metrics::counter!("templating.requests.failed", "kind" => failure.kind())
                        .increment(1);
                }
            }

            debug!(request_id = %request_id, stage = %Stage::Cleanup, "Cleaning up staging directory");
            handle.cleanup();
            debug!(request_id = %request_id, stage = %Stage::Done, "Request finished");
        });

        Ok(ProcessedTemplate {
            request_id,
            project_id,
            entry_count,
            stream,
        })
    }

    /// Returns the inline context to use, or `None` when it comes from storage
    fn validate(&self, request: RenderRequest) -> Result<Option<Value>, ProcessError> {
        match self.context_source {
            ContextSource::RequestBody => {
                let context = request
                    .context
                    .filter(|c| !is_empty_context(c))
                    .ok_or_else(|| ProcessError::BadRequest(MISSING_CONTEXT.to_string()))?;

                if !context.is_object() {
                    return Err(ProcessError::BadRequest(
                        "Context data must be a JSON object".to_string(),
                    ));
                }

                Ok(Some(context))
            }
            ContextSource::Stored => {
                if request.context.is_some() {
                    debug!("Ignoring request body; contexts are read from storage");
                }
                Ok(None)
            }
        }
    }

    async fn fetch_project(&self, project_id: i64) -> Result<Project, ProcessError> {
        self.projects
            .get_by_id(project_id)
            .await
            .map_err(|e| {
                error!(error = %e, "Project lookup failed");
                ProcessError::StorageUnavailable(e.to_string())
            })?
            .ok_or_else(|| ProcessError::NotFound(PROJECT_NOT_FOUND.to_string()))
    }

    async fn fetch_archive(&self, project: &Project) -> Result<bytes::Bytes, ProcessError> {
        self.objects
            .get(&project.storage_key())
            .await
            .map_err(|e| match e {
                StorageError::NotFound(_) => {
                    ProcessError::NotFound("Template archive not found".to_string())
                }
                StorageError::Backend(_) => ProcessError::StorageUnavailable(e.to_string()),
            })
    }

    async fn fetch_stored_context(&self, project: &Project) -> Result<Value, ProcessError> {
        let raw = self
            .objects
            .get(&project.context_key())
            .await
            .map_err(|e| match e {
                StorageError::NotFound(_) => {
                    ProcessError::NotFound("Context data not found for project".to_string())
                }
                StorageError::Backend(_) => ProcessError::StorageUnavailable(e.to_string()),
            })?;

        let context: Value = serde_json::from_slice(&raw).map_err(|e| {
            ProcessError::InvalidArchiveOrContext(format!("Invalid stored context: {}", e))
        })?;

        if is_empty_context(&context) || !context.is_object() {
            return Err(ProcessError::InvalidArchiveOrContext(
                "Stored context must be a non-empty JSON object".to_string(),
            ));
        }

        Ok(context)
    }

    async fn stage(
        &self,
        archive: bytes::Bytes,
        archive_name: String,
        context: Value,
    ) -> Result<StagingHandle, ProcessError> {
        let staging = self.staging.clone();

        tokio::task::spawn_blocking(move || staging.stage(&archive, &archive_name, &context))
            .await
            .map_err(|e| ProcessError::Internal(format!("Staging task panicked: {}", e)))?
            .map_err(|e| ProcessError::InvalidArchiveOrContext(e.to_string()))
    }

    /// Run the engine with the handle moved onto the blocking thread.
    ///
    /// The engine cannot be interrupted. If this future is dropped or times
    /// out, the blocking task still owns the handle and drops it (removing
    /// the directory) only after the engine has returned.
    async fn render(
        &self,
        request_id: Uuid,
        handle: StagingHandle,
    ) -> Result<(StagingHandle, PathBuf), ProcessError> {
        let engine = self.engine.clone();

        let started = Instant::now();
        let task = tokio::task::spawn_blocking(move || {
            let result = engine.render(handle.template_root(), handle.context_path());
            (handle, result)
        });

        let outcome = tokio::time::timeout(self.render_timeout, task).await;

        metrics::histogram!("templating.render.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(Ok((handle, Ok(dir)))) => Ok((handle, dir)),
            Ok(Ok((handle, Err(e)))) => {
                self.cleanup(request_id, handle).await;
                Err(ProcessError::RenderFailure(e.to_string()))
            }
            // Unwinding dropped the handle
            Ok(Err(e)) => Err(ProcessError::RenderFailure(format!(
                "Rendering engine panicked: {}",
                e
            ))),
            Err(_) => {
                debug!(
                    request_id = %request_id,
                    stage = %Stage::Cleanup,
                    "Render timed out; cleanup deferred until the engine returns"
                );
                Err(ProcessError::RenderTimeout(self.render_timeout.as_secs()))
            }
        }
    }

    async fn cleanup(&self, request_id: Uuid, handle: StagingHandle) {
        debug!(request_id = %request_id, stage = %Stage::Cleanup, "Cleaning up staging directory");

        // A panic drops the handle, which cleans up on its own
        if let Err(e) = tokio::task::spawn_blocking(move || handle.cleanup()).await {
            warn!(request_id = %request_id, error = %e, "Cleanup task failed");
        }
    }
}
