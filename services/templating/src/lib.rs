//! CodeGen Templating Service
//!
//! Renders uploaded project templates on demand. A client names a project and
//! supplies a JSON context; the service fetches the project's template archive
//! from object storage, unpacks it into a private staging directory, runs the
//! rendering engine over it and streams the rendered tree back as a zip.
//! Templates arrive through a multipart upload that creates the project row
//! and stores the archive together with a default context.
//!
//! ## Architecture
//!
//! ```text
//!  POST /process-template/?project_id=N        PostgreSQL          S3 / MinIO
//! ┌──────────────┐                         ┌──────────────┐    ┌──────────────┐
//! │ API          │                         │ Project      │    │ Object       │
//! │ (axum)       │                         │ Registry     │    │ Store        │
//! └──────────────┘                         └──────────────┘    └──────────────┘
//!        │                                        ▲                   ▲
//!        ▼                                        │                   │
//! ┌──────────────┐  validate, fetch ──────────────┴───────────────────┘
//! │ Template     │
//! │ Processor    │──▶ Staging Area ──▶ Rendering Engine ──▶ Zip Stream Encoder
//! └──────────────┘    {root}/{uuid}/     (Tera)               chunked response
//!                          │                                        │
//!                          └──────────── cleanup ◀──────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod object_store;
pub mod processor;
pub mod project_registry;
pub mod render;
pub mod staging;
pub mod upload;
pub mod zip_stream;

pub use api::{
    create_router, ApiError, AppState, ErrorResponse, ProjectSummary, UploadResponse, UserProject,
};
pub use config::{Config, ConfigError, ContextSource};
pub use object_store::{MemoryObjectStore, ObjectStore, S3ObjectStore, StorageError};
pub use processor::{ProcessError, ProcessedTemplate, RenderRequest, Stage, TemplateProcessor};
pub use project_registry::{
    MemoryProjectRegistry, NewProject, PgProjectRegistry, Project, ProjectRegistry, RegistryError,
};
pub use render::{EngineError, RenderingEngine, TeraEngine};
pub use staging::{StagingArea, StagingError, StagingHandle};
pub use upload::{store_template, TemplateUpload};
pub use zip_stream::{EncodeSummary, ZipPlan, ZipStream, ZipStreamEncoder};
