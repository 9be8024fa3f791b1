//! Template uploads.
//!
//! An upload carries the template archive, a default context JSON file and
//! the project's descriptive fields. The project row is created first; its ID
//! then names both blobs (`<id>` and `<id>_context.json`).

use crate::object_store::{archive_key, context_key, ObjectStore};
use crate::processor::ProcessError;
use crate::project_registry::{NewProject, Project, ProjectRegistry};
use bytes::Bytes;
use std::io::Cursor;
use tracing::{error, info, instrument};
use zip::ZipArchive;

pub const MISSING_FILES: &str = "Both archive and JSON file must be provided";
pub const INVALID_ARCHIVE: &str = "Provided file is not a valid archive";
pub const INVALID_JSON: &str = "Provided file is not a valid JSON";
pub const MISSING_FIELDS: &str = "Missing required fields";
pub const USER_NOT_FOUND: &str = "User not found";

/// Raw upload as received; every part may be missing
#[derive(Debug, Clone, Default)]
pub struct TemplateUpload {
    pub archive: Option<Bytes>,
    /// Client-side name of the archive
    pub file_name: Option<String>,
    pub context: Option<Bytes>,
    pub project_name: Option<String>,
    pub description: Option<String>,
    pub project_type: Option<String>,
    pub status: Option<String>,
}

/// Upload that passed every check
#[derive(Debug)]
struct CheckedUpload {
    archive: Bytes,
    context: Bytes,
    file_name: String,
    project_name: String,
    description: String,
    project_type: String,
    status: String,
}

fn required(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl TemplateUpload {
    /// Checks run in order: both files present, archive readable as zip,
    /// context parses as JSON, descriptive fields non-empty.
    fn check(self) -> Result<CheckedUpload, ProcessError> {
        let (archive, context) = match (self.archive, self.context) {
            (Some(archive), Some(context)) => (archive, context),
            _ => return Err(ProcessError::BadRequest(MISSING_FILES.to_string())),
        };

        if ZipArchive::new(Cursor::new(archive.as_ref())).is_err() {
            return Err(ProcessError::BadRequest(INVALID_ARCHIVE.to_string()));
        }

        if serde_json::from_slice::<serde_json::Value>(&context).is_err() {
            return Err(ProcessError::BadRequest(INVALID_JSON.to_string()));
        }

        let missing = || ProcessError::BadRequest(MISSING_FIELDS.to_string());

        Ok(CheckedUpload {
            archive,
            context,
            file_name: self.file_name.unwrap_or_default(),
            project_name: required(self.project_name).ok_or_else(missing)?,
            description: required(self.description).ok_or_else(missing)?,
            project_type: required(self.project_type).ok_or_else(missing)?,
            status: required(self.status).ok_or_else(missing)?,
        })
    }
}

/// Validate an upload, create its project row for `owner_email` and store
/// both blobs under the new project's keys.
#[instrument(skip(projects, objects, upload))]
pub async fn store_template(
    projects: &dyn ProjectRegistry,
    objects: &dyn ObjectStore,
    owner_email: &str,
    upload: TemplateUpload,
) -> Result<Project, ProcessError> {
    let upload = upload.check()?;

    let user_id = projects
        .find_user_id(owner_email)
        .await
        .map_err(|e| {
            error!(error = %e, "Owner lookup failed");
            ProcessError::StorageUnavailable(e.to_string())
        })?
        .ok_or_else(|| ProcessError::NotFound(USER_NOT_FOUND.to_string()))?;

    let project = projects
        .create(NewProject {
            user_id,
            project_name: upload.project_name,
            description: upload.description,
            project_type: upload.project_type,
            status: upload.status,
            file_name: upload.file_name,
        })
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to create project");
            ProcessError::StorageUnavailable(e.to_string())
        })?;

    let archive_bytes = upload.archive.len();
    for (key, data) in [
        (archive_key(project.id), upload.archive),
        (context_key(project.id), upload.context),
    ] {
        objects.put(&key, data).await.map_err(|e| {
            error!(error = %e, project_id = project.id, key = %key, "Failed to store upload");
            ProcessError::StorageUnavailable(e.to_string())
        })?;
    }

    metrics::counter!("templating.uploads").increment(1);
    info!(
        project_id = project.id,
        user_id = user_id,
        archive_bytes = archive_bytes,
        "Template uploaded"
    );

    Ok(project)
}
