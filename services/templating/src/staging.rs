//! Per-request staging directories.
//!
//! Each render request gets its own directory under the shared staging root,
//! named by a random UUID and never by anything the caller sent:
//!
//! ```text
//! {root}/{uuid}/
//!   archive/{archive_name}     downloaded template archive
//!   template/                  extracted template tree
//!     {context_file_name}      materialized render context
//! ```
//!
//! A [`StagingHandle`] owns that directory. It is removed by
//! [`StagingHandle::cleanup`] or, failing that, when the handle is dropped.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zip::ZipArchive;

const ARCHIVE_DIR: &str = "archive";
const TEMPLATE_DIR: &str = "template";
const DEFAULT_ARCHIVE_NAME: &str = "template.zip";

// st_mode file type bits
const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Errors raised while staging a request
#[derive(Error, Debug)]
pub enum StagingError {
    #[error("staging io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("invalid archive: {0}")]
    InvalidArchive(#[from] zip::result::ZipError),

    #[error("archive entry escapes the staging directory: {0}")]
    UnsafeEntry(String),

    #[error("context serialization error: {0}")]
    Context(#[from] serde_json::Error),
}

fn io_err(path: impl Into<PathBuf>, source: io::Error) -> StagingError {
    StagingError::Io { path: path.into(), source }
}

/// Allocates isolated working directories under a shared root
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
    context_file_name: String,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>, context_file_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            context_file_name: context_file_name.into(),
        }
    }

    /// Shared root holding every staging directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Name of the context file written into the template tree
    pub fn context_file_name(&self) -> &str {
        &self.context_file_name
    }

    /// Materialize an archive and its render context in a fresh directory.
    ///
    /// On error nothing is left behind: the partially built directory is
    /// removed when the handle under construction is dropped.
    pub fn stage(
        &self,
        archive: &[u8],
        archive_name: &str,
        context: &serde_json::Value,
    ) -> Result<StagingHandle, StagingError> {
        fs::create_dir_all(&self.root).map_err(|e| io_err(&self.root, e))?;

        let id = Uuid::new_v4();
        let dir = self.root.join(id.to_string());

        // create_dir (not create_dir_all) so an existing directory is an error
        fs::create_dir(&dir).map_err(|e| io_err(&dir, e))?;

        let archive_path = dir.join(ARCHIVE_DIR).join(sanitize_archive_name(archive_name));
        let template_root = dir.join(TEMPLATE_DIR);
        let context_path = template_root.join(&self.context_file_name);

        let handle = StagingHandle {
            id,
            root: dir,
            archive_path,
            template_root,
            context_path,
            adopted: Vec::new(),
            released: false,
        };

        handle.write_archive(archive)?;
        let entries = handle.extract_archive()?;
        handle.write_context(context)?;

        info!(
            staging_id = %handle.id,
            entries = entries,
            archive_bytes = archive.len(),
            "Template staged"
        );

        Ok(handle)
    }
}

/// Exclusive ownership of one staging directory
#[derive(Debug)]
pub struct StagingHandle {
    id: Uuid,
    root: PathBuf,
    archive_path: PathBuf,
    template_root: PathBuf,
    context_path: PathBuf,
    adopted: Vec<PathBuf>,
    released: bool,
}

impl StagingHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// This request's directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    /// Root of the extracted template tree
    pub fn template_root(&self) -> &Path {
        &self.template_root
    }

    pub fn context_path(&self) -> &Path {
        &self.context_path
    }

    /// Take ownership of a directory outside the staging directory so that
    /// cleanup removes it as well.
    ///
    /// Paths already inside the staging directory need no adoption. Paths
    /// that contain the staging directory, or that hold `..` components and
    /// so cannot be compared by prefix, are refused, returning `false`.
    pub fn adopt(&mut self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();

        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            warn!(
                staging_id = %self.id,
                path = %path.display(),
                "Refusing to adopt a non-normalized path"
            );
            return false;
        }

        if path.starts_with(&self.root) {
            return true;
        }

        if self.root.starts_with(&path) || path.parent().is_none() {
            warn!(
                staging_id = %self.id,
                path = %path.display(),
                "Refusing to adopt a directory enclosing the staging directory"
            );
            return false;
        }

        self.adopted.push(path);
        true
    }

    /// Remove the staging directory and every adopted directory.
    ///
    /// Failures are logged and swallowed; paths already gone are fine.
    pub fn cleanup(mut self) {
        self.remove_all();
    }

    fn remove_all(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut failures = 0u32;
        let paths = std::iter::once(&self.root).chain(self.adopted.iter());

        for path in paths {
            match fs::remove_dir_all(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    failures += 1;
                    warn!(
                        staging_id = %self.id,
                        path = %path.display(),
                        error = %e,
                        "Failed to remove staging directory"
                    );
                }
            }
        }

        if failures > 0 {
            metrics::counter!("templating.staging.cleanup_failures").increment(1);
        }
        metrics::counter!("templating.staging.cleanups").increment(1);

        debug!(staging_id = %self.id, "Staging directory cleaned up");
    }

    fn write_archive(&self, archive: &[u8]) -> Result<(), StagingError> {
        if let Some(parent) = self.archive_path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        fs::write(&self.archive_path, archive).map_err(|e| io_err(&self.archive_path, e))
    }

    /// Extract every archive entry below the template root
    fn extract_archive(&self) -> Result<usize, StagingError> {
        let file = File::open(&self.archive_path).map_err(|e| io_err(&self.archive_path, e))?;
        let mut archive = ZipArchive::new(file)?;

        fs::create_dir_all(&self.template_root).map_err(|e| io_err(&self.template_root, e))?;

        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;

            let relative = entry
                .enclosed_name()
                .ok_or_else(|| StagingError::UnsafeEntry(entry.name().to_string()))?;

            if entry
                .unix_mode()
                .map(|mode| mode & S_IFMT == S_IFLNK)
                .unwrap_or(false)
            {
                return Err(StagingError::UnsafeEntry(entry.name().to_string()));
            }

            let target = self.template_root.join(&relative);

            if entry.is_dir() {
                fs::create_dir_all(&target).map_err(|e| io_err(&target, e))?;
                continue;
            }

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }

            let mut out = File::create(&target).map_err(|e| io_err(&target, e))?;
            io::copy(&mut entry, &mut out).map_err(|e| io_err(&target, e))?;
        }

        Ok(archive.len())
    }

    fn write_context(&self, context: &serde_json::Value) -> Result<(), StagingError> {
        let payload = serde_json::to_vec(context)?;
        fs::write(&self.context_path, payload).map_err(|e| io_err(&self.context_path, e))
    }
}

impl Drop for StagingHandle {
    fn drop(&mut self) {
        if !self.released {
            debug!(staging_id = %self.id, "Staging handle dropped before cleanup");
            self.remove_all();
        }
    }
}

/// Reduce an uploaded archive name to one safe file-name component
fn sanitize_archive_name(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default();

    let sanitized: String = last
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();

    let trimmed = sanitized.trim_start_matches('.');
    if trimmed.is_empty() {
        DEFAULT_ARCHIVE_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}
