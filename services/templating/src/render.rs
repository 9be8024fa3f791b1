//! Rendering engine seam and the bundled Tera engine.

use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tera::{Context, Tera};
use tracing::debug;
use walkdir::WalkDir;

const TEMPLATE_SUFFIX: &str = ".tera";

/// Opaque failure reported by a rendering engine
#[derive(Debug)]
pub struct EngineError {
    message: String,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for EngineError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// Turns an extracted template tree plus a context file into an output tree.
///
/// Implementations block; callers run them off the async executor.
#[cfg_attr(test, mockall::automock)]
pub trait RenderingEngine: Send + Sync {
    /// Render `template_root` with the JSON object in `context_file` and
    /// return the directory holding the rendered files.
    fn render(&self, template_root: &Path, context_file: &Path) -> Result<PathBuf, EngineError>;
}

/// Tera-backed engine.
///
/// Files ending in `.tera` are rendered and written without the suffix; all
/// other files are copied as-is. The context file itself is not copied. The
/// output tree is written next to the template root.
#[derive(Debug, Clone)]
pub struct TeraEngine {
    output_dir_name: String,
}

impl TeraEngine {
    pub fn new(output_dir_name: impl Into<String>) -> Self {
        Self {
            output_dir_name: output_dir_name.into(),
        }
    }

    fn load_context(context_file: &Path) -> Result<Context, EngineError> {
        let raw = fs::read(context_file).map_err(|e| {
            EngineError::with_source(
                format!("cannot read context file {}", context_file.display()),
                e,
            )
        })?;

        let value: serde_json::Value = serde_json::from_slice(&raw)
            .map_err(|e| EngineError::with_source(format!("invalid context file: {}", e), e))?;

        Context::from_value(value).map_err(|e| EngineError::new(error_chain(&e)))
    }
}

impl Default for TeraEngine {
    fn default() -> Self {
        Self::new("rendered")
    }
}

impl RenderingEngine for TeraEngine {
    fn render(&self, template_root: &Path, context_file: &Path) -> Result<PathBuf, EngineError> {
        let context = Self::load_context(context_file)?;

        let parent = template_root
            .parent()
            .ok_or_else(|| EngineError::new("template root has no parent directory"))?;
        let output_dir = parent.join(&self.output_dir_name);

        fs::create_dir_all(&output_dir).map_err(|e| {
            EngineError::with_source(format!("cannot create {}", output_dir.display()), e)
        })?;

        let walker = WalkDir::new(template_root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name();

        let mut rendered = 0usize;
        let mut copied = 0usize;

        for entry in walker {
            let entry = entry.map_err(|e| EngineError::new(e.to_string()))?;
            let path = entry.path();

            if path == context_file || !entry.file_type().is_file() {
                continue;
            }

            let relative = path
                .strip_prefix(template_root)
                .map_err(|e| EngineError::new(e.to_string()))?;
            let target = output_dir.join(relative);

            if let Some(dir) = target.parent() {
                fs::create_dir_all(dir).map_err(|e| {
                    EngineError::with_source(format!("cannot create {}", dir.display()), e)
                })?;
            }

            let name = relative.to_string_lossy();
            if let Some(stripped) = name.strip_suffix(TEMPLATE_SUFFIX) {
                let source = fs::read_to_string(path).map_err(|e| {
                    EngineError::with_source(format!("cannot read template {}", name), e)
                })?;

                let output = Tera::one_off(&source, &context, false).map_err(|e| {
                    EngineError::new(format!("failed to render {}: {}", name, error_chain(&e)))
                })?;

                let target = output_dir.join(stripped);
                fs::write(&target, output).map_err(|e| {
                    EngineError::with_source(format!("cannot write {}", target.display()), e)
                })?;
                rendered += 1;
            } else {
                fs::copy(path, &target).map_err(|e| {
                    EngineError::with_source(format!("cannot copy {}", name), e)
                })?;
                copied += 1;
            }
        }

        debug!(
            output_dir = %output_dir.display(),
            rendered = rendered,
            copied = copied,
            "Template tree rendered"
        );

        Ok(output_dir)
    }
}

/// Tera nests the useful detail in the source chain
fn error_chain(error: &dyn StdError) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stage_template(root: &Path, files: &[(&str, &str)], context: serde_json::Value) -> (PathBuf, PathBuf) {
        let template_root = root.join("template");
        for (name, content) in files {
            let path = template_root.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        let context_file = template_root.join("templater.json");
        fs::write(&context_file, serde_json::to_vec(&context).unwrap()).unwrap();
        (template_root, context_file)
    }

    #[test]
    fn test_renders_tera_files_and_copies_others() {
        let tmp = tempfile::tempdir().unwrap();
        let (template_root, context_file) = stage_template(
            tmp.path(),
            &[
                ("README.md.tera", "# {{ project }}"),
                ("src/main.rs.tera", "fn main() { println!(\"{{ greeting }}\"); }"),
                ("assets/logo.svg", "<svg/>"),
            ],
            json!({"project": "billing", "greeting": "hi"}),
        );

        let output = TeraEngine::default().render(&template_root, &context_file).unwrap();

        assert_eq!(output, tmp.path().join("rendered"));
        assert_eq!(fs::read_to_string(output.join("README.md")).unwrap(), "# billing");
        assert_eq!(
            fs::read_to_string(output.join("src/main.rs")).unwrap(),
            "fn main() { println!(\"hi\"); }"
        );
        assert_eq!(fs::read_to_string(output.join("assets/logo.svg")).unwrap(), "<svg/>");
        assert!(!output.join("templater.json").exists());
        assert!(!output.join("README.md.tera").exists());
    }

    #[test]
    fn test_broken_template_reports_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (template_root, context_file) = stage_template(
            tmp.path(),
            &[("broken.txt.tera", "{% if %}")],
            json!({"project": "billing"}),
        );

        let err = TeraEngine::default()
            .render(&template_root, &context_file)
            .unwrap_err();

        assert!(err.message().contains("broken.txt.tera"));
    }

    #[test]
    fn test_missing_variable_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let (template_root, context_file) = stage_template(
            tmp.path(),
            &[("a.txt.tera", "{{ missing }}")],
            json!({"project": "billing"}),
        );

        assert!(TeraEngine::default().render(&template_root, &context_file).is_err());
    }

    #[test]
    fn test_engine_error_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = EngineError::with_source("cannot read", io);

        assert_eq!(err.to_string(), "cannot read");
        assert!(err.source().is_some());
        assert!(EngineError::new("plain").source().is_none());
    }
}
