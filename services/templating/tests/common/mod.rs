#![allow(dead_code)]

use bytes::Bytes;
use chrono::Utc;
use codegen_templating::{
    ContextSource, MemoryObjectStore, MemoryProjectRegistry, ObjectStore, Project, StagingArea,
    TemplateProcessor, TeraEngine, ZipStream, ZipStreamEncoder,
};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::sync::Arc;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

pub const OWNER_EMAIL: &str = "owner@example.com";

pub fn build_zip(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in entries {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn project(id: i64, file_name: &str) -> Project {
    Project {
        id,
        user_id: 1,
        project_name: format!("project-{}", id),
        description: "template under test".to_string(),
        project_type: "service".to_string(),
        status: "active".to_string(),
        file_name: file_name.to_string(),
        created_at: Utc::now(),
    }
}

/// Registry and object store seeded with the given projects and archives
pub struct Harness {
    pub registry: Arc<MemoryProjectRegistry>,
    pub objects: Arc<MemoryObjectStore>,
    pub staging_root: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let registry = Arc::new(MemoryProjectRegistry::new());
        registry.add_owner(1, OWNER_EMAIL);

        Self {
            registry,
            objects: Arc::new(MemoryObjectStore::new()),
            staging_root: tempfile::tempdir().unwrap(),
        }
    }

    pub async fn add_project(&self, id: i64, archive: Vec<u8>) {
        self.registry.insert(project(id, &format!("template-{}.zip", id)));
        self.objects
            .put(&id.to_string(), Bytes::from(archive))
            .await
            .unwrap();
    }

    pub fn processor(&self) -> TemplateProcessor {
        TemplateProcessor::new(
            self.registry.clone(),
            self.objects.clone(),
            Arc::new(TeraEngine::default()),
            StagingArea::new(self.staging_root.path(), "templater.json"),
            ZipStreamEncoder::new(256, 4),
        )
    }

    pub fn stored_context_processor(&self) -> TemplateProcessor {
        self.processor().with_context_source(ContextSource::Stored)
    }

    /// Entries left under the staging root
    pub fn leftovers(&self) -> usize {
        count_entries(self.staging_root.path())
    }
}

pub fn count_entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

pub async fn collect_stream(stream: ZipStream) -> Vec<u8> {
    let mut out = Vec::new();
    let chunks: Vec<_> = stream.collect().await;
    for chunk in chunks {
        out.extend_from_slice(&chunk.expect("zip chunk"));
    }
    out
}

/// Archive entries by name
pub fn unzip(bytes: &[u8]) -> BTreeMap<String, String> {
    let mut archive = ZipArchive::new(Cursor::new(bytes.to_vec())).unwrap();
    let mut entries = BTreeMap::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).unwrap();
        let mut content = String::new();
        file.read_to_string(&mut content).unwrap();
        entries.insert(file.name().to_string(), content);
    }
    entries
}

pub fn service_template() -> Vec<u8> {
    build_zip(&[
        ("README.md.tera", "# {{ name }}\n\n{{ description }}\n"),
        ("src/main.rs.tera", "fn main() {\n    println!(\"{{ name }} v{{ version }}\");\n}\n"),
        ("config/default.toml.tera", "port = {{ port }}\n"),
        ("LICENSE", "MIT\n"),
    ])
}

pub const BOUNDARY: &str = "templating-test-boundary";

/// A multipart/form-data part: field name, optional file name, content
pub type Part<'a> = (&'a str, Option<&'a str>, &'a [u8]);

pub fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, file_name, content) in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match file_name {
            Some(file_name) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n",
                    name, file_name
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
            ),
        }
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}
