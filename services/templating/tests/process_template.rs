mod common;

use common::{build_zip, collect_stream, count_entries, service_template, unzip, Harness};
use codegen_templating::{ProcessError, RenderRequest};
use serde_json::json;

fn context() -> serde_json::Value {
    json!({
        "name": "billing",
        "description": "Invoices and payments",
        "version": "1.2.0",
        "port": 8080
    })
}

#[tokio::test]
async fn test_process_streams_rendered_tree() {
    let harness = Harness::new();
    harness.add_project(1, service_template()).await;

    let processed = harness
        .processor()
        .process(RenderRequest::new(1, context()))
        .await
        .unwrap();
    assert_eq!(processed.entry_count, 4);

    let entries = unzip(&collect_stream(processed.stream).await);
    let names: Vec<&str> = entries.keys().map(String::as_str).collect();

    assert_eq!(
        names,
        vec!["LICENSE", "README.md", "config/default.toml", "src/main.rs"]
    );
    assert_eq!(entries["README.md"], "# billing\n\nInvoices and payments\n");
    assert_eq!(entries["config/default.toml"], "port = 8080\n");
    assert!(entries["src/main.rs"].contains("billing v1.2.0"));
    assert_eq!(harness.leftovers(), 0);
}

#[tokio::test]
async fn test_repeated_processing_yields_same_entries() {
    let harness = Harness::new();
    harness.add_project(1, service_template()).await;
    let processor = harness.processor();

    let first = processor.process(RenderRequest::new(1, context())).await.unwrap();
    let first = unzip(&collect_stream(first.stream).await);
    let second = processor.process(RenderRequest::new(1, context())).await.unwrap();
    let second = unzip(&collect_stream(second.stream).await);

    assert_eq!(first, second);
    assert_eq!(harness.leftovers(), 0);
}

#[tokio::test]
async fn test_corrupt_archive_is_rejected_and_cleaned_up() {
    let harness = Harness::new();
    harness.add_project(2, b"PK but not really a zip".to_vec()).await;

    let err = harness
        .processor()
        .process(RenderRequest::new(2, context()))
        .await
        .unwrap_err();

    assert!(matches!(err, ProcessError::InvalidArchiveOrContext(_)));
    assert_eq!(harness.leftovers(), 0);
}

#[tokio::test]
async fn test_path_traversal_is_rejected() {
    let harness = Harness::new();
    let archive = build_zip(&[("README.md", "hi"), ("../../evil", "pwned")]);
    harness.add_project(3, archive).await;

    let staging_root = harness.staging_root.path().join("nested");
    let processor = codegen_templating::TemplateProcessor::new(
        harness.registry.clone(),
        harness.objects.clone(),
        std::sync::Arc::new(codegen_templating::TeraEngine::default()),
        codegen_templating::StagingArea::new(&staging_root, "templater.json"),
        codegen_templating::ZipStreamEncoder::default(),
    );

    let err = processor
        .process(RenderRequest::new(3, context()))
        .await
        .unwrap_err();

    assert!(matches!(err, ProcessError::InvalidArchiveOrContext(_)));
    assert_eq!(count_entries(&staging_root), 0);
    // Only the (now empty) nested root exists next to where "evil" would land
    assert!(!harness.staging_root.path().join("evil").exists());
    assert_eq!(harness.leftovers(), 1);
}

#[tokio::test]
async fn test_absolute_entry_is_rejected() {
    let harness = Harness::new();
    harness
        .add_project(4, build_zip(&[("/etc/evil.conf", "pwned")]))
        .await;

    let err = harness
        .processor()
        .process(RenderRequest::new(4, context()))
        .await
        .unwrap_err();

    assert!(matches!(err, ProcessError::InvalidArchiveOrContext(_)));
    assert_eq!(harness.leftovers(), 0);
}

#[tokio::test]
async fn test_render_failure_carries_engine_message() {
    let harness = Harness::new();
    harness
        .add_project(5, build_zip(&[("broken.txt.tera", "{{ unknown_variable }}")]))
        .await;

    let err = harness
        .processor()
        .process(RenderRequest::new(5, context()))
        .await
        .unwrap_err();

    match err {
        ProcessError::RenderFailure(message) => assert!(message.contains("broken.txt.tera")),
        other => panic!("Expected RenderFailure, got {:?}", other),
    }
    assert_eq!(harness.leftovers(), 0);
}

#[tokio::test]
async fn test_missing_archive_blob() {
    let harness = Harness::new();
    harness.registry.insert(common::project(6, "orphan.zip"));

    let err = harness
        .processor()
        .process(RenderRequest::new(6, context()))
        .await
        .unwrap_err();

    assert!(matches!(err, ProcessError::NotFound(_)));
    assert_eq!(harness.leftovers(), 0);
}

#[tokio::test]
async fn test_dropped_stream_still_cleans_up() {
    let harness = Harness::new();
    harness.add_project(7, service_template()).await;

    let processed = harness
        .processor()
        .process(RenderRequest::new(7, context()))
        .await
        .unwrap();
    drop(processed);

    let mut remaining = harness.leftovers();
    for _ in 0..50 {
        if remaining == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        remaining = harness.leftovers();
    }
    assert_eq!(remaining, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_are_isolated() {
    let harness = Harness::new();
    harness
        .add_project(10, build_zip(&[("who.txt.tera", "project {{ name }}"), ("only-ten.txt", "10")]))
        .await;
    harness
        .add_project(20, build_zip(&[("who.txt.tera", "project {{ name }}"), ("only-twenty.txt", "20")]))
        .await;

    let processor = std::sync::Arc::new(harness.processor());

    let mut tasks = Vec::new();
    for i in 0..8 {
        let processor = processor.clone();
        tasks.push(tokio::spawn(async move {
            let (id, name) = if i % 2 == 0 { (10, "ten") } else { (20, "twenty") };
            let processed = processor
                .process(RenderRequest::new(id, json!({ "name": name })))
                .await
                .unwrap();
            (id, unzip(&collect_stream(processed.stream).await))
        }));
    }

    for task in tasks {
        let (id, entries) = task.await.unwrap();
        match id {
            10 => {
                assert_eq!(entries["who.txt"], "project ten");
                assert!(entries.contains_key("only-ten.txt"));
                assert!(!entries.contains_key("only-twenty.txt"));
            }
            _ => {
                assert_eq!(entries["who.txt"], "project twenty");
                assert!(entries.contains_key("only-twenty.txt"));
                assert!(!entries.contains_key("only-ten.txt"));
            }
        }
        assert_eq!(entries.len(), 2);
    }

    assert_eq!(harness.leftovers(), 0);
}
