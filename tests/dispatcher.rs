//! Event dispatcher: bus topics routed to their handlers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use llmops::bus::MessageBus;
use llmops::events::{
    AppAutoCreate, DatasetDelete, DocumentDelete, DocumentRef, Event, TOPIC_DOCUMENT_BUILD,
};
use llmops::indexing::ProcessRuleRequest;
use llmops::sqlite_store::SqliteStore;
use llmops_core::llm::ScriptedModel;
use llmops_core::models::{AppStatus, DocumentStatus};
use llmops_core::store::{DocumentStore, SegmentStore};
use llmops_core::vector::{Filter, VectorStore};
use tempfile::TempDir;

/// Upload and register a document without building it.
async fn queued_document(h: &Harness, text: &str) -> (String, String) {
    let dataset = h.indexing.create_dataset(ACCOUNT, "kb", "").await.unwrap();
    let upload = h
        .indexing
        .upload_file(ACCOUNT, "notes.txt", text.as_bytes().to_vec())
        .await
        .unwrap();
    let docs = h
        .indexing
        .create_documents(ACCOUNT, &dataset.id, &[upload.id], rule_1000())
        .await
        .unwrap();
    (dataset.id, docs[0].id.clone())
}

#[tokio::test]
async fn test_build_event_indexes_document() {
    let h = Harness::new();
    let (_, _, text) = two_paragraphs();
    let (_, document_id) = queued_document(&h, &text).await;

    h.dispatcher
        .publish(&Event::build_document(document_id.clone()))
        .await
        .unwrap();
    assert_eq!(h.bus.len(TOPIC_DOCUMENT_BUILD), 1);
    assert_eq!(h.dispatcher.process_pending().await.unwrap(), 1);

    let doc = h.store.get_document(&document_id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
    assert_eq!(
        h.store
            .list_segments_by_document(&document_id)
            .await
            .unwrap()
            .len(),
        2
    );

    // The group offset moved past the message.
    assert_eq!(h.dispatcher.process_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn test_toggle_and_delete_events() {
    let h = Harness::new();
    let (_, _, text) = two_paragraphs();
    let (dataset_id, doc) = h.ingest(&text, rule_1000()).await;
    let by_doc = Filter::new().equal("document_id", doc.id.clone());

    h.indexing
        .set_document_enabled(ACCOUNT, &doc.id, false)
        .await
        .unwrap();
    h.dispatcher
        .publish(&Event::DocumentUpdateEnabled(DocumentRef {
            document_id: doc.id.clone(),
        }))
        .await
        .unwrap();
    h.dispatcher.process_pending().await.unwrap();
    let hidden = h
        .vectors
        .count(&by_doc.clone().equal("document_enabled", false))
        .await
        .unwrap();
    assert_eq!(hidden, 2);

    h.dispatcher
        .publish(&Event::DocumentDelete(DocumentDelete {
            dataset_id: dataset_id.clone(),
            document_id: doc.id.clone(),
        }))
        .await
        .unwrap();
    h.dispatcher.process_pending().await.unwrap();
    assert!(h.store.get_document(&doc.id).await.unwrap().is_none());
    assert_eq!(h.vectors.count(&by_doc).await.unwrap(), 0);
}

#[tokio::test]
async fn test_dataset_delete_event_cascades() {
    let h = Harness::new();
    let (_, _, text) = two_paragraphs();
    let (dataset_id, doc) = h.ingest(&text, ProcessRuleRequest::Automatic).await;

    h.dispatcher
        .publish(&Event::DatasetDelete(DatasetDelete {
            dataset_id: dataset_id.clone(),
        }))
        .await
        .unwrap();
    h.dispatcher.process_pending().await.unwrap();

    assert!(h.store.get_document(&doc.id).await.unwrap().is_none());
    assert_eq!(h.vectors.count(&Filter::new()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_failing_handler_does_not_stall_topic() {
    let h = Harness::new();
    let (_, _, text) = two_paragraphs();
    let (_, document_id) = queued_document(&h, &text).await;

    // A document that does not exist, then one that does.
    h.dispatcher
        .publish(&Event::DocumentUpdateEnabled(DocumentRef {
            document_id: "missing".into(),
        }))
        .await
        .unwrap();
    h.bus
        .publish(TOPIC_DOCUMENT_BUILD, serde_json::json!({"wrong": true}))
        .await
        .unwrap();
    h.dispatcher
        .publish(&Event::build_document(document_id.clone()))
        .await
        .unwrap();

    assert_eq!(h.dispatcher.process_pending().await.unwrap(), 3);
    let doc = h.store.get_document(&document_id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
}

#[tokio::test]
async fn test_running_consumers_handle_app_auto_create() {
    let h = Harness::with_model(Arc::new(ScriptedModel::new("  You are a travel planner.  ")));
    h.dispatcher.start();
    h.dispatcher
        .publish(&Event::AppAutoCreate(AppAutoCreate {
            name: "Trip helper".into(),
            description: "Plans weekend trips".into(),
            account_id: ACCOUNT.into(),
        }))
        .await
        .unwrap();

    let mut apps = Vec::new();
    for _ in 0..100 {
        apps = h.apps.list(ACCOUNT).await.unwrap();
        if !apps.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    h.dispatcher.shutdown().await;

    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].name, "Trip helper");
    assert_eq!(apps[0].status, AppStatus::Draft);
    assert_eq!(apps[0].preset_prompt, "You are a travel planner.");
}

#[tokio::test]
async fn test_build_event_against_sqlite_store() {
    let dir = TempDir::new().unwrap();
    let pool = llmops::db::connect_path(&dir.path().join("llmops.sqlite"))
        .await
        .unwrap();
    llmops::migrate::migrate_pool(&pool).await.unwrap();
    let h = Harness::with_store(Arc::new(SqliteStore::new(pool.clone())));

    let (_, _, text) = two_paragraphs();
    let (dataset_id, document_id) = queued_document(&h, &text).await;
    h.dispatcher
        .publish(&Event::build_document(document_id.clone()))
        .await
        .unwrap();
    h.dispatcher.process_pending().await.unwrap();

    let doc = h.store.get_document(&document_id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
    let segments = h.store.list_segments_by_document(&document_id).await.unwrap();
    assert_eq!(segments.len(), 2);
    assert!(segments.iter().all(|s| s.dataset_id == dataset_id));

    pool.close().await;
}
