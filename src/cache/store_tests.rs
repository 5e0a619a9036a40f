//! Tests for the cache store decision logic and persistence

use super::store::CacheStore;
use super::types::{CacheState, CacheStatus, StepStatus};
use crate::events::{CacheEvent, EventKind, FnListener};
use futures::FutureExt;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn create_test_store() -> (CacheStore, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let store = CacheStore::at_path(temp_dir.path().join("workflow-state.json"));
    (store, temp_dir)
}

fn inputs() -> Value {
    json!({
        "texts": [{"id": "t1", "content": "hello"}, {"id": "t2", "content": "world"}],
        "outputDir": "/tmp/out"
    })
}

fn record_events(store: &CacheStore) -> Arc<Mutex<Vec<CacheEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    for kind in [EventKind::BlockInvalidated, EventKind::CacheCleared] {
        let seen = Arc::clone(&seen);
        store.events().on(
            kind,
            Arc::new(FnListener::new(move |event| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(event);
                    Ok::<(), anyhow::Error>(())
                }
                .boxed()
            })),
        );
    }
    seen
}

fn read_state(store: &CacheStore) -> CacheState {
    let content = std::fs::read_to_string(store.state_path()).unwrap();
    serde_json::from_str(&content).unwrap()
}

#[tokio::test]
async fn test_unknown_block_starts_fresh() {
    let (store, _temp) = create_test_store();
    store.initialize().await.unwrap();

    let decision = store.can_skip_block("generate-audio", &inputs()).await.unwrap();
    assert!(!decision.can_skip);
    assert!(!decision.should_resume);
    assert!(decision.completed_steps.is_empty());
}

#[tokio::test]
async fn test_completed_block_is_skipped() {
    let (store, _temp) = create_test_store();
    store.initialize().await.unwrap();

    store.start_block("generate-audio", &inputs(), None).await.unwrap();
    store
        .complete_block("generate-audio", json!({"audioFiles": ["a.mp3"]}))
        .await;

    let decision = store.can_skip_block("generate-audio", &inputs()).await.unwrap();
    assert!(decision.can_skip);
    assert_eq!(decision.outputs, Some(json!({"audioFiles": ["a.mp3"]})));
    assert_eq!(decision.progress, Some(100.0));
}

#[tokio::test]
async fn test_key_order_does_not_invalidate() {
    let (store, _temp) = create_test_store();
    store.initialize().await.unwrap();

    store
        .start_block("b", &json!({"a": 1, "b": {"x": 1, "y": 2}}), None)
        .await
        .unwrap();
    store.complete_block("b", json!("done")).await;

    let decision = store
        .can_skip_block("b", &json!({"b": {"y": 2, "x": 1}, "a": 1}))
        .await
        .unwrap();
    assert!(decision.can_skip);
}

#[tokio::test]
async fn test_failed_block_with_steps_resumes() {
    let (store, _temp) = create_test_store();
    store.initialize().await.unwrap();

    store.start_block("generate-audio", &inputs(), None).await.unwrap();
    store
        .complete_step("generate-audio", "audio-t1", json!({"file": "t1.mp3"}), vec!["f1".into()])
        .await;
    store
        .update_block_progress("generate-audio", 50.0, Some(json!({"completedCount": 1})))
        .await;
    store.fail_block("generate-audio", "quota exceeded").await;

    let decision = store.can_skip_block("generate-audio", &inputs()).await.unwrap();
    assert!(!decision.can_skip);
    assert!(decision.should_resume);
    assert_eq!(decision.completed_steps, vec!["audio-t1".to_string()]);
    assert_eq!(decision.resume_data, Some(json!({"completedCount": 1})));
    assert_eq!(decision.progress, Some(50.0));

    let block = store.block("generate-audio").await.unwrap();
    assert_eq!(block.status, CacheStatus::Failed);
    assert_eq!(block.error.as_deref(), Some("quota exceeded"));
}

#[tokio::test]
async fn test_in_progress_block_without_work_starts_fresh() {
    let (store, _temp) = create_test_store();
    store.initialize().await.unwrap();

    store.start_block("b", &inputs(), None).await.unwrap();

    let decision = store.can_skip_block("b", &inputs()).await.unwrap();
    assert!(!decision.can_skip);
    assert!(!decision.should_resume);
}

#[tokio::test]
async fn test_changed_inputs_invalidate_and_emit_file_ids() {
    let (store, _temp) = create_test_store();
    store.initialize().await.unwrap();
    let seen = record_events(&store);

    store.start_block("generate-audio", &inputs(), None).await.unwrap();
    store
        .complete_step("generate-audio", "audio-t1", json!(1), vec!["f1".into()])
        .await;
    store
        .complete_step("generate-audio", "audio-t2", json!(2), vec!["f2".into()])
        .await;
    store.complete_block("generate-audio", json!({"n": 2})).await;

    let mut changed = inputs();
    changed["texts"][1]["content"] = json!("world!");
    let decision = store.can_skip_block("generate-audio", &changed).await.unwrap();

    assert!(!decision.can_skip);
    assert!(!decision.should_resume);
    assert!(store.block("generate-audio").await.is_none());

    let events = seen.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![CacheEvent::BlockInvalidated {
            block_id: "generate-audio".to_string(),
            file_ids: vec!["f1".to_string(), "f2".to_string()],
        }]
    );
}

#[tokio::test]
async fn test_complete_step_merges_file_ids_without_duplicates() {
    let (store, _temp) = create_test_store();
    store.initialize().await.unwrap();

    store.start_block("b", &inputs(), None).await.unwrap();
    store
        .complete_step("b", "s1", json!(null), vec!["f1".into(), "f2".into()])
        .await;
    store
        .complete_step("b", "s2", json!(null), vec!["f2".into(), "f3".into()])
        .await;

    let block = store.block("b").await.unwrap();
    assert_eq!(block.file_ids, vec!["f1", "f2", "f3"]);
    assert_eq!(block.steps["s2"].file_ids, vec!["f2", "f3"]);
}

#[tokio::test]
async fn test_step_lookup() {
    let (store, _temp) = create_test_store();
    store.initialize().await.unwrap();

    store.start_block("b", &inputs(), None).await.unwrap();
    store.complete_step("b", "ok", json!({"v": 1}), vec![]).await;
    store.fail_step("b", "bad", "network down").await;

    let hit = store.is_step_completed("b", "ok").await;
    assert!(hit.completed);
    assert_eq!(hit.data, Some(json!({"v": 1})));

    let failed = store.is_step_completed("b", "bad").await;
    assert!(!failed.completed);
    assert_eq!(
        store.block("b").await.unwrap().steps["bad"].data,
        json!({"error": "network down"})
    );
    assert_eq!(
        store.block("b").await.unwrap().steps["bad"].status,
        StepStatus::Failed
    );

    assert!(!store.is_step_completed("b", "missing").await.completed);
    assert!(!store.is_step_completed("other", "ok").await.completed);
}

#[tokio::test]
async fn test_progress_is_clamped() {
    let (store, _temp) = create_test_store();
    store.initialize().await.unwrap();
    store.start_block("b", &inputs(), None).await.unwrap();

    store.update_block_progress("b", 150.0, None).await;
    assert_eq!(store.block("b").await.unwrap().progress, 100.0);

    store.update_block_progress("b", -5.0, None).await;
    assert_eq!(store.block("b").await.unwrap().progress, 0.0);
}

#[tokio::test]
async fn test_operations_on_unknown_block_are_ignored() {
    let (store, _temp) = create_test_store();
    store.initialize().await.unwrap();

    store.complete_step("ghost", "s", json!(1), vec!["f".into()]).await;
    store.update_block_progress("ghost", 10.0, None).await;
    store.complete_block("ghost", json!(1)).await;
    store.fail_block("ghost", "x").await;

    assert!(store.block_ids().await.is_empty());
    assert!(store.invalidate_block("ghost").await.is_empty());
}

#[tokio::test]
async fn test_restart_with_same_inputs_keeps_steps() {
    let (store, _temp) = create_test_store();
    store.initialize().await.unwrap();

    store.start_block("b", &inputs(), None).await.unwrap();
    store.complete_step("b", "s1", json!(1), vec!["f1".into()]).await;
    store.fail_block("b", "boom").await;

    store
        .start_block("b", &inputs(), Some(json!({"completedCount": 1})))
        .await
        .unwrap();
    let block = store.block("b").await.unwrap();
    assert_eq!(block.status, CacheStatus::InProgress);
    assert!(block.steps.contains_key("s1"));
    assert_eq!(block.file_ids, vec!["f1"]);
    assert_eq!(block.resume_data, Some(json!({"completedCount": 1})));
}

#[tokio::test]
async fn test_state_survives_reload() {
    let (store, temp) = create_test_store();
    store.initialize().await.unwrap();
    store.start_block("b", &inputs(), None).await.unwrap();
    store.complete_step("b", "s1", json!("x"), vec!["f1".into()]).await;
    store.complete_block("b", json!({"ok": true})).await;

    let reloaded = CacheStore::at_path(temp.path().join("workflow-state.json"));
    reloaded.initialize().await.unwrap();

    let decision = reloaded.can_skip_block("b", &inputs()).await.unwrap();
    assert!(decision.can_skip);
    assert_eq!(reloaded.block("b").await.unwrap().file_ids, vec!["f1"]);
}

#[tokio::test]
async fn test_state_file_is_always_complete() {
    let (store, temp) = create_test_store();
    store.initialize().await.unwrap();

    store.start_block("b", &inputs(), None).await.unwrap();
    for i in 0..10 {
        store
            .complete_step("b", &format!("s{i}"), json!(i), vec![format!("f{i}")])
            .await;
        let state = read_state(&store);
        assert_eq!(state.blocks["b"].steps.len(), i + 1);
    }

    let leftovers: Vec<String> = std::fs::read_dir(temp.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".tmp."))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_corrupted_state_starts_fresh_with_backup() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("workflow-state.json");
    std::fs::write(&path, "{ not json").unwrap();

    let store = CacheStore::at_path(&path);
    store.initialize().await.unwrap();
    assert!(store.block_ids().await.is_empty());

    let backups = std::fs::read_dir(temp.path())
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .contains(".corrupted.")
        })
        .count();
    assert_eq!(backups, 1);
}

#[tokio::test]
async fn test_clear_cache_emits_every_file() {
    let (store, _temp) = create_test_store();
    store.initialize().await.unwrap();
    let seen = record_events(&store);

    store.start_block("a", &json!(1), None).await.unwrap();
    store.complete_step("a", "s", json!(1), vec!["fa".into()]).await;
    store.start_block("b", &json!(2), None).await.unwrap();
    store.complete_step("b", "s", json!(1), vec!["fb".into()]).await;

    let cleared = store.clear_cache().await;
    assert_eq!(cleared, vec!["fa", "fb"]);
    assert!(store.block_ids().await.is_empty());
    assert_eq!(
        seen.lock().unwrap().clone(),
        vec![CacheEvent::CacheCleared {
            file_ids: vec!["fa".to_string(), "fb".to_string()]
        }]
    );
    assert!(read_state(&store).blocks.is_empty());
}

#[tokio::test]
async fn test_keyed_steps_survive_invalidation() {
    let (store, _temp) = create_test_store();
    store.initialize().await.unwrap();

    store.start_block("b", &json!({"v": 1}), None).await.unwrap();
    store
        .complete_keyed_step("b", "s1", "hash-1", json!("one"), vec![])
        .await;
    store
        .complete_keyed_step("b", "s2", "hash-2", json!("two"), vec!["f2".into()])
        .await;
    store.complete_block("b", json!("done")).await;

    let decision = store.can_skip_block("b", &json!({"v": 2})).await.unwrap();
    assert!(!decision.can_skip);
    store.start_block("b", &json!({"v": 2}), None).await.unwrap();

    let reused = store.lookup_keyed_step("b", "s1", "hash-1").await;
    assert!(reused.completed);
    assert_eq!(reused.data, Some(json!("one")));
    assert!(store.block("b").await.unwrap().steps.contains_key("s1"));

    // steps that own files are never carried over
    assert!(!store.lookup_keyed_step("b", "s2", "hash-2").await.completed);
}

#[tokio::test]
async fn test_keyed_step_with_other_fingerprint_misses() {
    let (store, _temp) = create_test_store();
    store.initialize().await.unwrap();

    store.start_block("b", &json!({"v": 1}), None).await.unwrap();
    store
        .complete_keyed_step("b", "s1", "hash-1", json!("one"), vec![])
        .await;
    store.invalidate_block("b").await;
    store.start_block("b", &json!({"v": 2}), None).await.unwrap();

    assert!(!store.lookup_keyed_step("b", "s1", "hash-other").await.completed);
}

#[tokio::test]
async fn test_workflow_summary() {
    let (store, _temp) = create_test_store();
    store.initialize().await.unwrap();

    store.start_block("a", &json!(1), None).await.unwrap();
    store.complete_block("a", json!(1)).await;
    store.start_block("b", &json!(2), None).await.unwrap();
    store.update_block_progress("b", 50.0, None).await;
    store.start_block("c", &json!(3), None).await.unwrap();
    store.fail_block("c", "x").await;

    let summary = store.workflow_summary().await;
    assert_eq!(summary.total_blocks, 3);
    assert_eq!(summary.completed_blocks, 1);
    assert_eq!(summary.in_progress_blocks, 1);
    assert_eq!(summary.failed_blocks, 1);
    assert_eq!(summary.overall_progress, 50);
    assert_eq!(store.block_ids().await, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_initialize_is_idempotent() {
    let (store, _temp) = create_test_store();
    store.initialize().await.unwrap();
    store.start_block("b", &json!(1), None).await.unwrap();
    store.initialize().await.unwrap();

    assert_eq!(store.block_ids().await, vec!["b"]);
}

#[tokio::test]
async fn test_resumed_block_drops_failure_details() {
    let (store, _temp) = create_test_store();
    store.initialize().await.unwrap();

    store.start_block("b", &inputs(), None).await.unwrap();
    store.complete_step("b", "s1", json!("one"), vec!["f1".to_string()]).await;
    store.update_block_progress("b", 50.0, None).await;
    store.fail_block("b", "boom").await;

    store.start_block("b", &inputs(), None).await.unwrap();
    let block = store.block("b").await.unwrap();
    assert_eq!(block.status, CacheStatus::InProgress);
    assert!(block.error.is_none());
    assert!(block.end_time.is_none());
    assert!(block.outputs.is_none());
    assert!(block.steps.contains_key("s1"));
    assert_eq!(block.file_ids, vec!["f1"]);
    assert_eq!(block.progress, 50.0);

    store.complete_block("b", json!({"ok": true})).await;
    let block = &read_state(&store).blocks["b"];
    assert_eq!(block.status, CacheStatus::Completed);
    assert!(block.error.is_none());
    assert_eq!(block.outputs, Some(json!({"ok": true})));
    assert!(block.end_time.is_some());
}

#[tokio::test]
async fn test_restart_of_completed_block_clears_stale_outputs() {
    let (store, _temp) = create_test_store();
    store.start_block("b", &inputs(), None).await.unwrap();
    store.complete_block("b", json!([1, 2])).await;

    store.start_block("b", &inputs(), None).await.unwrap();
    let block = store.block("b").await.unwrap();
    assert_eq!(block.status, CacheStatus::InProgress);
    assert!(block.outputs.is_none());
    assert!(block.end_time.is_none());
}

#[tokio::test]
async fn test_progress_does_not_reopen_completed_block() {
    let (store, _temp) = create_test_store();
    store.start_block("b", &inputs(), None).await.unwrap();
    store.complete_block("b", json!("done")).await;

    store.update_block_progress("b", 10.0, None).await;

    let decision = store.can_skip_block("b", &inputs()).await.unwrap();
    assert!(decision.can_skip);
    assert_eq!(store.block("b").await.unwrap().status, CacheStatus::Completed);
}

#[tokio::test]
async fn test_progress_reopens_failed_block() {
    let (store, _temp) = create_test_store();
    store.start_block("b", &inputs(), None).await.unwrap();
    store.fail_block("b", "boom").await;

    store.update_block_progress("b", 30.0, None).await;

    let block = store.block("b").await.unwrap();
    assert_eq!(block.status, CacheStatus::InProgress);
    assert!(block.error.is_none());
}

#[tokio::test]
async fn test_unwritable_state_location_keeps_working_in_memory() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("notadir"), "plain file").unwrap();
    let store = CacheStore::at_path(
        temp.path()
            .join("notadir")
            .join("cache")
            .join("workflow-state.json"),
    );

    store.initialize().await.unwrap();
    store.start_block("b", &inputs(), None).await.unwrap();
    store.complete_step("b", "s1", json!(1), vec![]).await;
    store.complete_block("b", json!("done")).await;

    assert!(store.is_step_completed("b", "s1").await.completed);
    let decision = store.can_skip_block("b", &inputs()).await.unwrap();
    assert!(decision.can_skip);
    assert_eq!(decision.outputs, Some(json!("done")));
    assert!(!store.state_path().exists());
}
