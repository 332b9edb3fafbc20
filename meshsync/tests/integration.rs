use std::sync::Arc;

use serde_json::json;
use meshsync::{
    ApplyVerdict, Change, ChangeKind, Config, ConflictHandler, ConflictType, DefaultResolution,
    EngineBuilder, HandlerVerdict, MemoryConflictSink, MemoryStore, NodeIdentity, RelationMeta,
    Resolution, Tuple,
};

fn node(sysid: u64) -> NodeIdentity {
    NodeIdentity::new(sysid, 1, 1)
}

fn tasks_relation() -> RelationMeta {
    RelationMeta {
        name: "tasks".into(),
        key_columns: vec!["id".into()],
        columns: vec!["id".into(), "v".into()],
    }
}

fn change(kind: ChangeKind, sysid: u64, commit_time: u64, v: &str) -> Change {
    let tuple = Tuple::from([("id", json!(1)), ("v", json!(v))]);
    Change {
        relation: "tasks".into(),
        kind,
        old: Some(tuple.clone()),
        new: Some(tuple),
        origin: node(sysid),
        remote_txid: 900,
        commit_lsn: commit_time,
        commit_time,
    }
}

fn row_key(change: &Change) -> meshsync::RowKey {
    change
        .key_image()
        .unwrap()
        .project_key(&["id".to_string()])
        .unwrap()
}

#[tokio::test]
async fn test_conflict_history_lands_in_sink() {
    let _ = env_logger::builder().is_test(true).try_init();

    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(MemoryConflictSink::new());
    let engine = EngineBuilder::new(node(1))
        .with_config(Config {
            log_conflicts_to_table: true,
            conflict_logging_include_tuples: true,
            ..Config::default()
        })
        .with_tuple_store(store.clone())
        .with_conflict_sink(sink.clone())
        .build();
    engine.register_relation(tasks_relation());

    let worker = engine.apply_worker(node(2));
    let first = change(ChangeKind::Insert, 2, 100, "a");
    let second = change(ChangeKind::Insert, 3, 105, "b");
    worker.apply(&first).await.unwrap();
    worker.apply(&second).await.unwrap();

    // Last writer wins on the row.
    assert_eq!(
        store.get("tasks", &row_key(&first)).unwrap().get("v"),
        Some(&json!("b"))
    );

    // Exactly one conflict, fully recorded.
    let records = sink.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.kind, ConflictType::InsertInsert);
    assert_eq!(record.resolution, Resolution::LastWriterWinsRemote);
    assert_eq!(record.local_origin, Some(node(2)));
    assert_eq!(record.remote_origin, node(3));
    assert!(record.local_tuple.is_some());
    assert!(record.remote_tuple.is_some());

    let stats = engine.conflict_stats();
    assert_eq!(stats.insert_insert, 1);
    assert_eq!(stats.inserts, 2);
}

#[tokio::test]
async fn test_handler_merges_conflicting_inserts() {
    let store = Arc::new(MemoryStore::new());
    let engine = EngineBuilder::new(node(1))
        .with_tuple_store(store.clone())
        .build();
    engine.register_relation(tasks_relation());
    engine.register_handler(
        "tasks",
        ConflictHandler::new("merge-v", ConflictType::InsertInsert, None, |_, local, remote| {
            // Keep the lexically larger value, whatever side it came from.
            let pick = |t: Option<&Tuple>| {
                t.and_then(|t| t.get("v"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string()
            };
            let winner = pick(local).max(pick(remote));
            Ok(HandlerVerdict::Replace(Tuple::from([
                ("id", json!(1)),
                ("v", json!(winner)),
            ])))
        }),
    );

    let worker = engine.apply_worker(node(2));
    worker
        .apply(&change(ChangeKind::Insert, 2, 100, "zebra"))
        .await
        .unwrap();
    // The remote side committed later but the handler keeps "zebra".
    worker
        .apply(&change(ChangeKind::Insert, 3, 105, "apple"))
        .await
        .unwrap();

    let key = row_key(&change(ChangeKind::Insert, 2, 100, "zebra"));
    assert_eq!(
        store.get("tasks", &key).unwrap().get("v"),
        Some(&json!("zebra"))
    );
}

#[tokio::test]
async fn test_default_skip_policy_applies_to_insert_update() {
    let store = Arc::new(MemoryStore::new());
    let engine = EngineBuilder::new(node(1))
        .with_config(Config {
            default_resolution: DefaultResolution::Skip,
            ..Config::default()
        })
        .with_tuple_store(store.clone())
        .build();
    engine.register_relation(tasks_relation());
    let worker = engine.apply_worker(node(2));

    // Insert, delete, then an update that outlives the delete: insert-update
    // conflict, which the default policy decides.
    worker
        .apply(&change(ChangeKind::Insert, 2, 100, "a"))
        .await
        .unwrap();
    worker
        .apply(&change(ChangeKind::Delete, 2, 200, "a"))
        .await
        .unwrap();
    let verdict = worker
        .apply(&change(ChangeKind::Update, 3, 300, "resurrected"))
        .await
        .unwrap();

    assert_eq!(verdict, ApplyVerdict::Skipped);
    assert_eq!(store.live_rows("tasks"), 0);
    assert_eq!(engine.conflict_stats().insert_update, 1);
}

#[tokio::test]
async fn test_default_apply_resurrects_after_stale_delete() {
    let store = Arc::new(MemoryStore::new());
    let engine = EngineBuilder::new(node(1))
        .with_tuple_store(store.clone())
        .build();
    engine.register_relation(tasks_relation());
    let worker = engine.apply_worker(node(2));

    worker
        .apply(&change(ChangeKind::Insert, 2, 100, "a"))
        .await
        .unwrap();
    worker
        .apply(&change(ChangeKind::Delete, 2, 200, "a"))
        .await
        .unwrap();
    let update = change(ChangeKind::Update, 3, 300, "resurrected");
    assert_eq!(worker.apply(&update).await.unwrap(), ApplyVerdict::Applied);

    assert_eq!(
        store.get("tasks", &row_key(&update)).unwrap().get("v"),
        Some(&json!("resurrected"))
    );
}

#[tokio::test]
async fn test_pause_blocks_apply_until_resumed() {
    let store = Arc::new(MemoryStore::new());
    let engine = EngineBuilder::new(node(1))
        .with_tuple_store(store.clone())
        .build();
    engine.register_relation(tasks_relation());
    let worker = Arc::new(engine.apply_worker(node(2)));

    engine.workers().pause_apply(true);
    let worker2 = worker.clone();
    let pending = tokio::spawn(async move {
        worker2
            .apply(&change(ChangeKind::Insert, 2, 100, "a"))
            .await
            .unwrap()
    });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!pending.is_finished());

    engine.workers().pause_apply(false);
    assert_eq!(pending.await.unwrap(), ApplyVerdict::Applied);
    assert_eq!(store.live_rows("tasks"), 1);
}

#[tokio::test]
async fn test_conflict_counters_by_type() {
    let engine = EngineBuilder::new(node(1)).build();
    engine.register_relation(tasks_relation());
    let worker = engine.apply_worker(node(2));

    worker
        .apply(&change(ChangeKind::Insert, 2, 100, "a"))
        .await
        .unwrap();
    // insert-insert
    worker
        .apply(&change(ChangeKind::Insert, 3, 105, "b"))
        .await
        .unwrap();
    // update-update
    worker
        .apply(&change(ChangeKind::Update, 4, 110, "c"))
        .await
        .unwrap();
    // delete, then delete-delete from another origin
    worker
        .apply(&change(ChangeKind::Delete, 4, 120, "c"))
        .await
        .unwrap();
    worker
        .apply(&change(ChangeKind::Delete, 3, 125, "c"))
        .await
        .unwrap();

    let stats = engine.conflict_stats();
    assert_eq!(stats.insert_insert, 1);
    assert_eq!(stats.update_update, 1);
    assert_eq!(stats.delete_delete, 1);
    assert_eq!(stats.total_conflicts(), 3);
}
