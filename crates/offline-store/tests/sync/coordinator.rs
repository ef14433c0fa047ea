use std::sync::Arc;

use futures::StreamExt;
use serde_json::{json, Value};

use offline_store::config::SyncConfig;
use offline_store::error::{RemoteError, RemoteErrorKind, StoreError, SyncError};
use offline_store::query::Query;
use offline_store::remote::{DeltaSet, RemoteStore, ResponseMeta};
use offline_store::storage::Storage;
use offline_store::types::{is_local, AutoPagination, PushError, SyncEvent, SyncOptions};
use offline_store::SyncCoordinator;

use super::mock_remote::{not_found, Call, MockRemote};

// ============================================================================
// Helpers
// ============================================================================

async fn setup_with(remote: MockRemote, config: SyncConfig) -> (SyncCoordinator, Arc<MockRemote>) {
    let remote = Arc::new(remote);
    let dyn_remote: Arc<dyn RemoteStore> = remote.clone();
    let coordinator = SyncCoordinator::open(
        &Storage::in_memory(),
        "app",
        "books",
        None,
        dyn_remote,
        config,
    )
    .await
    .unwrap();
    (coordinator, remote)
}

async fn setup(remote: MockRemote) -> (SyncCoordinator, Arc<MockRemote>) {
    setup_with(remote, SyncConfig::default()).await
}

fn offline() -> SyncOptions {
    SyncOptions::default()
}

fn online() -> SyncOptions {
    SyncOptions::default().auto_sync(true)
}

async fn create_local(coordinator: &SyncCoordinator, entity: Value) -> Value {
    let mut items: Vec<_> = coordinator.create(entity, offline()).collect().await;
    assert_eq!(items.len(), 1);
    items.remove(0).unwrap()
}

async fn update_local(coordinator: &SyncCoordinator, entity: Value) -> Value {
    let mut items: Vec<_> = coordinator.update(entity, offline()).collect().await;
    assert_eq!(items.len(), 1);
    items.remove(0).unwrap()
}

fn id_of(doc: &Value) -> String {
    doc["_id"].as_str().unwrap().to_string()
}

// ============================================================================
// Create / push
// ============================================================================

#[tokio::test]
async fn create_then_push_swaps_local_id_for_server_id() {
    let (coordinator, remote) = setup(MockRemote::new()).await;

    let saved = create_local(&coordinator, json!({ "title": "Dune" })).await;
    let local_id = id_of(&saved);
    assert!(is_local(&saved));
    assert!(saved["_kmd"]["lmt"].is_string());
    assert_eq!(coordinator.cache().count(None).await.unwrap(), 1);

    let pending = coordinator.pending_sync_entities(None).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, local_id);
    assert_eq!(pending[0].event, SyncEvent::Create);

    let results = coordinator.push(None).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].is_ok());
    assert_eq!(results[0].id, local_id);
    assert_eq!(results[0].event, SyncEvent::Create);
    assert_eq!(results[0].entity.as_ref().unwrap()["_id"], "r1");

    // The local id never leaves the device.
    let calls = remote.calls();
    let Call::Create(sent) = &calls[0] else {
        panic!("expected a create call");
    };
    assert!(sent.get("_id").is_none());
    assert!(!is_local(sent));
    assert_eq!(sent["title"], "Dune");

    let cached = coordinator.cache().find(None).await.unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0]["_id"], "r1");
    assert!(!is_local(&cached[0]));
    assert_eq!(coordinator.cache().get(&local_id).await.unwrap(), None);
    assert_eq!(coordinator.pending_sync_count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn create_with_auto_sync_emits_local_then_confirmed() {
    let (coordinator, _remote) = setup(MockRemote::new()).await;

    let items: Vec<_> = coordinator
        .create(json!({ "title": "Emma" }), online())
        .collect()
        .await;
    assert_eq!(items.len(), 2);
    let local = items[0].as_ref().unwrap();
    let confirmed = items[1].as_ref().unwrap();
    assert!(is_local(local));
    assert_eq!(confirmed["_id"], "r1");

    let cached = coordinator.cache().find(None).await.unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0]["_id"], "r1");
    assert_eq!(coordinator.pending_sync_count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn create_keeps_a_caller_supplied_id() {
    let (coordinator, remote) = setup(MockRemote::new()).await;

    let saved = create_local(&coordinator, json!({ "_id": "mine", "title": "x" })).await;
    assert!(!is_local(&saved));

    coordinator.push(None).await.unwrap();
    // Not local, so it is sent as an update carrying the id.
    assert_eq!(remote.count_calls(|c| matches!(c, Call::Update(_))), 1);
    assert_eq!(remote.docs()[0]["_id"], "mine");
}

#[tokio::test]
async fn update_requires_an_id() {
    let (coordinator, _remote) = setup(MockRemote::new()).await;

    let items: Vec<_> = coordinator
        .update(json!({ "title": "anonymous" }), offline())
        .collect()
        .await;
    assert_eq!(items.len(), 1);
    let err = items.into_iter().next().unwrap().unwrap_err();
    assert!(matches!(err, StoreError::Sync(SyncError::MissingId { .. })), "{err}");
    assert_eq!(coordinator.cache().count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn create_then_update_is_pushed_as_one_create() {
    let (coordinator, remote) = setup(MockRemote::new()).await;

    let mut saved = create_local(&coordinator, json!({ "title": "draft" })).await;
    saved["title"] = json!("final");
    update_local(&coordinator, saved).await;

    let pending = coordinator.pending_sync_entities(None).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].event, SyncEvent::Update);

    let results = coordinator.push(None).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].is_ok());
    assert_eq!(remote.count_calls(|c| matches!(c, Call::Create(_))), 1);
    assert_eq!(remote.count_calls(|c| matches!(c, Call::Update(_))), 0);
    assert_eq!(remote.docs()[0]["title"], "final");
}

#[tokio::test]
async fn push_reports_failures_per_record() {
    let (coordinator, remote) = setup(MockRemote::new()).await;
    remote.on_update(|doc| {
        (doc["_id"] == "b").then(|| Err(RemoteError::new(RemoteErrorKind::Rejected, "rejected")))
    });
    for id in ["a", "b", "c"] {
        update_local(&coordinator, json!({ "_id": id })).await;
    }

    let results = coordinator.push(None).await.unwrap();
    assert_eq!(results.len(), 3);
    let failed: Vec<_> = results.iter().filter(|r| !r.is_ok()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, "b");
    assert!(matches!(
        failed[0].error,
        Some(PushError::Remote(RemoteError {
            kind: RemoteErrorKind::Rejected,
            ..
        }))
    ));

    let pending = coordinator.pending_sync_entities(None).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "b");
}

#[tokio::test]
async fn push_replays_every_batch() {
    let config = SyncConfig {
        push_batch_size: 2,
        ..SyncConfig::default()
    };
    let (coordinator, remote) = setup_with(MockRemote::new(), config).await;
    for i in 0..5 {
        update_local(&coordinator, json!({ "_id": format!("e{i}") })).await;
    }

    let results = coordinator.push(None).await.unwrap();
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(remote.count_calls(|c| matches!(c, Call::Update(_))), 5);
    assert_eq!(coordinator.pending_sync_count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn push_with_query_only_replays_matching_entities() {
    let (coordinator, remote) = setup(MockRemote::new()).await;
    update_local(&coordinator, json!({ "_id": "a", "genre": "sf" })).await;
    update_local(&coordinator, json!({ "_id": "b", "genre": "fantasy" })).await;

    let results = coordinator
        .push(Some(&Query::new().equal_to("genre", "sf")))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, "a");
    assert_eq!(remote.docs().len(), 1);
    assert_eq!(coordinator.pending_sync_count(None).await.unwrap(), 1);
}

#[tokio::test]
async fn record_without_cached_entity_is_dropped() {
    let (coordinator, remote) = setup(MockRemote::new()).await;
    coordinator
        .sync_log()
        .add_mutation(SyncEvent::Update, &json!({ "_id": "ghost" }))
        .await
        .unwrap();

    let results = coordinator.push(None).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].error, Some(PushError::MissingEntity));
    assert_eq!(coordinator.pending_sync_count(None).await.unwrap(), 0);
    assert!(remote.calls().is_empty());
}

#[tokio::test]
async fn slow_remote_times_out_and_keeps_the_record() {
    let config = SyncConfig {
        remote_timeout_ms: Some(50),
        ..SyncConfig::default()
    };
    let (coordinator, remote) = setup_with(MockRemote::new(), config).await;
    // Never released.
    let _gate = remote.gate_creates();
    create_local(&coordinator, json!({ "title": "slow" })).await;

    let results = coordinator.push(None).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(matches!(
        results[0].error,
        Some(PushError::Remote(RemoteError {
            kind: RemoteErrorKind::Timeout,
            ..
        }))
    ));
    assert_eq!(coordinator.pending_sync_count(None).await.unwrap(), 1);
    assert_eq!(coordinator.cache().count(None).await.unwrap(), 1);
}

// ============================================================================
// Races with in-flight creates
// ============================================================================

#[tokio::test]
async fn delete_during_create_schedules_remote_delete() {
    let (coordinator, remote) = setup(MockRemote::new()).await;
    let gate = remote.gate_creates();
    let saved = create_local(&coordinator, json!({ "title": "doomed" })).await;
    let local_id = id_of(&saved);

    let racer = async {
        gate.entered.notified().await;
        let removed = coordinator.remove_by_id(&local_id, offline()).await.unwrap();
        assert_eq!(removed, 1);
        gate.release.notify_one();
    };
    let (results, ()) = tokio::join!(coordinator.push(None), racer);
    let results = results.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].is_ok());

    assert_eq!(coordinator.cache().count(None).await.unwrap(), 0);
    let pending = coordinator.pending_sync_entities(None).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "r1");
    assert_eq!(pending[0].event, SyncEvent::Delete);

    // The next push removes the orphan remotely.
    let results = coordinator.push(None).await.unwrap();
    assert!(results[0].is_ok());
    assert!(remote.docs().is_empty());
}

#[tokio::test]
async fn edit_during_create_survives_under_server_id() {
    let (coordinator, remote) = setup(MockRemote::new()).await;
    let gate = remote.gate_creates();
    let saved = create_local(&coordinator, json!({ "title": "v1" })).await;
    let local_id = id_of(&saved);

    let racer = async {
        gate.entered.notified().await;
        let mut edited = saved.clone();
        edited["title"] = json!("v2");
        update_local(&coordinator, edited).await;
        gate.release.notify_one();
    };
    let (results, ()) = tokio::join!(coordinator.push(None), racer);
    assert!(results.unwrap()[0].is_ok());

    let cached = coordinator.cache().find(None).await.unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0]["_id"], "r1");
    assert_eq!(cached[0]["title"], "v2");
    assert!(!is_local(&cached[0]));
    assert_eq!(coordinator.cache().get(&local_id).await.unwrap(), None);

    let pending = coordinator.pending_sync_entities(None).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "r1");

    // The edit goes out as an update of the server entity.
    coordinator.push(None).await.unwrap();
    assert_eq!(remote.docs().len(), 1);
    assert_eq!(remote.docs()[0]["title"], "v2");
    assert_eq!(coordinator.pending_sync_count(None).await.unwrap(), 0);
}

// ============================================================================
// Deletes
// ============================================================================

#[tokio::test]
async fn deleting_an_unpushed_entity_leaves_nothing_to_sync() {
    let (coordinator, remote) = setup(MockRemote::new()).await;
    let saved = create_local(&coordinator, json!({ "title": "typo" })).await;

    let removed = coordinator.remove_by_id(&id_of(&saved), online()).await.unwrap();
    assert_eq!(removed, 1);
    assert_eq!(coordinator.pending_sync_count(None).await.unwrap(), 0);
    assert!(remote.calls().is_empty());
}

#[tokio::test]
async fn remove_with_auto_sync_subtracts_remote_failures() {
    let docs = vec![json!({ "_id": "a" }), json!({ "_id": "b" }), json!({ "_id": "c" })];
    let (coordinator, remote) = setup(MockRemote::with_docs(docs.clone())).await;
    coordinator.cache().save_many(docs).await.unwrap();
    remote.on_remove(|id| {
        (id == "b").then(|| Err(RemoteError::new(RemoteErrorKind::Network, "offline")))
    });

    let removed = coordinator.remove(None, online()).await.unwrap();
    assert_eq!(removed, 2);
    assert_eq!(coordinator.cache().count(None).await.unwrap(), 0);
    assert_eq!(remote.docs(), vec![json!({ "_id": "b" })]);

    let pending = coordinator.pending_sync_entities(None).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "b");
    assert_eq!(pending[0].event, SyncEvent::Delete);
}

#[tokio::test]
async fn remote_not_found_on_delete_counts_as_done() {
    let (coordinator, remote) = setup(MockRemote::new()).await;
    coordinator.cache().save(json!({ "_id": "gone" })).await.unwrap();

    let removed = coordinator.remove_by_id("gone", online()).await.unwrap();
    assert_eq!(removed, 1);
    assert_eq!(remote.calls(), vec![Call::RemoveById("gone".to_string())]);
    assert_eq!(coordinator.pending_sync_count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn remove_by_id_of_missing_entity_is_not_found() {
    let (coordinator, _remote) = setup(MockRemote::new()).await;
    let err = coordinator.remove_by_id("nope", offline()).await.unwrap_err();
    assert!(err.is_not_found(), "{err}");
}

#[tokio::test]
async fn remove_is_offline_by_default() {
    let (coordinator, remote) = setup(MockRemote::with_docs(vec![json!({ "_id": "a" })])).await;
    coordinator.cache().save(json!({ "_id": "a", "n": 1 })).await.unwrap();

    let removed = coordinator
        .remove(Some(&Query::new().equal_to("n", 1)), offline())
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(remote.calls().is_empty());
    assert_eq!(coordinator.pending_sync_count(None).await.unwrap(), 1);
}

// ============================================================================
// Pull
// ============================================================================

#[tokio::test]
async fn pull_refuses_to_overwrite_pending_changes() {
    let (coordinator, remote) = setup(MockRemote::new()).await;
    create_local(&coordinator, json!({ "title": "unsent" })).await;

    let err = coordinator.pull(None, offline()).await.unwrap_err();
    assert!(
        matches!(err, StoreError::Sync(SyncError::DirtyState { count: 1, .. })),
        "{err}"
    );
    assert!(remote.calls().is_empty());

    let result = coordinator.sync(None, offline()).await.unwrap();
    assert_eq!(result.push.len(), 1);
    assert_eq!(result.pull, 1);
    assert_eq!(coordinator.cache().count(None).await.unwrap(), 1);
}

#[tokio::test]
async fn pull_can_push_first() {
    let (coordinator, remote) = setup(MockRemote::with_docs(vec![json!({ "_id": "x" })])).await;
    update_local(&coordinator, json!({ "_id": "y" })).await;

    let received = coordinator
        .pull(None, offline().push_first(true))
        .await
        .unwrap();
    assert_eq!(received, 2);
    assert_eq!(coordinator.pending_sync_count(None).await.unwrap(), 0);
    assert_eq!(remote.docs().len(), 2);
}

#[tokio::test]
async fn push_first_fails_while_records_remain() {
    let (coordinator, remote) = setup(MockRemote::new()).await;
    remote.on_update(|_| Some(Err(RemoteError::new(RemoteErrorKind::Network, "offline"))));
    update_local(&coordinator, json!({ "_id": "y" })).await;

    let err = coordinator
        .pull(None, offline().push_first(true))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Sync(SyncError::DirtyState { count: 1, .. })), "{err}");
}

#[tokio::test]
async fn pending_scope_ignores_unrelated_entities() {
    let (coordinator, _remote) = setup(MockRemote::new()).await;
    update_local(&coordinator, json!({ "_id": "a", "genre": "sf" })).await;
    update_local(&coordinator, json!({ "_id": "b", "genre": "fantasy" })).await;

    let sf = Query::new().equal_to("genre", "sf");
    assert_eq!(coordinator.pending_sync_count(Some(&sf)).await.unwrap(), 1);
    coordinator
        .pull(Some(&Query::new().equal_to("genre", "horror")), offline())
        .await
        .unwrap();

    // A deleted entity no longer matches any query.
    coordinator.cache().save(json!({ "_id": "c", "genre": "sf" })).await.unwrap();
    coordinator.remove_by_id("c", offline()).await.unwrap();
    assert_eq!(coordinator.pending_sync_count(Some(&sf)).await.unwrap(), 1);
    assert_eq!(coordinator.pending_sync_count(None).await.unwrap(), 3);

    assert_eq!(coordinator.clear_sync(Some(&sf)).await.unwrap(), 1);
    let mut left: Vec<_> = coordinator
        .pending_sync_entities(None)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    left.sort();
    assert_eq!(left, vec!["b", "c"]);
}

#[tokio::test]
async fn auto_sync_create_leaves_unrelated_deletes_queued() {
    let (coordinator, remote) = setup(MockRemote::with_docs(vec![json!({ "_id": "x" })])).await;
    coordinator.pull(None, offline()).await.unwrap();
    coordinator.remove_by_id("x", offline()).await.unwrap();

    let items: Vec<_> = coordinator
        .create(json!({ "title": "Dune" }), online())
        .collect()
        .await;
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|i| i.is_ok()));

    assert_eq!(remote.count_calls(|c| matches!(c, Call::RemoveById(_))), 0);
    let pending = coordinator.pending_sync_entities(None).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "x");
    assert_eq!(pending[0].event, SyncEvent::Delete);
}

#[tokio::test]
async fn pending_delete_does_not_block_unrelated_pulls() {
    let docs = vec![json!({ "_id": "x" }), json!({ "_id": "y" })];
    let (coordinator, _remote) = setup(MockRemote::with_docs(docs)).await;
    coordinator.pull(None, offline()).await.unwrap();
    coordinator.remove_by_id("x", offline()).await.unwrap();

    assert!(coordinator.pull(None, offline()).await.is_err());
    let received = coordinator
        .pull(Some(&Query::by_id("y")), offline())
        .await
        .unwrap();
    assert_eq!(received, 1);

    // A broader pull still receives `x` but leaves it deleted.
    let everything = Query::new().with_limit(10);
    assert_eq!(coordinator.pull(Some(&everything), offline()).await.unwrap(), 2);
    assert_eq!(coordinator.cache().get("x").await.unwrap(), None);
    assert!(coordinator.cache().get("y").await.unwrap().is_some());
    assert_eq!(coordinator.pending_sync_count(None).await.unwrap(), 1);
}

#[tokio::test]
async fn plain_pull_records_a_cursor() {
    let remote = MockRemote::with_docs(vec![json!({ "_id": "a" }), json!({ "_id": "b" })]);
    let (coordinator, _remote) = setup(remote).await;

    assert_eq!(coordinator.pull(None, offline()).await.unwrap(), 2);
    assert_eq!(coordinator.cache().count(None).await.unwrap(), 2);
    assert_eq!(
        coordinator.query_cache().last_request(None).await.unwrap().as_deref(),
        Some("2024-01-01T00:00:00.000Z")
    );
}

#[tokio::test]
async fn delta_pull_applies_changes_since_the_cursor() {
    let remote = MockRemote::with_docs(vec![
        json!({ "_id": "a", "v": 1 }),
        json!({ "_id": "b", "v": 1 }),
    ]);
    let (coordinator, remote) = setup(remote).await;
    coordinator.pull(None, offline()).await.unwrap();

    remote.on_delta(|_, _| {
        Ok(DeltaSet {
            changed: vec![json!({ "_id": "a", "v": 2 })],
            deleted: vec!["b".to_string(), "never-cached".to_string()],
            meta: ResponseMeta::new("2024-02-01T00:00:00.000Z"),
        })
    });
    let changed = coordinator
        .pull(None, offline().use_delta_set(true))
        .await
        .unwrap();
    assert_eq!(changed, 1);

    assert!(remote
        .calls()
        .contains(&Call::Delta(None, "2024-01-01T00:00:00.000Z".to_string())));
    assert_eq!(
        coordinator.cache().find(None).await.unwrap(),
        vec![json!({ "_id": "a", "v": 2 })]
    );
    assert_eq!(
        coordinator.query_cache().last_request(None).await.unwrap().as_deref(),
        Some("2024-02-01T00:00:00.000Z")
    );
}

#[tokio::test]
async fn delta_pull_without_cursor_does_a_full_pull() {
    let (coordinator, remote) = setup(MockRemote::with_docs(vec![json!({ "_id": "a" })])).await;

    coordinator
        .pull(None, offline().use_delta_set(true))
        .await
        .unwrap();
    assert_eq!(remote.count_calls(|c| matches!(c, Call::Delta(..))), 0);
    assert_eq!(remote.count_calls(|c| matches!(c, Call::Find(_))), 1);
}

#[tokio::test]
async fn unavailable_delta_set_falls_back_to_full_pull() {
    let (coordinator, remote) = setup(MockRemote::with_docs(vec![json!({ "_id": "a" })])).await;
    coordinator.pull(None, offline()).await.unwrap();
    remote.set_doc(json!({ "_id": "b" }));

    let received = coordinator
        .pull(None, offline().use_delta_set(true))
        .await
        .unwrap();
    assert_eq!(received, 2);
    assert_eq!(remote.count_calls(|c| matches!(c, Call::Delta(..))), 1);
    assert_eq!(remote.count_calls(|c| matches!(c, Call::Find(_))), 2);
    assert_eq!(coordinator.cache().count(None).await.unwrap(), 2);
}

#[tokio::test]
async fn delta_errors_other_than_unavailable_fail_the_pull() {
    let (coordinator, remote) = setup(MockRemote::new()).await;
    coordinator.pull(None, offline()).await.unwrap();
    remote.on_delta(|_, _| Err(RemoteError::new(RemoteErrorKind::Network, "offline")));

    let err = coordinator
        .pull(None, offline().use_delta_set(true))
        .await
        .unwrap_err();
    assert!(
        matches!(err, StoreError::Remote(RemoteError { kind: RemoteErrorKind::Network, .. })),
        "{err}"
    );
}

#[tokio::test]
async fn paginated_pull_fetches_every_page_and_drops_stale_entities() {
    let docs: Vec<Value> = (0..25)
        .map(|i| json!({ "_id": format!("d{i:02}"), "n": i }))
        .collect();
    let (coordinator, remote) = setup(MockRemote::with_docs(docs)).await;
    coordinator.cache().save(json!({ "_id": "stale" })).await.unwrap();

    let received = coordinator
        .pull(None, offline().auto_pagination(AutoPagination::PageSize(10)))
        .await
        .unwrap();
    assert_eq!(received, 25);
    assert_eq!(coordinator.cache().count(None).await.unwrap(), 25);
    assert_eq!(coordinator.cache().get("stale").await.unwrap(), None);

    let calls = remote.calls();
    assert_eq!(calls[0], Call::Count(None));
    assert_eq!(remote.count_calls(|c| matches!(c, Call::Find(_))), 3);
    assert!(calls.contains(&Call::Find(Some(Query::new().with_skip(20).with_limit(5)))));
    assert!(coordinator.query_cache().last_request(None).await.unwrap().is_some());
}

#[tokio::test]
async fn paginated_pull_stays_inside_the_query_window() {
    let docs: Vec<Value> = (0..5).map(|i| json!({ "_id": format!("d{i}") })).collect();
    let (coordinator, remote) = setup(MockRemote::with_docs(docs)).await;

    let received = coordinator
        .pull(
            Some(&Query::new().with_limit(2)),
            offline().auto_pagination(AutoPagination::PageSize(10)),
        )
        .await
        .unwrap();
    assert_eq!(received, 2);
    assert_eq!(coordinator.cache().count(None).await.unwrap(), 2);
    assert!(remote.calls().contains(&Call::Find(Some(Query::new().with_limit(2)))));

    let received = coordinator
        .pull(
            Some(&Query::new().with_skip(3).with_limit(5)),
            offline().auto_pagination(AutoPagination::PageSize(1)),
        )
        .await
        .unwrap();
    assert_eq!(received, 2);
    let calls = remote.calls();
    assert!(calls.contains(&Call::Find(Some(Query::new().with_skip(3).with_limit(1)))));
    assert!(calls.contains(&Call::Find(Some(Query::new().with_skip(4).with_limit(1)))));
    assert!(!calls.contains(&Call::Find(Some(Query::new().with_skip(5).with_limit(1)))));
}

#[tokio::test]
async fn paginated_pull_keeps_entities_outside_the_filter() {
    let docs: Vec<Value> = (0..4).map(|i| json!({ "_id": format!("d{i}"), "kind": "a" })).collect();
    let (coordinator, remote) = setup(MockRemote::with_docs(docs)).await;
    coordinator.cache().save(json!({ "_id": "other", "kind": "b" })).await.unwrap();

    let scope = Query::new().equal_to("kind", "a");
    let received = coordinator
        .pull(Some(&scope), offline().auto_pagination(AutoPagination::PageSize(3)))
        .await
        .unwrap();
    assert_eq!(received, 4);
    assert_eq!(remote.count_calls(|c| matches!(c, Call::Find(_))), 2);
    assert!(coordinator.cache().get("other").await.unwrap().is_some());
    assert_eq!(coordinator.cache().count(None).await.unwrap(), 5);
}

// ============================================================================
// Reads
// ============================================================================

#[tokio::test]
async fn find_with_auto_sync_emits_cached_then_pulled() {
    let (coordinator, _remote) = setup(MockRemote::with_docs(vec![json!({ "_id": "x" })])).await;

    let items: Vec<_> = coordinator.find(None, online()).collect().await;
    assert_eq!(items.len(), 2);
    assert!(items[0].as_ref().unwrap().is_empty());
    assert_eq!(items[1].as_ref().unwrap(), &vec![json!({ "_id": "x" })]);
}

#[tokio::test]
async fn find_without_auto_sync_stays_local() {
    let (coordinator, remote) = setup(MockRemote::with_docs(vec![json!({ "_id": "x" })])).await;

    let items: Vec<_> = coordinator.find(None, offline()).collect().await;
    assert_eq!(items.len(), 1);
    assert!(items[0].as_ref().unwrap().is_empty());
    assert!(remote.calls().is_empty());
}

#[tokio::test]
async fn count_with_auto_sync_emits_twice() {
    let docs = vec![json!({ "_id": "x" }), json!({ "_id": "y" })];
    let (coordinator, _remote) = setup(MockRemote::with_docs(docs)).await;

    let counts: Vec<usize> = coordinator
        .count(None, online())
        .map(|r| r.unwrap())
        .collect()
        .await;
    assert_eq!(counts, vec![0, 2]);
}

#[tokio::test]
async fn find_by_id_pulls_missing_entity() {
    let (coordinator, remote) = setup(MockRemote::with_docs(vec![json!({ "_id": "x", "n": 1 })])).await;

    let items: Vec<_> = coordinator.find_by_id("x", online()).collect().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].as_ref().unwrap(), &json!({ "_id": "x", "n": 1 }));
    assert!(remote
        .calls()
        .contains(&Call::Find(Some(Query::by_id("x")))));
}

#[tokio::test]
async fn find_by_id_of_unknown_entity_fails_after_pull() {
    let (coordinator, _remote) = setup(MockRemote::new()).await;

    let items: Vec<_> = coordinator.find_by_id("x", online()).collect().await;
    assert_eq!(items.len(), 1);
    assert!(items[0].as_ref().unwrap_err().is_not_found());

    let items: Vec<_> = coordinator.find_by_id("x", offline()).collect().await;
    assert_eq!(items.len(), 1);
    assert!(items[0].as_ref().unwrap_err().is_not_found());
}

#[tokio::test]
async fn read_stream_surfaces_dirty_state() {
    let (coordinator, _remote) = setup(MockRemote::new()).await;
    create_local(&coordinator, json!({ "title": "unsent" })).await;

    let items: Vec<_> = coordinator.find(None, online()).collect().await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_ref().unwrap().len(), 1);
    assert!(matches!(
        items[1],
        Err(StoreError::Sync(SyncError::DirtyState { .. }))
    ));
}

// ============================================================================
// Clear
// ============================================================================

#[tokio::test]
async fn clear_resets_entities_log_and_cursors() {
    let (coordinator, _remote) = setup(MockRemote::with_docs(vec![json!({ "_id": "a" })])).await;
    coordinator.pull(None, offline()).await.unwrap();
    create_local(&coordinator, json!({ "title": "b" })).await;

    let removed = coordinator.clear(None).await.unwrap();
    assert_eq!(removed, 2);
    assert_eq!(coordinator.cache().count(None).await.unwrap(), 0);
    assert_eq!(coordinator.pending_sync_count(None).await.unwrap(), 0);
    assert_eq!(coordinator.query_cache().count().await.unwrap(), 0);
}

#[tokio::test]
async fn clear_with_query_keeps_other_pending_mutations() {
    let (coordinator, _remote) = setup(MockRemote::new()).await;
    update_local(&coordinator, json!({ "_id": "a", "genre": "sf" })).await;
    update_local(&coordinator, json!({ "_id": "b", "genre": "fantasy" })).await;

    let removed = coordinator
        .clear(Some(&Query::new().equal_to("genre", "sf")))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    let pending = coordinator.pending_sync_entities(None).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "b");
}

#[test]
fn not_found_helper_is_classified() {
    let err: StoreError = not_found("x").into();
    assert!(err.is_not_found());
}

// ============================================================================
// Durable backend
// ============================================================================

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn full_cycle_on_sqlite() {
    use offline_store::config::StorageConfig;
    use offline_store::storage::StorageProvider;

    let dir = tempfile::TempDir::new().unwrap();
    let storage = Storage::new(StorageConfig {
        root: dir.path().to_path_buf(),
        providers: vec![StorageProvider::Sqlite],
    });
    let remote = Arc::new(MockRemote::with_docs(vec![json!({ "_id": "seed" })]));
    let dyn_remote: Arc<dyn RemoteStore> = remote.clone();
    let coordinator = SyncCoordinator::open(
        &storage,
        "app",
        "books",
        Some("alice"),
        dyn_remote,
        SyncConfig::default(),
    )
    .await
    .unwrap();

    create_local(&coordinator, json!({ "title": "durable" })).await;
    let result = coordinator.sync(None, offline()).await.unwrap();
    assert!(result.push.iter().all(|r| r.is_ok()));
    assert_eq!(result.pull, 2);

    let mut ids: Vec<String> = coordinator
        .cache()
        .find(None)
        .await
        .unwrap()
        .iter()
        .map(id_of)
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["r1", "seed"]);
    assert!(dir.path().join("appalice.sqlite3").exists());
}
