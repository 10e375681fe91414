//! End-to-end scenarios S1-S6 (SPEC_FULL.md §8). Every scenario here runs a single process with
//! `peers == [self]`, so every RPC resolves to a direct, in-process call through `Handlers`
//! rather than a real network round trip -- exercising the full Actions -> Handlers -> C3/C4
//! path without needing a live listener.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use collection::{Collection, ShardManager, UserPlan};
use shard_engine::{Point, SearchQuery, SearchRequest};
use storage::{Actions, Handlers, Metrics, NodeMetadataStore, RpcClient};
use uuid::Uuid;

struct Harness {
    _dir: tempfile::TempDir,
    actions: Actions,
    shards: Arc<ShardManager>,
}

async fn harness(shard_timeout_secs: u64, max_shard_point_count: u64) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let metadata = Arc::new(NodeMetadataStore::open(dir.path()).unwrap());
    let shards = Arc::new(ShardManager::new(dir.path().to_path_buf(), Duration::from_secs(shard_timeout_secs)));
    let metrics = Arc::new(Metrics::new());
    let self_peer = "a:1".to_string();
    let client = Arc::new(RpcClient::new(self_peer.clone(), Duration::from_secs(5), 0, metrics));
    let handlers =
        Arc::new(Handlers { self_peer: self_peer.clone(), metadata, shards: shards.clone(), client });

    let actions = Actions {
        self_peer: self_peer.clone(),
        peers: vec![self_peer],
        handlers,
        max_shard_size: 256 * 1024 * 1024,
        max_shard_point_count,
        max_search_limit: 1000,
    };

    Harness { _dir: dir, actions, shards }
}

fn user_plan(max_collections: u32, max_points: u64) -> UserPlan {
    UserPlan {
        max_collections,
        max_collection_point_count: max_points,
        max_point_size: 4096,
        shard_backup_frequency: 0,
        shard_backup_count: 0,
    }
}

fn new_collection(user_id: &str, id: &str, plan: UserPlan) -> Collection {
    Collection {
        user_id: user_id.to_string(),
        id: id.to_string(),
        replicas: 1,
        created_at: Utc::now(),
        timestamp: Utc::now(),
        index_schema: serde_json::json!({}),
        shard_ids: vec![],
        user_plan: plan,
    }
}

fn point(id: Uuid, vector: Vec<f32>) -> Point {
    Point { id, data: rmp_serde::to_vec_named(&serde_json::json!({ "vector": vector })).unwrap() }
}

#[tokio::test]
async fn s1_create_list_get_delete() {
    let h = harness(60, 100_000).await;
    let col = new_collection("u", "c", user_plan(2, 1000));

    h.actions.create_collection(col.clone()).await.unwrap();

    let err = h.actions.create_collection(col.clone()).await.unwrap_err();
    assert!(matches!(err, storage::StorageError::Exists { .. }));

    let listed = h.actions.list_collections("u").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, "c");

    let fetched = h.actions.get_collection("u", "c").await.unwrap();
    assert_eq!(fetched.id, "c");

    h.actions.delete_collection(&fetched).await.unwrap();

    let err = h.actions.get_collection("u", "c").await.unwrap_err();
    assert!(matches!(err, storage::StorageError::NotFound { .. }));
}

#[tokio::test]
async fn s2_insert_and_search_one_shard() {
    let h = harness(60, 100_000).await;
    let mut col = new_collection("u", "c", user_plan(2, 1000));
    h.actions.create_collection(col.clone()).await.unwrap();

    let id1 = Uuid::new_v4();
    let id2 = Uuid::new_v4();
    let failed = h
        .actions
        .insert_points(&mut col, vec![point(id1, vec![1.0, 2.0]), point(id2, vec![3.0, 4.0])])
        .await
        .unwrap();
    assert!(failed.is_empty());

    let infos = h.actions.get_shards_info(&col).await.unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos.values().next().unwrap().point_count, 2);

    let request = SearchRequest {
        query: SearchQuery { vector: vec![1.0, 2.0], operator: "near".to_string(), search_size: 10 },
        limit: 2,
        offset: 0,
        sort: vec![],
    };
    let results = h.actions.search_points(&col, request).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].point.id, id1);
    assert_eq!(results[0].distance, Some(0.0));
    assert!(results[1].distance.unwrap() > 0.0);
}

#[tokio::test]
async fn s3_two_shard_fan_out() {
    let h = harness(60, 1).await;
    let mut col = new_collection("u", "c", user_plan(2, 1000));
    h.actions.create_collection(col.clone()).await.unwrap();

    let id1 = Uuid::new_v4();
    let id2 = Uuid::new_v4();
    let failed = h
        .actions
        .insert_points(&mut col, vec![point(id1, vec![1.0, 2.0]), point(id2, vec![3.0, 4.0])])
        .await
        .unwrap();
    assert!(failed.is_empty());
    assert_eq!(col.shard_ids.len(), 2);

    let request = SearchRequest {
        query: SearchQuery { vector: vec![1.0, 2.0], operator: "near".to_string(), search_size: 10 },
        limit: 2,
        offset: 0,
        sort: vec![],
    };
    let results = h.actions.search_points(&col, request).await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0].distance.unwrap() <= results[1].distance.unwrap());
}

#[tokio::test]
async fn s4_quota_on_collection_count() {
    let h = harness(60, 1000).await;
    let col_a = new_collection("u", "a", user_plan(1, 1000));
    h.actions.create_collection(col_a).await.unwrap();

    let col_b = new_collection("u", "b", user_plan(1, 1000));
    let err = h.actions.create_collection(col_b).await.unwrap_err();
    assert!(matches!(err, storage::StorageError::QuotaReached));
}

#[tokio::test]
async fn s5_shard_unload_and_reload() {
    let h = harness(1, 100_000).await;
    let mut col = new_collection("u", "c", user_plan(2, 1000));
    h.actions.create_collection(col.clone()).await.unwrap();

    h.actions.insert_points(&mut col, vec![point(Uuid::new_v4(), vec![1.0, 1.0])]).await.unwrap();
    assert_eq!(h.shards.loaded_count(), 1);

    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert_eq!(h.shards.loaded_count(), 0, "idle shard must be unloaded after its timeout");

    let request = SearchRequest {
        query: SearchQuery { vector: vec![1.0, 1.0], operator: "near".to_string(), search_size: 10 },
        limit: 1,
        offset: 0,
        sort: vec![],
    };
    let results = h.actions.search_points(&col, request).await.unwrap();
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn s6_update_delete_fan_out() {
    let h = harness(60, 1).await;
    let mut col = new_collection("u", "c", user_plan(2, 1000));
    h.actions.create_collection(col.clone()).await.unwrap();

    let id1 = Uuid::new_v4();
    let id2 = Uuid::new_v4();
    h.actions
        .insert_points(&mut col, vec![point(id1, vec![1.0, 2.0]), point(id2, vec![3.0, 4.0])])
        .await
        .unwrap();
    assert_eq!(col.shard_ids.len(), 2);

    let failed = h
        .actions
        .update_points(&col, vec![point(id1, vec![9.0, 9.0]), point(id2, vec![8.0, 8.0])])
        .await
        .unwrap();
    assert!(failed.is_empty());

    let unknown = Uuid::new_v4();
    let failed = h.actions.update_points(&col, vec![point(unknown, vec![0.0, 0.0])]).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, unknown);
    assert_eq!(failed[0].error, "not found");
}
