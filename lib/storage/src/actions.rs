//! Actions (SPEC_FULL.md §4.7): the public API, composing RPCs into user-visible operations.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use collection::{Collection, ShardId};
use futures::future::join_all;
use itertools::Itertools;
use placement::{owner, Peer};
use shard_engine::{Point, SearchRequest, SearchResult, ShardInfo};
use uuid::Uuid;

use crate::distribute::{plan_point_ranges, PlannedRange, ShardFill, Target};
use crate::envelope::*;
use crate::error::{StorageError, StorageResult};
use crate::handlers::Handlers;
use crate::search_merge::{merge_results, per_shard_limit, per_shard_offset};

#[derive(Debug, Clone)]
pub struct FailedRange {
    pub shard_id: ShardId,
    pub start: usize,
    pub end: usize,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct FailedPoint {
    pub id: Uuid,
    pub error: String,
}

pub struct Actions {
    pub self_peer: Peer,
    pub peers: Vec<Peer>,
    pub handlers: Arc<Handlers>,
    pub max_shard_size: u64,
    pub max_shard_point_count: u64,
    pub max_search_limit: usize,
}

impl Actions {
    fn owner_of(&self, key: &str) -> Peer {
        owner(key, &self.peers)
    }

    pub async fn create_collection(&self, collection: Collection) -> StorageResult<()> {
        let dest = self.owner_of(&collection.user_id);
        let reply = self
            .handlers
            .create_collection(&dest, CreateCollectionRequest { collection })
            .await?;
        if reply.already_exists {
            return Err(StorageError::Exists { what: "collection".into() });
        }
        if reply.quota_reached {
            return Err(StorageError::QuotaReached);
        }
        Ok(())
    }

    pub async fn list_collections(&self, user_id: &str) -> StorageResult<Vec<Collection>> {
        let dest = self.owner_of(user_id);
        let reply = self
            .handlers
            .list_collections(&dest, ListCollectionsRequest { user_id: user_id.to_string() })
            .await?;
        Ok(reply.collections)
    }

    pub async fn get_collection(&self, user_id: &str, collection_id: &str) -> StorageResult<Collection> {
        let dest = self.owner_of(user_id);
        let reply = self
            .handlers
            .get_collection(
                &dest,
                GetCollectionRequest { user_id: user_id.to_string(), collection_id: collection_id.to_string() },
            )
            .await?;
        reply.collection.ok_or_else(|| StorageError::NotFound { what: "collection".into() })
    }

    pub async fn delete_collection(&self, collection: &Collection) -> StorageResult<Vec<ShardId>> {
        let dest = self.owner_of(&collection.user_id);
        self.handlers
            .delete_collection(
                &dest,
                DeleteCollectionRequest {
                    user_id: collection.user_id.clone(),
                    collection_id: collection.id.clone(),
                },
            )
            .await?;

        // Best-effort: the metadata entry is already gone, so per-owner failures are logged and
        // do not fail the overall operation.
        let mut by_owner: HashMap<Peer, Vec<ShardId>> = HashMap::new();
        for &shard_id in &collection.shard_ids {
            by_owner.entry(self.owner_of(&shard_id.to_string())).or_default().push(shard_id);
        }

        let results = join_all(by_owner.into_iter().map(|(dest, shard_ids)| {
            let handlers = self.handlers.clone();
            let user_id = collection.user_id.clone();
            let collection_id = collection.id.clone();
            async move {
                handlers
                    .delete_collection_shards(&dest, DeleteCollectionShardsRequest { user_id, collection_id, shard_ids })
                    .await
            }
        }))
        .await;

        let mut deleted = Vec::new();
        for result in results {
            match result {
                Ok(reply) => deleted.extend(reply.deleted_shard_ids),
                Err(err) => log::warn!("error deleting shards for collection {}: {err}", collection.id),
            }
        }
        Ok(deleted)
    }

    pub async fn get_shards_info(&self, collection: &Collection) -> StorageResult<HashMap<ShardId, ShardInfo>> {
        let results = join_all(collection.shard_ids.iter().map(|&shard_id| {
            let dest = self.owner_of(&shard_id.to_string());
            let handlers = self.handlers.clone();
            let user_id = collection.user_id.clone();
            let collection_id = collection.id.clone();
            async move {
                let reply = handlers
                    .get_shard_info(&dest, GetShardInfoRequest { user_id, collection_id, shard_id })
                    .await;
                (shard_id, reply)
            }
        }))
        .await;

        let mut infos = HashMap::new();
        for (shard_id, reply) in results {
            match reply {
                Ok(reply) => {
                    infos.insert(shard_id, reply.info);
                }
                Err(err) => {
                    return Err(StorageError::ShardUnavailable { shard_id, reason: err.to_string() });
                }
            }
        }
        Ok(infos)
    }

    pub async fn insert_points(&self, collection: &mut Collection, mut points: Vec<Point>) -> StorageResult<Vec<FailedRange>> {
        let infos = self.get_shards_info(collection).await?;

        let total_existing: u64 = infos.values().map(|i| i.point_count as u64).sum();
        if total_existing + points.len() as u64 > collection.user_plan.max_collection_point_count {
            return Err(StorageError::QuotaReached);
        }

        points.sort_by(|a, b| a.id.as_bytes().cmp(b.id.as_bytes()));
        let point_sizes: Vec<usize> = points.iter().map(|p| p.data.len()).collect();

        let existing: Vec<(ShardId, ShardFill)> = collection
            .shard_ids
            .iter()
            .map(|&id| {
                let info = infos.get(&id).copied().unwrap_or(ShardInfo { point_count: 0, size: 0 });
                (id, ShardFill { size: info.size, point_count: info.point_count as u64 })
            })
            .collect();

        let plans = plan_point_ranges(&existing, &point_sizes, self.max_shard_size, self.max_shard_point_count);

        let mut resolved: Vec<(ShardId, PlannedRange)> = Vec::with_capacity(plans.len());
        for plan in plans {
            let shard_id = match plan.target {
                Target::Existing(id) => id,
                Target::New(_) => {
                    let dest = self.owner_of(&collection.user_id);
                    let reply = self
                        .handlers
                        .create_shard(
                            &dest,
                            CreateShardRequest {
                                user_id: collection.user_id.clone(),
                                collection_id: collection.id.clone(),
                            },
                        )
                        .await?;
                    collection.shard_ids.push(reply.shard_id);
                    reply.shard_id
                }
            };
            resolved.push((shard_id, plan));
        }

        let results = join_all(resolved.into_iter().map(|(shard_id, plan)| {
            let dest = self.owner_of(&shard_id.to_string());
            let handlers = self.handlers.clone();
            let user_id = collection.user_id.clone();
            let collection_id = collection.id.clone();
            let chunk = points[plan.range.clone()].to_vec();
            let range = plan.range.clone();
            async move {
                let result = handlers
                    .insert_points(&dest, InsertPointsRequest { user_id, collection_id, shard_id, points: chunk })
                    .await;
                (shard_id, range, result)
            }
        }))
        .await;

        let mut failed = Vec::new();
        for (shard_id, range, result) in results {
            if let Err(err) = result {
                failed.push(FailedRange { shard_id, start: range.start, end: range.end, error: err.to_string() });
            }
        }
        Ok(failed)
    }

    pub async fn search_points(&self, collection: &Collection, mut request: SearchRequest) -> StorageResult<Vec<SearchResult>> {
        let n = collection.shard_ids.len();
        let original_limit = request.limit;
        if n == 0 {
            return Ok(Vec::new());
        }

        request.limit = per_shard_limit(original_limit, n, self.max_search_limit);
        request.offset = per_shard_offset(request.offset, n);

        let results = join_all(collection.shard_ids.iter().map(|&shard_id| {
            let dest = self.owner_of(&shard_id.to_string());
            let handlers = self.handlers.clone();
            let user_id = collection.user_id.clone();
            let collection_id = collection.id.clone();
            let request = request.clone();
            async move {
                handlers
                    .search_points(&dest, SearchPointsRequest { user_id, collection_id, shard_id, request })
                    .await
            }
        }))
        .await;

        let mut merged = Vec::new();
        let mut first_err = None;
        for result in results {
            match result {
                Ok(reply) => merged.extend(reply.results),
                Err(err) => {
                    log::warn!("search_points shard error: {err}");
                    first_err.get_or_insert(err);
                }
            }
        }

        if merged.is_empty() {
            if let Some(err) = first_err {
                return Err(err);
            }
        }

        if n == 1 {
            merged.truncate(original_limit);
            return Ok(merged);
        }
        Ok(merge_results(merged, &request.sort, original_limit))
    }

    pub async fn update_points(&self, collection: &Collection, points: Vec<Point>) -> StorageResult<Vec<FailedPoint>> {
        let all_ids: Vec<Uuid> = points.iter().map(|p| p.id).sorted().collect();
        let n = collection.shard_ids.len();

        let results = join_all(collection.shard_ids.iter().map(|&shard_id| {
            let dest = self.owner_of(&shard_id.to_string());
            let handlers = self.handlers.clone();
            let user_id = collection.user_id.clone();
            let collection_id = collection.id.clone();
            let points = points.clone();
            async move {
                handlers
                    .update_points(&dest, UpdatePointsRequest { user_id, collection_id, shard_id, points })
                    .await
            }
        }))
        .await;

        Ok(derive_failed_points(all_ids, n, results.into_iter().map(|r| r.map(|reply| reply.updated_ids))))
    }

    pub async fn delete_points(&self, collection: &Collection, ids: Vec<Uuid>) -> StorageResult<Vec<FailedPoint>> {
        let all_ids: Vec<Uuid> = ids.iter().copied().sorted().collect();
        let n = collection.shard_ids.len();

        let results = join_all(collection.shard_ids.iter().map(|&shard_id| {
            let dest = self.owner_of(&shard_id.to_string());
            let handlers = self.handlers.clone();
            let user_id = collection.user_id.clone();
            let collection_id = collection.id.clone();
            let ids = ids.clone();
            async move {
                handlers.delete_points(&dest, DeletePointsRequest { user_id, collection_id, shard_id, ids }).await
            }
        }))
        .await;

        Ok(derive_failed_points(all_ids, n, results.into_iter().map(|r| r.map(|reply| reply.deleted_ids))))
    }
}

/// `failedPoints = allIds \ successIds`; error label is "not found" iff every shard responded
/// without error, else "shard unavailable" (SPEC_FULL.md §4.7, testable property 9).
fn derive_failed_points(
    all_ids: Vec<Uuid>,
    shard_count: usize,
    per_shard: impl Iterator<Item = StorageResult<Vec<Uuid>>>,
) -> Vec<FailedPoint> {
    let mut success_ids: HashSet<Uuid> = HashSet::new();
    let mut success_count = 0usize;
    for result in per_shard {
        match result {
            Ok(ids) => {
                success_count += 1;
                success_ids.extend(ids);
            }
            Err(err) => log::warn!("fan-out shard error: {err}"),
        }
    }

    let label = if success_count == shard_count { "not found" } else { "shard unavailable" };
    all_ids
        .into_iter()
        .filter(|id| !success_ids.contains(id))
        .map(|id| FailedPoint { id, error: label.to_string() })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_failed_points_labels_not_found_when_all_shards_responded() {
        let id1 = Uuid::new_v4();
        let id2 = Uuid::new_v4();
        let results = vec![Ok(vec![id1]), Ok(vec![])];
        let failed = derive_failed_points(vec![id1, id2].into_iter().sorted().collect(), 2, results.into_iter());
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, id2);
        assert_eq!(failed[0].error, "not found");
    }

    #[test]
    fn derive_failed_points_labels_shard_unavailable_on_partial_response() {
        let id1 = Uuid::new_v4();
        let id2 = Uuid::new_v4();
        let results: Vec<StorageResult<Vec<Uuid>>> =
            vec![Ok(vec![id1]), Err(StorageError::Timeout { dest: "b:1".into() })];
        let failed = derive_failed_points(vec![id1, id2].into_iter().sorted().collect(), 2, results.into_iter());
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, id2);
        assert_eq!(failed[0].error, "shard unavailable");
    }
}
