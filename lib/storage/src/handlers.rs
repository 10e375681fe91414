//! RPC handlers (SPEC_FULL.md §4.6): per-verb execution against C3/C4, with "forward if
//! `dest != self`" as the very first branch in every method.

use std::collections::HashSet;
use std::sync::Arc;

use collection::{ShardContext, ShardManager};
use redb::ReadableTable;
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use crate::envelope::*;
use crate::error::{StorageError, StorageResult};
use crate::metadata_store::{NodeMetadataStore, INTERNAL, USER_COLLECTIONS};
use crate::rpc::client::{decode_reply, RpcClient};

pub struct Handlers {
    pub self_peer: Peer,
    pub metadata: Arc<NodeMetadataStore>,
    pub shards: Arc<ShardManager>,
    pub client: Arc<RpcClient>,
}

impl Handlers {
    /// Forwards a request to `dest` via C2 and decodes the reply, when this process is not the
    /// destination. Shared by every handler's first step.
    async fn forward<Req: Serialize, Rep: DeserializeOwned>(
        &self,
        dest: &Peer,
        method: Method,
        req: &Req,
    ) -> StorageResult<Rep> {
        let body = rmp_serde::to_vec_named(req)?;
        let reply_bytes = self.client.call(dest, method, body).await?;
        decode_reply(&reply_bytes)
    }

    fn shard_context(&self, collection: &collection::Collection) -> ShardContext {
        ShardContext {
            user_id: collection.user_id.clone(),
            collection_id: collection.id.clone(),
            index_schema: collection.index_schema.clone(),
            backup_frequency_secs: collection.user_plan.shard_backup_frequency,
            backup_count: collection.user_plan.shard_backup_count as usize,
        }
    }

    async fn load_collection(&self, user_id: &str, collection_id: &str) -> StorageResult<collection::Collection> {
        self.metadata
            .get_collection(user_id, collection_id)?
            .ok_or_else(|| StorageError::NotFound { what: format!("collection {user_id}/{collection_id}") })
    }

    pub async fn ping(&self, dest: &Peer, req: PingRequest) -> StorageResult<PingReply> {
        if *dest != self.self_peer {
            return self.forward(dest, Method::Ping, &req).await;
        }
        Ok(PingReply { pong: true })
    }

    /// Runs the exists-check, quota-count, and put inside one write transaction (spec.md §4.5
    /// "In a write transaction") so two concurrent `CreateCollection` calls for the same
    /// `(user_id, id)` can't both pass the checks and both succeed.
    pub async fn create_collection(&self, dest: &Peer, req: CreateCollectionRequest) -> StorageResult<CreateCollectionReply> {
        if *dest != self.self_peer {
            return self.forward(dest, Method::CreateCollection, &req).await;
        }

        let col = req.collection;
        self.metadata.write(|txn| {
            let mut table = txn.open_table(USER_COLLECTIONS)?;
            let key = col.metadata_key();

            if table.get(key.as_str())?.is_some() {
                return Ok(CreateCollectionReply { already_exists: true, quota_reached: false });
            }

            let prefix = format!("{}/", col.user_id);
            let mut existing = 0u32;
            for entry in table.range(prefix.as_str()..)? {
                let (k, _) = entry?;
                if !k.value().starts_with(prefix.as_str()) {
                    break;
                }
                existing += 1;
            }
            if existing >= col.user_plan.max_collections {
                return Ok(CreateCollectionReply { already_exists: false, quota_reached: true });
            }

            let value = rmp_serde::to_vec_named(&col)?;
            table.insert(key.as_str(), value.as_slice())?;
            Ok(CreateCollectionReply { already_exists: false, quota_reached: false })
        })
    }

    pub async fn delete_collection(&self, dest: &Peer, req: DeleteCollectionRequest) -> StorageResult<DeleteCollectionReply> {
        if *dest != self.self_peer {
            return self.forward(dest, Method::DeleteCollection, &req).await;
        }
        self.metadata.delete_collection(&req.user_id, &req.collection_id)?;
        Ok(DeleteCollectionReply {})
    }

    pub async fn list_collections(&self, dest: &Peer, req: ListCollectionsRequest) -> StorageResult<ListCollectionsReply> {
        if *dest != self.self_peer {
            return self.forward(dest, Method::ListCollections, &req).await;
        }
        Ok(ListCollectionsReply { collections: self.metadata.list_collections(&req.user_id)? })
    }

    pub async fn get_collection(&self, dest: &Peer, req: GetCollectionRequest) -> StorageResult<GetCollectionReply> {
        if *dest != self.self_peer {
            return self.forward(dest, Method::GetCollection, &req).await;
        }
        Ok(GetCollectionReply { collection: self.metadata.get_collection(&req.user_id, &req.collection_id)? })
    }

    /// Reads the collection, appends the new shard id, and writes it back inside one write
    /// transaction, so two concurrent `CreateShard` calls on the same collection can't each
    /// append a shard id in memory and have the later commit silently discard the other.
    pub async fn create_shard(&self, dest: &Peer, req: CreateShardRequest) -> StorageResult<CreateShardReply> {
        if *dest != self.self_peer {
            return self.forward(dest, Method::CreateShard, &req).await;
        }
        let shard_id = Uuid::new_v4();
        self.metadata.write(|txn| {
            let mut table = txn.open_table(USER_COLLECTIONS)?;
            let key = collection::metadata_key(&req.user_id, &req.collection_id);

            let bytes = table.get(key.as_str())?.map(|v| v.value().to_vec()).ok_or_else(|| {
                StorageError::NotFound { what: format!("collection {}/{}", req.user_id, req.collection_id) }
            })?;
            let mut col: collection::Collection = rmp_serde::from_slice(&bytes)?;
            col.shard_ids.push(shard_id);
            let value = rmp_serde::to_vec_named(&col)?;
            table.insert(key.as_str(), value.as_slice())?;
            Ok(())
        })?;
        Ok(CreateShardReply { shard_id })
    }

    pub async fn get_shard_info(&self, dest: &Peer, req: GetShardInfoRequest) -> StorageResult<GetShardInfoReply> {
        if *dest != self.self_peer {
            return self.forward(dest, Method::GetShardInfo, &req).await;
        }
        let col = self.load_collection(&req.user_id, &req.collection_id).await?;
        let ctx = self.shard_context(&col);
        let info = self.shards.do_with_shard(&ctx, req.shard_id, |engine| Ok(engine.info()?)).await?;
        Ok(GetShardInfoReply { info })
    }

    pub async fn delete_collection_shards(
        &self,
        dest: &Peer,
        req: DeleteCollectionShardsRequest,
    ) -> StorageResult<DeleteCollectionShardsReply> {
        if *dest != self.self_peer {
            return self.forward(dest, Method::DeleteCollectionShards, &req).await;
        }
        let deleted = self
            .shards
            .delete_collection_shards(&req.user_id, &req.collection_id, &req.shard_ids)
            .await;
        Ok(DeleteCollectionShardsReply { deleted_shard_ids: deleted })
    }

    pub async fn insert_points(&self, dest: &Peer, req: InsertPointsRequest) -> StorageResult<InsertPointsReply> {
        if *dest != self.self_peer {
            return self.forward(dest, Method::InsertPoints, &req).await;
        }
        let col = self.load_collection(&req.user_id, &req.collection_id).await?;
        let ctx = self.shard_context(&col);
        self.shards
            .do_with_shard(&ctx, req.shard_id, |engine| Ok(engine.insert_points(req.points)?))
            .await?;
        Ok(InsertPointsReply {})
    }

    pub async fn update_points(&self, dest: &Peer, req: UpdatePointsRequest) -> StorageResult<UpdatePointsReply> {
        if *dest != self.self_peer {
            return self.forward(dest, Method::UpdatePoints, &req).await;
        }
        let col = self.load_collection(&req.user_id, &req.collection_id).await?;
        let ctx = self.shard_context(&col);
        let updated_ids = self
            .shards
            .do_with_shard(&ctx, req.shard_id, |engine| Ok(engine.update_points(req.points)?))
            .await?;
        Ok(UpdatePointsReply { updated_ids })
    }

    pub async fn delete_points(&self, dest: &Peer, req: DeletePointsRequest) -> StorageResult<DeletePointsReply> {
        if *dest != self.self_peer {
            return self.forward(dest, Method::DeletePoints, &req).await;
        }
        let col = self.load_collection(&req.user_id, &req.collection_id).await?;
        let ctx = self.shard_context(&col);
        let ids: HashSet<Uuid> = req.ids.into_iter().collect();
        let deleted_ids = self
            .shards
            .do_with_shard(&ctx, req.shard_id, |engine| Ok(engine.delete_points(&ids)?))
            .await?;
        Ok(DeletePointsReply { deleted_ids })
    }

    pub async fn search_points(&self, dest: &Peer, req: SearchPointsRequest) -> StorageResult<SearchPointsReply> {
        if *dest != self.self_peer {
            return self.forward(dest, Method::SearchPoints, &req).await;
        }
        let col = self.load_collection(&req.user_id, &req.collection_id).await?;
        let ctx = self.shard_context(&col);
        let results = self
            .shards
            .do_with_shard(&ctx, req.shard_id, |engine| Ok(engine.search_points(&req.request)?))
            .await?;
        Ok(SearchPointsReply { results })
    }

    pub async fn set_node_key_value(&self, dest: &Peer, req: SetNodeKeyValueRequest) -> StorageResult<SetNodeKeyValueReply> {
        if *dest != self.self_peer {
            return self.forward(dest, Method::SetNodeKeyValue, &req).await;
        }
        let table = bucket_table(&req.bucket)?;
        let count = req.pairs.len();
        self.metadata.write_batch(table, &req.pairs)?;
        Ok(SetNodeKeyValueReply { count })
    }

    pub async fn send_shard(&self, dest: &Peer, req: SendShardRequest) -> StorageResult<SendShardReply> {
        if *dest != self.self_peer {
            return self.forward(dest, Method::SendShard, &req).await;
        }
        let dir = collection::shard_dir(self.shards.root_dir(), &req.user_id, &req.collection_id, req.shard_id);
        let path = dir.join("sharddb.mp");

        if req.chunk_index > 0 && req.chunk_data.is_empty() {
            let checksum = if path.exists() {
                xxhash_rust::xxh64::xxh64(&std::fs::read(&path)?, 0)
            } else {
                0
            };
            return Ok(SendShardReply { checksum: Some(checksum) });
        }

        if req.chunk_index == 0 {
            std::fs::create_dir_all(&dir)?;
            std::fs::write(&path, &req.chunk_data)?;
        } else {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
            file.write_all(&req.chunk_data)?;
        }
        Ok(SendShardReply { checksum: None })
    }
}

fn bucket_table(bucket: &str) -> StorageResult<redb::TableDefinition<'static, &'static str, &'static [u8]>> {
    match bucket {
        "userCollections" => Ok(crate::metadata_store::USER_COLLECTIONS),
        "internal" => Ok(INTERNAL),
        other => Err(StorageError::service_error(format!("unknown bucket {other}"))),
    }
}
