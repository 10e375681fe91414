//! Sync (SPEC_FULL.md §4.8): relocates node-metadata entries and shard files after the peer
//! list changes. Triggered explicitly, while no serving is in flight.

use std::path::PathBuf;
use std::sync::Arc;

use placement::{owner, Peer};

use crate::envelope::{SendShardRequest, SetNodeKeyValueRequest};
use crate::error::{StorageError, StorageResult};
use crate::handlers::Handlers;
use crate::metadata_store::{NodeMetadataStore, USER_COLLECTIONS};

const SHARD_CHUNK_BYTES: usize = 8 * 1024 * 1024;

pub struct Sync {
    pub self_peer: Peer,
    pub peers: Vec<Peer>,
    pub metadata: Arc<NodeMetadataStore>,
    pub handlers: Arc<Handlers>,
    pub root_dir: PathBuf,
}

impl Sync {
    /// Relocates every `userCollections` entry whose owner is no longer `self`. Aborts early
    /// when `peers == [self]` (nothing could possibly have moved).
    pub async fn sync_user_collections(&self) -> StorageResult<()> {
        if self.peers.len() == 1 && self.peers[0] == self.self_peer {
            return Ok(());
        }

        let all = self.metadata.prefix_scan(USER_COLLECTIONS, "")?;

        let mut by_dest: std::collections::HashMap<Peer, Vec<(String, Vec<u8>)>> = std::collections::HashMap::new();
        for (key, value) in all {
            let Some((user_id, _)) = collection::split_metadata_key(&key) else { continue };
            let dest = owner(user_id, &self.peers);
            if dest != self.self_peer {
                by_dest.entry(dest).or_default().push((key, value));
            }
        }

        for (dest, pairs) in by_dest {
            let keys: Vec<String> = pairs.iter().map(|(k, _)| k.clone()).collect();
            self.handlers
                .set_node_key_value(
                    &dest,
                    SetNodeKeyValueRequest { bucket: "userCollections".to_string(), pairs },
                )
                .await?;
            self.metadata.delete_batch(USER_COLLECTIONS, &keys)?;
        }

        Ok(())
    }

    /// Streams every shard file whose owner is no longer `self` to its new owner in 8 MiB
    /// chunks, verifying an xxhash64 checksum before removing the local copy. One concurrent
    /// sender per destination; this implementation simply runs senders sequentially, which
    /// satisfies that bound trivially.
    pub async fn sync_shards(&self) -> StorageResult<()> {
        for (shard_id, user_id, collection_id, path) in self.discover_shard_files()? {
            let dest = owner(&shard_id.to_string(), &self.peers);
            if dest == self.self_peer {
                continue;
            }
            self.send_one_shard(&dest, &user_id, &collection_id, shard_id, &path).await?;
        }
        Ok(())
    }

    fn discover_shard_files(&self) -> StorageResult<Vec<(uuid::Uuid, String, String, PathBuf)>> {
        let mut found = Vec::new();
        let root = self.root_dir.join("userCollections");
        if !root.exists() {
            return Ok(found);
        }
        for user_entry in std::fs::read_dir(&root)? {
            let user_dir = user_entry?.path();
            let Some(user_id) = user_dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else { continue };
            if !user_dir.is_dir() {
                continue;
            }
            for col_entry in std::fs::read_dir(&user_dir)? {
                let col_dir = col_entry?.path();
                let Some(collection_id) = col_dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                    continue;
                };
                if !col_dir.is_dir() {
                    continue;
                }
                for shard_entry in std::fs::read_dir(&col_dir)? {
                    let shard_dir = shard_entry?.path();
                    let path = shard_dir.join("sharddb.mp");
                    if !path.exists() {
                        continue;
                    }
                    let Some(shard_id) =
                        shard_dir.file_name().and_then(|n| n.to_str()).and_then(|s| uuid::Uuid::parse_str(s).ok())
                    else {
                        continue;
                    };
                    found.push((shard_id, user_id.clone(), collection_id.clone(), path));
                }
            }
        }
        Ok(found)
    }

    async fn send_one_shard(
        &self,
        dest: &Peer,
        user_id: &str,
        collection_id: &str,
        shard_id: uuid::Uuid,
        path: &std::path::Path,
    ) -> StorageResult<()> {
        let data = std::fs::read(path)?;
        let mut chunk_index = 0u64;

        for chunk in data.chunks(SHARD_CHUNK_BYTES) {
            self.handlers
                .send_shard(
                    dest,
                    SendShardRequest {
                        user_id: user_id.to_string(),
                        collection_id: collection_id.to_string(),
                        shard_id,
                        chunk_index,
                        chunk_data: chunk.to_vec(),
                    },
                )
                .await?;
            chunk_index += 1;
        }

        let reply = self
            .handlers
            .send_shard(
                dest,
                SendShardRequest {
                    user_id: user_id.to_string(),
                    collection_id: collection_id.to_string(),
                    shard_id,
                    chunk_index,
                    chunk_data: Vec::new(),
                },
            )
            .await?;

        let remote_checksum = reply.checksum.ok_or_else(|| {
            StorageError::service_error("SendShard final chunk reply carried no checksum")
        })?;
        let local_checksum = xxhash_rust::xxh64::xxh64(&data, 0);

        if remote_checksum != local_checksum {
            return Err(StorageError::Conflict {
                what: format!("shard {shard_id} checksum mismatch after transfer"),
            });
        }

        let shard_dir = path.parent().unwrap_or(path).to_path_buf();
        std::fs::remove_dir_all(&shard_dir)?;
        prune_empty_parents(&shard_dir);
        Ok(())
    }
}

fn prune_empty_parents(shard_dir: &std::path::Path) {
    if let Some(collection_dir) = shard_dir.parent() {
        let _ = std::fs::remove_dir(collection_dir);
        if let Some(user_dir) = collection_dir.parent() {
            let _ = std::fs::remove_dir(user_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata_store::NodeMetadataStore;
    use crate::rpc::client::RpcClient;
    use crate::Handlers;
    use crate::Metrics;
    use chrono::Utc;
    use collection::{Collection, ShardManager, UserPlan};
    use std::time::Duration;

    #[test]
    fn xxhash_is_stable_across_equal_buffers() {
        let a = xxhash_rust::xxh64::xxh64(b"shard bytes", 0);
        let b = xxhash_rust::xxh64::xxh64(b"shard bytes", 0);
        assert_eq!(a, b);
    }

    #[test]
    fn xxhash_differs_for_corrupted_buffers() {
        // The exact check `send_one_shard` relies on to decide whether a transfer round-tripped
        // intact: a single flipped byte must change the checksum.
        let original = b"shard bytes".to_vec();
        let mut corrupted = original.clone();
        corrupted[0] ^= 0xFF;
        assert_ne!(
            xxhash_rust::xxh64::xxh64(&original, 0),
            xxhash_rust::xxh64::xxh64(&corrupted, 0)
        );
    }

    fn plan() -> UserPlan {
        UserPlan {
            max_collections: 10,
            max_collection_point_count: 1000,
            max_point_size: 4096,
            shard_backup_frequency: 0,
            shard_backup_count: 0,
        }
    }

    fn collection(user_id: &str, id: &str) -> Collection {
        Collection {
            user_id: user_id.into(),
            id: id.into(),
            replicas: 1,
            created_at: Utc::now(),
            timestamp: Utc::now(),
            index_schema: serde_json::json!({}),
            shard_ids: vec![],
            user_plan: plan(),
        }
    }

    #[tokio::test]
    async fn sync_user_collections_is_idempotent_when_nothing_needs_to_move() {
        let dir = tempfile::tempdir().unwrap();
        let self_peer = "a:1".to_string();
        let metadata = Arc::new(NodeMetadataStore::open(dir.path()).unwrap());
        metadata.put_collection(&collection("u1", "c1")).unwrap();

        let shards = Arc::new(ShardManager::new(dir.path().to_path_buf(), Duration::from_secs(60)));
        let metrics = Arc::new(Metrics::new());
        let client = Arc::new(RpcClient::new(self_peer.clone(), Duration::from_secs(5), 0, metrics));
        let handlers =
            Arc::new(Handlers { self_peer: self_peer.clone(), metadata: metadata.clone(), shards, client });

        // peers == [self]: the cheap early-abort path. Running it any number of times changes
        // nothing, trivially satisfying idempotency.
        let sync = Sync {
            self_peer: self_peer.clone(),
            peers: vec![self_peer.clone()],
            metadata: metadata.clone(),
            handlers,
            root_dir: dir.path().to_path_buf(),
        };

        sync.sync_user_collections().await.unwrap();
        sync.sync_user_collections().await.unwrap();

        assert_eq!(metadata.list_collections("u1").unwrap().len(), 1);
    }
}
