//! Node metadata store (SPEC_FULL.md §4.4): a bucketed ordered key-value store backed by
//! `redb`, a single-file embedded store. Buckets map onto redb `TableDefinition`s; the whole
//! database lives at `<rootDir>/nodedb.redb` so periodic snapshotting is a single `fs::copy`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use collection::Collection;
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{StorageError, StorageResult};

pub const USER_COLLECTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("userCollections");
pub const INTERNAL: TableDefinition<&str, &[u8]> = TableDefinition::new("internal");

pub struct NodeMetadataStore {
    db: Database,
    path: PathBuf,
}

impl NodeMetadataStore {
    pub fn open(root_dir: &Path) -> StorageResult<Self> {
        std::fs::create_dir_all(root_dir)?;
        let path = root_dir.join("nodedb.redb");
        let db = Database::create(&path)?;
        // Ensure both buckets exist even on a brand new database, so reads never hit
        // `TableError::TableDoesNotExist` on a store nothing has written to yet.
        let txn = db.begin_write()?;
        txn.open_table(USER_COLLECTIONS)?;
        txn.open_table(INTERNAL)?;
        txn.commit()?;
        Ok(Self { db, path })
    }

    /// Runs `f` against one read transaction, open for the whole closure. Exposed (spec.md §4.4
    /// "read(fn(bucketManager))") so a caller needing to compose more than one lookup can see a
    /// single consistent snapshot instead of issuing separate, independently-committed reads.
    pub fn read<T>(&self, f: impl FnOnce(&redb::ReadTransaction) -> StorageResult<T>) -> StorageResult<T> {
        let txn = self.db.begin_read()?;
        f(&txn)
    }

    /// Runs `f` against one write transaction, committed only if `f` returns `Ok`. Exposed
    /// (spec.md §4.4 "write(fn(bucketManager))") so a caller needing a check-then-act sequence —
    /// `CreateCollection`'s exists-check/quota-count/put, `CreateShard`'s load/append/put — runs
    /// it as a single atomic unit instead of racing against a concurrent call on the same key.
    pub fn write<T>(&self, f: impl FnOnce(&redb::WriteTransaction) -> StorageResult<T>) -> StorageResult<T> {
        let txn = self.db.begin_write()?;
        let result = f(&txn)?;
        txn.commit()?;
        Ok(result)
    }

    pub fn get(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.read(|txn| {
            let t = txn.open_table(table)?;
            let value = t.get(key)?.map(|v| v.value().to_vec());
            Ok(value)
        })
    }

    pub fn put(&self, table: TableDefinition<&str, &[u8]>, key: &str, value: &[u8]) -> StorageResult<()> {
        self.write_batch(table, &[(key.to_string(), value.to_vec())])
    }

    pub fn delete(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> StorageResult<()> {
        self.write(|txn| {
            let mut t = txn.open_table(table)?;
            t.remove(key)?;
            Ok(())
        })
    }

    /// Writes every pair within one transaction, matching §4.4's "writes are batched within one
    /// transaction."
    pub fn write_batch(&self, table: TableDefinition<&str, &[u8]>, pairs: &[(String, Vec<u8>)]) -> StorageResult<()> {
        self.write(|txn| {
            let mut t = txn.open_table(table)?;
            for (key, value) in pairs {
                t.insert(key.as_str(), value.as_slice())?;
            }
            Ok(())
        })
    }

    pub fn delete_batch(&self, table: TableDefinition<&str, &[u8]>, keys: &[String]) -> StorageResult<()> {
        self.write(|txn| {
            let mut t = txn.open_table(table)?;
            for key in keys {
                t.remove(key.as_str())?;
            }
            Ok(())
        })
    }

    /// Ascending-byte-order scan of every key with the given prefix.
    pub fn prefix_scan(&self, table: TableDefinition<&str, &[u8]>, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        self.read(|txn| {
            let t = txn.open_table(table)?;
            let mut out = Vec::new();
            for entry in t.range(prefix..)? {
                let (key, value) = entry?;
                let key = key.value();
                if !key.starts_with(prefix) {
                    break;
                }
                out.push((key.to_string(), value.value().to_vec()));
            }
            Ok(out)
        })
    }

    pub fn for_each(
        &self,
        table: TableDefinition<&str, &[u8]>,
        mut f: impl FnMut(&str, &[u8]),
    ) -> StorageResult<()> {
        self.read(|txn| {
            let t = txn.open_table(table)?;
            for entry in t.iter()? {
                let (key, value) = entry?;
                f(key.value(), value.value());
            }
            Ok(())
        })
    }

    // --- Collection-level convenience wrappers over the raw bucket surface. ---

    pub fn put_collection(&self, collection: &Collection) -> StorageResult<()> {
        let value = rmp_serde::to_vec_named(collection)?;
        self.put(USER_COLLECTIONS, &collection.metadata_key(), &value)
    }

    pub fn get_collection(&self, user_id: &str, collection_id: &str) -> StorageResult<Option<Collection>> {
        let key = collection::metadata_key(user_id, collection_id);
        match self.get(USER_COLLECTIONS, &key)? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete_collection(&self, user_id: &str, collection_id: &str) -> StorageResult<()> {
        self.delete(USER_COLLECTIONS, &collection::metadata_key(user_id, collection_id))
    }

    pub fn list_collections(&self, user_id: &str) -> StorageResult<Vec<Collection>> {
        let prefix = format!("{user_id}/");
        self.prefix_scan(USER_COLLECTIONS, &prefix)?
            .into_iter()
            .map(|(_, value)| rmp_serde::from_slice(&value).map_err(StorageError::from))
            .collect()
    }

    pub fn count_user_collections(&self, user_id: &str) -> StorageResult<usize> {
        Ok(self.prefix_scan(USER_COLLECTIONS, &format!("{user_id}/"))?.len())
    }

    pub fn snapshot(&self, keep_n: usize) -> StorageResult<()> {
        let stamp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let backup_path = self.path.with_extension(format!("redb.bak.{stamp}"));
        std::fs::copy(&self.path, &backup_path)?;
        prune_snapshots(&self.path, keep_n)
    }
}

fn prune_snapshots(db_path: &Path, keep_n: usize) -> StorageResult<()> {
    let dir = db_path.parent().unwrap_or_else(|| Path::new("."));
    let stem = db_path.file_name().and_then(|n| n.to_str()).unwrap_or("nodedb.redb").to_string();
    let prefix = format!("{stem}.bak.");

    let mut backups: Vec<(u64, PathBuf)> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().into_string().ok()?;
            let stamp = name.strip_prefix(&prefix)?.parse::<u64>().ok()?;
            Some((stamp, e.path()))
        })
        .collect();

    backups.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, path) in backups.into_iter().skip(keep_n) {
        let _ = std::fs::remove_file(path);
    }
    Ok(())
}

/// Spawns the periodic full-file snapshot task described in §4.4. Returns the `JoinHandle` so
/// the caller can fold it into its shutdown `JoinSet`.
pub fn spawn_backup_task(
    store: Arc<NodeMetadataStore>,
    frequency_secs: u64,
    keep_n: usize,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if frequency_secs == 0 {
            return;
        }
        let mut interval = tokio::time::interval(Duration::from_secs(frequency_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = store.snapshot(keep_n) {
                        log::warn!("node metadata snapshot failed: {err}");
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use collection::UserPlan;

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

    #[test]
    fn put_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = NodeMetadataStore::open(dir.path()).unwrap();
        let col = collection("u1", "c1");

        store.put_collection(&col).unwrap();
        assert_eq!(store.get_collection("u1", "c1").unwrap(), Some(col));
        store.delete_collection("u1", "c1").unwrap();
        assert_eq!(store.get_collection("u1", "c1").unwrap(), None);
    }

    #[test]
    fn prefix_scan_is_ascending_and_scoped_to_user() {
        let dir = tempfile::tempdir().unwrap();
        let store = NodeMetadataStore::open(dir.path()).unwrap();
        store.put_collection(&collection("u1", "b")).unwrap();
        store.put_collection(&collection("u1", "a")).unwrap();
        store.put_collection(&collection("u2", "z")).unwrap();

        let listed = store.list_collections("u1").unwrap();
        assert_eq!(listed.iter().map(|c| c.id.clone()).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn snapshot_creates_rotated_file_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let store = NodeMetadataStore::open(dir.path()).unwrap();
        store.put_collection(&collection("u1", "c1")).unwrap();

        store.snapshot(1).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        store.snapshot(1).unwrap();

        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".bak."))
            .collect();
        assert_eq!(backups.len(), 1);
    }
}
