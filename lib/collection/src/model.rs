use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type UserId = String;
pub type CollectionName = String;
pub type ShardId = Uuid;

/// Quotas attached to a collection via the owning user's active plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPlan {
    pub max_collections: u32,
    pub max_collection_point_count: u64,
    pub max_point_size: u64,
    pub shard_backup_frequency: u64,
    pub shard_backup_count: u32,
}

/// A user-owned named container, split across one or more shards.
///
/// Invariant: while a collection exists in the node metadata of its owner, every id in
/// `shard_ids` was created by that owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub user_id: UserId,
    pub id: CollectionName,
    pub replicas: u32,
    pub created_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    /// Opaque to the core; validated only by the shard engine.
    pub index_schema: serde_json::Value,
    pub shard_ids: Vec<ShardId>,
    pub user_plan: UserPlan,
}

impl Collection {
    /// The node-metadata-store key this collection is stored under.
    pub fn metadata_key(&self) -> String {
        metadata_key(&self.user_id, &self.id)
    }
}

pub fn metadata_key(user_id: &str, collection_id: &str) -> String {
    format!("{user_id}/{collection_id}")
}

/// Splits a node-metadata key back into `(user_id, collection_id)`.
pub fn split_metadata_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('/')
}

/// Collection ids are 3-24 lowercase alphanumeric characters.
pub fn is_valid_collection_id(id: &str) -> bool {
    (3..=24).contains(&id.len()) && id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ids() {
        assert!(is_valid_collection_id("abc"));
        assert!(is_valid_collection_id("a1b2c3d4e5f6g7h8i9j0k1l2"));
        assert!(!is_valid_collection_id("ab"));
        assert!(!is_valid_collection_id(&"a".repeat(25)));
        assert!(!is_valid_collection_id("Has-Upper"));
        assert!(!is_valid_collection_id("has_underscore"));
    }

    #[test]
    fn metadata_key_round_trips() {
        let key = metadata_key("user-1", "coll-1");
        assert_eq!(split_metadata_key(&key), Some(("user-1", "coll-1")));
    }
}
