//! Data model and shard lifecycle management for one user collection (SPEC_FULL.md §4.3-4.5).
//!
//! This crate never talks to peers or the node metadata store directly -- that is `storage`'s
//! job. It owns the in-process parts: what a collection looks like, and how shard engine handles
//! are loaded, shared, and timed out.

mod error;
mod model;
mod shard_manager;

pub use error::{CollectionError, CollectionResult};
pub use model::{
    is_valid_collection_id, metadata_key, split_metadata_key, Collection, CollectionName, ShardId,
    UserId, UserPlan,
};
pub use shard_manager::{shard_dir, ShardContext, ShardManager};
