//! Wire types for the "ClusterNode" RPC service (SPEC_FULL.md §4.3/§6).
//!
//! Every call is one `Header` (who it's from, where it's ultimately headed, which method, a
//! sequence number for the client to match replies to calls) paired with a method-specific,
//! msgpack-encoded body. `dest` is compared against the receiving process's own hostname by the
//! dispatcher in `rpc::server`; a mismatch means "forward, don't execute".

use collection::{Collection, ShardId, UserId};
use serde::{Deserialize, Serialize};
use shard_engine::{Point, SearchRequest, SearchResult, ShardInfo};
use uuid::Uuid;

use crate::error::{ErrorTag, StorageError};

pub type Peer = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub source: Peer,
    pub dest: Peer,
    pub method: Method,
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Ping,
    CreateCollection,
    DeleteCollection,
    ListCollections,
    GetCollection,
    CreateShard,
    GetShardInfo,
    DeleteCollectionShards,
    InsertPoints,
    UpdatePoints,
    DeletePoints,
    SearchPoints,
    SetNodeKeyValue,
    SendShard,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "Ping",
            Self::CreateCollection => "CreateCollection",
            Self::DeleteCollection => "DeleteCollection",
            Self::ListCollections => "ListCollections",
            Self::GetCollection => "GetCollection",
            Self::CreateShard => "CreateShard",
            Self::GetShardInfo => "GetShardInfo",
            Self::DeleteCollectionShards => "DeleteCollectionShards",
            Self::InsertPoints => "InsertPoints",
            Self::UpdatePoints => "UpdatePoints",
            Self::DeletePoints => "DeletePoints",
            Self::SearchPoints => "SearchPoints",
            Self::SetNodeKeyValue => "SetNodeKeyValue",
            Self::SendShard => "SendShard",
        }
    }
}

/// A raw frame as it travels over the wire: header plus an opaque msgpack-encoded body. Decoding
/// the body into a concrete request/reply type happens one layer up, once the method is known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub header: Header,
    pub body: Vec<u8>,
}

/// `Result<T, StorageError>` is not directly serializable (errors aren't `Deserialize`); this is
/// the wire shape that survives a round trip, carrying the explicit error tag the "error
/// sentinels across RPC" redesign calls for.
#[derive(Debug, Serialize, Deserialize)]
pub enum WireResult<T> {
    Ok(T),
    Err { tag: ErrorTag, message: String },
}

impl<T> WireResult<T> {
    pub fn from_result(result: Result<T, StorageError>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(err) => Self::Err { tag: err.wire_tag(), message: err.to_string() },
        }
    }

    pub fn into_result(self) -> Result<T, StorageError> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::Err { tag, message } => Err(StorageError::from_wire(tag, message)),
        }
    }
}

macro_rules! rpc_pair {
    ($req:ident { $($rf:ident: $rt:ty),* $(,)? } -> $rep:ident { $($pf:ident: $pt:ty),* $(,)? }) => {
        #[derive(Debug, Clone, Serialize, Deserialize)]
        pub struct $req { $(pub $rf: $rt,)* }

        #[derive(Debug, Clone, Serialize, Deserialize)]
        pub struct $rep { $(pub $pf: $pt,)* }
    };
}

rpc_pair!(PingRequest {} -> PingReply { pong: bool });

rpc_pair!(CreateCollectionRequest { collection: Collection } -> CreateCollectionReply {
    already_exists: bool,
    quota_reached: bool,
});

rpc_pair!(DeleteCollectionRequest { user_id: UserId, collection_id: String } -> DeleteCollectionReply {});

rpc_pair!(ListCollectionsRequest { user_id: UserId } -> ListCollectionsReply {
    collections: Vec<Collection>,
});

rpc_pair!(GetCollectionRequest { user_id: UserId, collection_id: String } -> GetCollectionReply {
    collection: Option<Collection>,
});

rpc_pair!(CreateShardRequest { user_id: UserId, collection_id: String } -> CreateShardReply {
    shard_id: ShardId,
});

rpc_pair!(GetShardInfoRequest {
    user_id: UserId,
    collection_id: String,
    shard_id: ShardId,
} -> GetShardInfoReply { info: ShardInfo });

rpc_pair!(DeleteCollectionShardsRequest {
    user_id: UserId,
    collection_id: String,
    shard_ids: Vec<ShardId>,
} -> DeleteCollectionShardsReply { deleted_shard_ids: Vec<ShardId> });

rpc_pair!(InsertPointsRequest {
    user_id: UserId,
    collection_id: String,
    shard_id: ShardId,
    points: Vec<Point>,
} -> InsertPointsReply {});

rpc_pair!(UpdatePointsRequest {
    user_id: UserId,
    collection_id: String,
    shard_id: ShardId,
    points: Vec<Point>,
} -> UpdatePointsReply { updated_ids: Vec<Uuid> });

rpc_pair!(DeletePointsRequest {
    user_id: UserId,
    collection_id: String,
    shard_id: ShardId,
    ids: Vec<Uuid>,
} -> DeletePointsReply { deleted_ids: Vec<Uuid> });

rpc_pair!(SearchPointsRequest {
    user_id: UserId,
    collection_id: String,
    shard_id: ShardId,
    request: SearchRequest,
} -> SearchPointsReply { results: Vec<SearchResult> });

rpc_pair!(SetNodeKeyValueRequest {
    bucket: String,
    pairs: Vec<(String, Vec<u8>)>,
} -> SetNodeKeyValueReply { count: usize });

rpc_pair!(SendShardRequest {
    user_id: UserId,
    collection_id: String,
    shard_id: ShardId,
    chunk_index: u64,
    chunk_data: Vec<u8>,
} -> SendShardReply { checksum: Option<u64> });
