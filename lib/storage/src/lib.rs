//! Node-level coordination: RPC transport, node metadata store, RPC handlers, the public
//! action API, and cross-peer sync (SPEC_FULL.md §4.3-§4.8). Analogous to the teacher's
//! `storage` crate owning the node's table-of-content.

pub mod actions;
pub mod distribute;
pub mod envelope;
pub mod error;
pub mod handlers;
pub mod metadata_store;
pub mod metrics;
pub mod rpc;
pub mod search_merge;
pub mod sync;

pub use actions::{Actions, FailedPoint, FailedRange};
pub use error::{ErrorTag, StorageError, StorageResult};
pub use handlers::Handlers;
pub use metadata_store::NodeMetadataStore;
pub use metrics::Metrics;
pub use rpc::RpcClient;
pub use sync::Sync;
