mod api;
mod memory;

pub use api::BlockStore;
pub use api::StoreError;
pub use api::BLOCK_DATA_START;
pub use memory::MemoryBlockStore;

/// How the runtime shares the store between the client write path and the
/// replication tasks. Writes never hold the lock across an await.
pub(crate) type SharedBlockStore = std::sync::Arc<std::sync::RwLock<Box<dyn BlockStore>>>;
