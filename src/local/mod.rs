pub mod document_overlay_cache;
pub mod index_manager;
pub mod local_documents_view;
pub mod local_store;
pub mod lru_garbage_collector;
pub mod mutation_queue;
pub mod persistence;
pub mod query_engine;
pub mod reference_set;
pub mod remote_document_cache;
pub mod target_cache;
pub mod target_data;

pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult, QueryResult, UserChangeResult};
pub use lru_garbage_collector::{LruParams, LruResults, CACHE_SIZE_UNLIMITED};
pub use persistence::{ChangeLogBackend, MemoryPersistence, StorageBackend, StorageChange};
pub use query_engine::QueryEngine;
pub use target_data::{TargetData, TargetPurpose};
