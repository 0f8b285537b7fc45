pub mod event_manager;
mod query;
pub mod sync_engine;
mod target_id_generator;
pub mod view;
pub mod view_snapshot;

pub use event_manager::{EventManager, ListenOptions, ListenSource, ListenerId, QueryListener, SnapshotCallback};
pub use query::{Direction, FieldFilter, LimitType, Operator, OrderBy, Query};
pub use sync_engine::{SyncEngine, SyncEngineEvent, WriteCompletion};
pub use target_id_generator::TargetIdGenerator;
pub use view::{LimboDocumentChange, SyncState, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{
    ChangeType, DocumentChangeSet, DocumentSet, DocumentViewChange, SnapshotMetadata, ViewSnapshot,
};
