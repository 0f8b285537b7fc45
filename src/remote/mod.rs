pub mod bloom_filter;
pub mod credentials;
pub mod datastore;
pub mod online_state_tracker;
pub mod persistent_stream;
pub mod remote_event;
pub mod remote_store;
pub mod rpc_error;
pub mod serializer;
pub mod watch_change;
pub mod watch_change_aggregator;
pub mod watch_stream;
pub mod write_stream;

pub use credentials::{CredentialsProvider, EmptyCredentialsProvider, StaticCredentialsProvider, StreamCredentials, User};
pub use datastore::{Datastore, InMemoryDatastore, InMemoryServer, InMemoryTransport, ServerStream, StreamHandle, StreamKind};
pub use online_state_tracker::OnlineState;
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::{RemoteStore, RemoteStoreConfig, RemoteSyncer};
pub use serializer::JsonSerializer;
