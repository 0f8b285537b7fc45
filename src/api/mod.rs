pub mod client;
pub mod settings;
pub mod snapshot;

pub use client::{Client, ClientBuilder, ListenerRegistration, PendingWrite, Source, DEFAULT_DATABASE_NAME};
pub use settings::{BackoffSettings, Settings};
pub use snapshot::DocumentSnapshot;
