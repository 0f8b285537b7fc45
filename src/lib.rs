//! Offline-first document sync engine.
//!
//! A [`Client`](api::Client) keeps a local cache of server documents that stays
//! usable without a network connection. Writes apply to the cache immediately
//! and are replicated over a long-lived write stream; live queries are answered
//! from the cache and kept current through a watch stream.
//!
//! ```no_run
//! use docsync::api::{Client, Source};
//! use docsync::core::{ListenOptions, Query};
//! use docsync::model::DocumentKey;
//! use docsync::remote::InMemoryTransport;
//!
//! # async fn run() -> docsync::error::SyncResult<()> {
//! let (datastore, _server) = InMemoryTransport::pair();
//! let client = Client::builder(datastore).build()?;
//!
//! let rooms = Query::collection("rooms")?;
//! let _registration = client
//!     .listen(rooms, ListenOptions::default(), |snapshot| {
//!         if let Ok(snapshot) = snapshot {
//!             println!("{} rooms (from cache: {})", snapshot.docs.len(), snapshot.from_cache);
//!         }
//!     })
//!     .await?;
//!
//! let lobby = client
//!     .get_document(DocumentKey::from_string("rooms/lobby")?, Source::Cache)
//!     .await;
//! # let _ = lobby;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod platform;
pub mod remote;
pub mod util;
pub mod value;

#[cfg(test)]
pub(crate) mod test_support;
