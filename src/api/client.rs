use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_channel::Receiver;
use log::{debug, info, warn};

use crate::api::settings::Settings;
use crate::api::snapshot::DocumentSnapshot;
use crate::core::{
    EventManager, ListenOptions, ListenSource, ListenerId, Query, SnapshotCallback, SnapshotMetadata, SyncEngine,
    ViewSnapshot,
};
use crate::error::{cancelled, unavailable, SyncResult};
use crate::local::{LocalStore, LruResults, MemoryPersistence};
use crate::model::{BatchId, DocumentKey, Mutation, SnapshotVersion};
use crate::remote::credentials::{CredentialsProvider, EmptyCredentialsProvider, User};
use crate::remote::datastore::Datastore;
use crate::remote::online_state_tracker::OnlineState;
use crate::remote::persistent_stream::StreamConnector;
use crate::remote::remote_store::{RemoteEventSink, RemoteStore, RemoteStoreEvent};
use crate::remote::serializer::JsonSerializer;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

pub const DEFAULT_DATABASE_NAME: &str = "projects/default/databases/(default)";

/// Where a one-shot document read may be answered from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Source {
    /// The server when reachable, the cache otherwise.
    #[default]
    Default,
    Cache,
    /// Fails instead of falling back to the cache.
    Server,
}

/// Engine state owned by the client's queue.
pub(crate) struct ClientState {
    sync_engine: SyncEngine,
    remote_store: RemoteStore,
    event_manager: EventManager,
    settings: Settings,
    gc_task: Option<DelayedOperation>,
}

impl ClientState {
    fn handle_remote_event(&mut self, event: RemoteStoreEvent) {
        self.remote_store.handle_event(&mut self.sync_engine, event);
        self.dispatch();
    }

    fn dispatch(&mut self) {
        self.event_manager.dispatch(&mut self.sync_engine);
    }

    fn listen(&mut self, query: Query, options: ListenOptions, callback: SnapshotCallback) -> SyncResult<ListenerId> {
        self.event_manager
            .listen(&mut self.sync_engine, &mut self.remote_store, query, options, callback)
    }

    fn unlisten(&mut self, query: &Query, listener_id: ListenerId) {
        if let Err(err) = self
            .event_manager
            .unlisten(&mut self.sync_engine, &mut self.remote_store, query, listener_id)
        {
            warn!("Failed to stop listening to {}: {err}", query.canonical_id());
        }
    }

    fn collect_garbage(&mut self) -> SyncResult<LruResults> {
        let params = self.settings.lru_params();
        self.sync_engine.local_store_mut().collect_garbage(&params)
    }
}

/// Routes remote store completions back onto the client's queue.
#[derive(Default)]
struct QueueSink {
    queue: OnceLock<AsyncQueue<ClientState>>,
}

impl RemoteEventSink for QueueSink {
    fn deliver(&self, event: RemoteStoreEvent) {
        match self.queue.get() {
            Some(queue) => queue.enqueue_and_forget(move |state| state.handle_remote_event(event)),
            None => debug!("Dropping {event:?} delivered before the client started"),
        }
    }

    fn deliver_after(&self, timer_id: TimerId, delay: Duration, event: RemoteStoreEvent) -> DelayedOperation {
        match self.queue.get() {
            Some(queue) => queue.enqueue_after_delay(timer_id, delay, move |state| state.handle_remote_event(event)),
            None => {
                let handle = DelayedOperation::new(timer_id);
                handle.cancel();
                handle
            }
        }
    }
}

pub struct ClientBuilder {
    datastore: Arc<dyn Datastore>,
    auth: Arc<dyn CredentialsProvider>,
    app_check: Arc<dyn CredentialsProvider>,
    persistence: MemoryPersistence,
    user: User,
    database_name: String,
    settings: Settings,
}

impl ClientBuilder {
    fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self {
            datastore,
            auth: Arc::new(EmptyCredentialsProvider),
            app_check: Arc::new(EmptyCredentialsProvider),
            persistence: MemoryPersistence::new(),
            user: User::unauthenticated(),
            database_name: DEFAULT_DATABASE_NAME.to_string(),
            settings: Settings::default(),
        }
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn auth(mut self, provider: Arc<dyn CredentialsProvider>) -> Self {
        self.auth = provider;
        self
    }

    pub fn app_check(mut self, provider: Arc<dyn CredentialsProvider>) -> Self {
        self.app_check = provider;
        self
    }

    pub fn persistence(mut self, persistence: MemoryPersistence) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn user(mut self, user: User) -> Self {
        self.user = user;
        self
    }

    pub fn database_name(mut self, name: impl Into<String>) -> Self {
        self.database_name = name.into();
        self
    }

    /// Validates the settings and starts the client's queue and network.
    pub fn build(self) -> SyncResult<Client> {
        self.settings.validate()?;

        let sink = Arc::new(QueueSink::default());
        let connector = StreamConnector {
            datastore: self.datastore,
            auth: self.auth,
            app_check: self.app_check,
            sink: Arc::clone(&sink) as Arc<dyn RemoteEventSink>,
        };
        let remote_store = RemoteStore::new(
            connector,
            JsonSerializer::new(self.database_name),
            &self.settings.remote_store_config(),
        );
        let local_store = LocalStore::new(self.persistence, self.settings.query_engine(), self.user);
        let state = ClientState {
            sync_engine: SyncEngine::new(local_store, self.settings.max_concurrent_limbo_resolutions),
            remote_store,
            event_manager: EventManager::new(),
            settings: self.settings.clone(),
            gc_task: None,
        };

        let queue = AsyncQueue::start(state);
        let _ = sink.queue.set(queue.clone());
        queue.enqueue_and_forget(|state| {
            state.remote_store.start(&mut state.sync_engine);
            state.dispatch();
        });
        if self.settings.gc_enabled() {
            let initial_delay = self.settings.gc_initial_delay;
            let scheduler = queue.clone();
            queue.enqueue_and_forget(move |state| {
                state.gc_task = Some(schedule_garbage_collection(&scheduler, initial_delay));
            });
        }
        info!("Client started");

        Ok(Client {
            inner: Arc::new(ClientInner { queue }),
        })
    }
}

struct ClientInner {
    queue: AsyncQueue<ClientState>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.queue.shutdown();
    }
}

/// Offline-first handle to a document database.
///
/// Reads are answered from the local cache and kept current through the watch
/// stream; writes apply locally at once and are sent to the server in order.
/// Clones share one engine.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder(datastore: Arc<dyn Datastore>) -> ClientBuilder {
        ClientBuilder::new(datastore)
    }

    /// Starts listening to `query`. The callback receives every raised snapshot,
    /// or the error that ended the listen.
    pub async fn listen<F>(&self, query: Query, options: ListenOptions, callback: F) -> SyncResult<ListenerRegistration>
    where
        F: Fn(SyncResult<ViewSnapshot>) + Send + Sync + 'static,
    {
        let callback: SnapshotCallback = Arc::new(callback);
        let listened = query.clone();
        let listener_id = self
            .inner
            .queue
            .enqueue(move |state| state.listen(listened, options, callback))
            .await?;
        Ok(ListenerRegistration {
            queue: self.inner.queue.clone(),
            query,
            listener_id,
            detached: false,
        })
    }

    /// Reads one document.
    pub async fn get_document(&self, key: DocumentKey, source: Source) -> SyncResult<DocumentSnapshot> {
        if source == Source::Cache {
            return self
                .inner
                .queue
                .enqueue(move |state| read_document_from_cache(state, key))
                .await;
        }

        let (sender, receiver) = async_channel::bounded(1);
        let wanted = key.clone();
        let options = ListenOptions {
            include_metadata_changes: true,
            source: ListenSource::Default,
            wait_for_sync_when_online: true,
        };
        let registration = self
            .listen(Query::document(&key), options, move |result| {
                let outcome = result.and_then(|snapshot| document_from_view(&wanted, &snapshot, source));
                let _ = sender.try_send(outcome);
            })
            .await?;
        let outcome = receiver
            .recv()
            .await
            .unwrap_or_else(|_| Err(cancelled("The client has been shut down")));
        registration.remove();
        outcome
    }

    /// Applies `mutations` locally as one batch and resolves once the server
    /// acknowledges it.
    pub async fn write(&self, mutations: Vec<Mutation>) -> SyncResult<()> {
        self.enqueue_write(mutations).await?.acknowledged().await
    }

    /// Applies `mutations` locally and returns without waiting for the server.
    pub async fn enqueue_write(&self, mutations: Vec<Mutation>) -> SyncResult<PendingWrite> {
        let (completion, receiver) = async_channel::bounded(1);
        let batch_id = self
            .inner
            .queue
            .enqueue(move |state| {
                let result = state
                    .sync_engine
                    .write(&mut state.remote_store, mutations, completion);
                state.dispatch();
                result
            })
            .await?;
        Ok(PendingWrite { batch_id, receiver })
    }

    pub async fn enable_network(&self) -> SyncResult<()> {
        self.inner
            .queue
            .enqueue(|state| {
                state.remote_store.enable_network(&mut state.sync_engine);
                state.dispatch();
                Ok(())
            })
            .await
    }

    /// Stops both streams. Reads and writes keep working against the cache.
    pub async fn disable_network(&self) -> SyncResult<()> {
        self.inner
            .queue
            .enqueue(|state| {
                state.remote_store.disable_network(&mut state.sync_engine);
                state.dispatch();
                Ok(())
            })
            .await
    }

    pub async fn online_state(&self) -> SyncResult<OnlineState> {
        self.inner
            .queue
            .enqueue(|state| Ok(state.remote_store.online_state()))
            .await
    }

    /// Switches to `user`: streams reconnect with fresh credentials and views
    /// are recomputed against the new user's pending writes.
    pub async fn handle_credential_change(&self, user: User) -> SyncResult<()> {
        self.inner
            .queue
            .enqueue(move |state| {
                state.remote_store.begin_credential_change(&mut state.sync_engine);
                let result = state
                    .sync_engine
                    .handle_credential_change(&mut state.remote_store, user);
                state.remote_store.end_credential_change(&mut state.sync_engine);
                state.dispatch();
                result
            })
            .await
    }

    /// Runs one garbage collection pass now.
    pub async fn collect_garbage(&self) -> SyncResult<LruResults> {
        self.inner.queue.enqueue(|state| state.collect_garbage()).await
    }

    /// Stops the network and the queue. Pending operations fail with `Cancelled`.
    pub async fn shutdown(&self) -> SyncResult<()> {
        if self.inner.queue.is_shut_down() {
            return Ok(());
        }
        let result = self
            .inner
            .queue
            .enqueue(|state| {
                if let Some(task) = state.gc_task.take() {
                    task.cancel();
                }
                state.remote_store.shutdown(&mut state.sync_engine);
                state.dispatch();
                Ok(())
            })
            .await;
        self.inner.queue.shutdown();
        info!("Client shut down");
        result
    }
}

/// A batch applied locally and waiting for the server.
#[derive(Debug)]
pub struct PendingWrite {
    batch_id: BatchId,
    receiver: Receiver<SyncResult<()>>,
}

impl PendingWrite {
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub async fn acknowledged(self) -> SyncResult<()> {
        self.receiver
            .recv()
            .await
            .unwrap_or_else(|_| Err(cancelled("The client has been shut down")))
    }
}

/// Keeps a listener attached. Dropping it, or calling [`remove`](Self::remove),
/// stops the listener.
pub struct ListenerRegistration {
    queue: AsyncQueue<ClientState>,
    query: Query,
    listener_id: ListenerId,
    detached: bool,
}

impl ListenerRegistration {
    pub fn listener_id(&self) -> ListenerId {
        self.listener_id
    }

    pub fn remove(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        let query = self.query.clone();
        let listener_id = self.listener_id;
        self.queue
            .enqueue_and_forget(move |state| state.unlisten(&query, listener_id));
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.detach();
    }
}

fn schedule_garbage_collection(queue: &AsyncQueue<ClientState>, delay: Duration) -> DelayedOperation {
    let scheduler = queue.clone();
    queue.enqueue_after_delay(TimerId::GarbageCollection, delay, move |state| {
        match state.collect_garbage() {
            Ok(results) if results.did_run => debug!(
                "Garbage collection removed {} targets and {} documents",
                results.targets_removed, results.documents_removed
            ),
            Ok(_) => debug!("Garbage collection skipped; cache is below its threshold"),
            Err(err) => warn!("Garbage collection failed: {err}"),
        }
        let regular_delay = state.settings.gc_regular_delay;
        state.gc_task = Some(schedule_garbage_collection(&scheduler, regular_delay));
    })
}

fn read_document_from_cache(state: &mut ClientState, key: DocumentKey) -> SyncResult<DocumentSnapshot> {
    let document = state.sync_engine.local_store_mut().read_document(&key)?;
    let metadata = SnapshotMetadata::new(true, document.has_local_mutations());
    if document.is_found_document() {
        Ok(DocumentSnapshot::new(
            key,
            Some(document.data().clone()),
            document.version(),
            metadata,
        ))
    } else if document.is_no_document() {
        Ok(DocumentSnapshot::new(key, None, document.version(), metadata))
    } else {
        Err(unavailable(
            "Failed to get document from cache. The document may exist on the server; \
             read it with Source::Default instead.",
        ))
    }
}

fn document_from_view(key: &DocumentKey, snapshot: &ViewSnapshot, source: Source) -> SyncResult<DocumentSnapshot> {
    let document = snapshot.docs.get(key);
    match document {
        None if snapshot.from_cache => Err(unavailable("Failed to get document because the client is offline.")),
        Some(_) if snapshot.from_cache && source == Source::Server => Err(unavailable(
            "Failed to get document from the server. The document exists in the local cache; \
             read it with Source::Default to use the cached copy.",
        )),
        _ => {
            let metadata = SnapshotMetadata::new(snapshot.from_cache, snapshot.mutated_keys.contains(key));
            Ok(DocumentSnapshot::new(
                key.clone(),
                document.map(|document| document.data().clone()),
                document.map_or_else(SnapshotVersion::min, |document| document.version()),
                metadata,
            ))
        }
    }
}
