use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;

use crate::core::sync_engine::{SyncEngine, SyncEngineEvent};
use crate::core::view_snapshot::ViewSnapshot;
use crate::core::Query;
use crate::error::{SyncError, SyncResult};
use crate::remote::online_state_tracker::OnlineState;
use crate::remote::remote_store::RemoteStore;

pub type ListenerId = u64;

/// Receives every snapshot raised for a listener, or the error that ended it.
pub type SnapshotCallback = Arc<dyn Fn(SyncResult<ViewSnapshot>) + Send + Sync>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ListenSource {
    /// Local results first, then the server's.
    #[default]
    Default,
    /// Only the local cache; no watch target is registered.
    Cache,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Also raise snapshots whose only change is metadata.
    pub include_metadata_changes: bool,
    pub source: ListenSource,
    /// Hold back the first cached snapshot while the client may still be online.
    pub wait_for_sync_when_online: bool,
}

impl ListenOptions {
    pub fn with_metadata_changes() -> Self {
        Self {
            include_metadata_changes: true,
            ..Self::default()
        }
    }

    pub fn cache_only() -> Self {
        Self {
            source: ListenSource::Cache,
            ..Self::default()
        }
    }
}

/// Decides which view snapshots one listener gets to see.
pub struct QueryListener {
    id: ListenerId,
    options: ListenOptions,
    callback: SnapshotCallback,
    raised_initial_event: bool,
    last_snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    pub fn new(id: ListenerId, options: ListenOptions, callback: SnapshotCallback) -> Self {
        Self {
            id,
            options,
            callback,
            raised_initial_event: false,
            last_snapshot: None,
            online_state: OnlineState::Unknown,
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn listens_to_remote_store(&self) -> bool {
        self.options.source != ListenSource::Cache
    }

    /// Returns whether a snapshot reached the callback.
    pub fn on_view_snapshot(&mut self, snapshot: &ViewSnapshot) -> bool {
        let snapshot = if self.options.include_metadata_changes {
            snapshot.clone()
        } else {
            snapshot.without_metadata_changes()
        };

        let mut raised = false;
        if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                self.raise_initial_event(&snapshot);
                raised = true;
            }
        } else if self.should_raise_event(&snapshot) {
            (self.callback)(Ok(snapshot.clone()));
            raised = true;
        }
        self.last_snapshot = Some(snapshot);
        raised
    }

    pub fn on_error(&self, error: SyncError) {
        (self.callback)(Err(error));
    }

    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> bool {
        self.online_state = online_state;
        let Some(snapshot) = self.last_snapshot.clone() else {
            return false;
        };
        if !self.raised_initial_event && self.should_raise_initial_event(&snapshot, online_state) {
            self.raise_initial_event(&snapshot);
            return true;
        }
        false
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache || !self.listens_to_remote_store() {
            return true;
        }
        // Unknown counts as online: it settles on Online or Offline soon enough.
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        !snapshot.docs.is_empty() || snapshot.has_cached_results || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.doc_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .last_snapshot
            .as_ref()
            .is_some_and(|last| last.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot) {
        let initial = ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.docs.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
            snapshot.has_cached_results,
        );
        self.raised_initial_event = true;
        (self.callback)(Ok(initial));
    }
}

struct QueryListeners {
    query: Query,
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<QueryListener>,
}

impl QueryListeners {
    fn listens_to_remote_store(&self) -> bool {
        self.listeners.iter().any(QueryListener::listens_to_remote_store)
    }
}

/// Fans view snapshots out to listeners and reference-counts views per query.
pub struct EventManager {
    queries: BTreeMap<String, QueryListeners>,
    online_state: OnlineState,
    next_listener_id: ListenerId,
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EventManager {
    pub fn new() -> Self {
        Self {
            queries: BTreeMap::new(),
            online_state: OnlineState::Unknown,
            next_listener_id: 1,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.queries.values().map(|info| info.listeners.len()).sum()
    }

    /// Adds a listener, starting the query's view on its first listener and its
    /// watch target on its first non-cache listener.
    pub fn listen(
        &mut self,
        sync_engine: &mut SyncEngine,
        remote: &mut RemoteStore,
        query: Query,
        options: ListenOptions,
        callback: SnapshotCallback,
    ) -> SyncResult<ListenerId> {
        let canonical_id = query.canonical_id();
        let mut listener = QueryListener::new(self.next_listener_id, options, callback);
        self.next_listener_id += 1;

        let existing = self.queries.get(&canonical_id);
        let first_listen = existing.is_none();
        let first_remote_listen = listener.listens_to_remote_store()
            && existing.is_some_and(|info| !info.listens_to_remote_store());

        if first_listen {
            let snapshot = sync_engine.listen(remote, &query, listener.listens_to_remote_store())?;
            self.queries.insert(
                canonical_id.clone(),
                QueryListeners {
                    query: query.clone(),
                    view_snapshot: Some(snapshot),
                    listeners: Vec::new(),
                },
            );
        } else if first_remote_listen {
            sync_engine.listen_to_remote(remote, &query)?;
        }

        listener.apply_online_state_change(self.online_state);
        let id = listener.id();
        if let Some(info) = self.queries.get_mut(&canonical_id) {
            if let Some(snapshot) = &info.view_snapshot {
                listener.on_view_snapshot(snapshot);
            }
            info.listeners.push(listener);
        }
        self.dispatch(sync_engine);
        Ok(id)
    }

    /// Removes a listener, stopping the view when it was the last one.
    pub fn unlisten(
        &mut self,
        sync_engine: &mut SyncEngine,
        remote: &mut RemoteStore,
        query: &Query,
        listener_id: ListenerId,
    ) -> SyncResult<()> {
        let canonical_id = query.canonical_id();
        let Some(info) = self.queries.get_mut(&canonical_id) else {
            return Ok(());
        };
        let Some(position) = info.listeners.iter().position(|listener| listener.id() == listener_id) else {
            return Ok(());
        };
        let removed = info.listeners.remove(position);
        let last_listen = info.listeners.is_empty();
        let last_remote_listen = removed.listens_to_remote_store() && !info.listens_to_remote_store();

        if last_listen {
            self.queries.remove(&canonical_id);
            sync_engine.unlisten(remote, query, removed.listens_to_remote_store())?;
        } else if last_remote_listen {
            sync_engine.unlisten_from_remote(remote, query);
        }
        self.dispatch(sync_engine);
        Ok(())
    }

    /// Delivers everything the sync engine raised since the last dispatch.
    pub fn dispatch(&mut self, sync_engine: &mut SyncEngine) {
        for event in sync_engine.take_events() {
            match event {
                SyncEngineEvent::Snapshots(snapshots) => self.on_watch_change(snapshots),
                SyncEngineEvent::ListenError { query, error } => self.on_watch_error(&query, error),
                SyncEngineEvent::OnlineStateChanged(state) => self.on_online_state_change(state),
            }
        }
    }

    fn on_watch_change(&mut self, snapshots: Vec<ViewSnapshot>) {
        for snapshot in snapshots {
            let Some(info) = self.queries.get_mut(&snapshot.query.canonical_id()) else {
                continue;
            };
            for listener in &mut info.listeners {
                listener.on_view_snapshot(&snapshot);
            }
            info.view_snapshot = Some(snapshot);
        }
    }

    fn on_watch_error(&mut self, query: &Query, error: SyncError) {
        let Some(info) = self.queries.remove(&query.canonical_id()) else {
            return;
        };
        debug!("Listen for {} failed: {error}", info.query.canonical_id());
        for listener in &info.listeners {
            listener.on_error(error.clone());
        }
    }

    fn on_online_state_change(&mut self, state: OnlineState) {
        self.online_state = state;
        for info in self.queries.values_mut() {
            for listener in &mut info.listeners {
                listener.apply_online_state_change(state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::core::view_snapshot::{DocumentSet, ViewSnapshot};
    use crate::model::DocumentKeySet;
    use crate::test_support::{doc, query};

    fn recording_listener(options: ListenOptions) -> (QueryListener, Arc<Mutex<Vec<ViewSnapshot>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: SnapshotCallback = Arc::new(move |snapshot| {
            sink.lock().unwrap().push(snapshot.unwrap());
        });
        (QueryListener::new(1, options, callback), seen)
    }

    fn snapshot(from_cache: bool, paths: &[&str], sync_state_changed: bool) -> ViewSnapshot {
        let rooms = query("rooms");
        let mut docs = DocumentSet::new(&rooms);
        for path in paths {
            docs.insert(doc(path, 1, &[]));
        }
        let mut snapshot =
            ViewSnapshot::from_initial_documents(rooms, docs, DocumentKeySet::new(), from_cache, false);
        snapshot.sync_state_changed = sync_state_changed;
        snapshot
    }

    #[test]
    fn empty_cached_snapshot_waits_until_offline() {
        let (mut listener, seen) = recording_listener(ListenOptions::default());
        assert!(!listener.on_view_snapshot(&snapshot(true, &[], true)));
        assert!(seen.lock().unwrap().is_empty());

        assert!(listener.apply_online_state_change(OnlineState::Offline));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].from_cache);
    }

    #[test]
    fn cached_documents_are_raised_immediately() {
        let (mut listener, seen) = recording_listener(ListenOptions::default());
        assert!(listener.on_view_snapshot(&snapshot(true, &["rooms/a"], true)));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn cache_only_listener_raises_empty_results() {
        let (mut listener, seen) = recording_listener(ListenOptions::cache_only());
        assert!(listener.on_view_snapshot(&snapshot(true, &[], true)));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn sync_state_change_needs_metadata_opt_in() {
        let (mut plain, plain_seen) = recording_listener(ListenOptions::default());
        let (mut metadata, metadata_seen) = recording_listener(ListenOptions::with_metadata_changes());
        for listener in [&mut plain, &mut metadata] {
            listener.on_view_snapshot(&snapshot(true, &["rooms/a"], true));
        }

        let mut synced = snapshot(false, &["rooms/a"], true);
        synced.doc_changes.clear();
        assert!(!plain.on_view_snapshot(&synced));
        assert!(metadata.on_view_snapshot(&synced));
        assert_eq!(plain_seen.lock().unwrap().len(), 1);
        assert_eq!(metadata_seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn wait_for_sync_holds_cached_results_while_online() {
        let options = ListenOptions {
            include_metadata_changes: true,
            wait_for_sync_when_online: true,
            ..ListenOptions::default()
        };
        let (mut listener, seen) = recording_listener(options);
        listener.apply_online_state_change(OnlineState::Online);
        assert!(!listener.on_view_snapshot(&snapshot(true, &["rooms/a"], true)));
        assert!(listener.on_view_snapshot(&snapshot(false, &["rooms/a"], true)));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].from_cache);
    }
}
