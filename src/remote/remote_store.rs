use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::error::{is_permanent_error, is_permanent_write_error, SyncError, SyncResult};
use crate::local::target_data::TargetData;
use crate::model::{
    BatchId, DocumentKeySet, MutationBatch, MutationBatchResult, SnapshotVersion, TargetId, BATCH_ID_UNKNOWN,
};
use crate::remote::datastore::StreamKind;
use crate::remote::online_state_tracker::{OnlineState, OnlineStateTracker};
use crate::remote::persistent_stream::{PersistentStream, StreamConnector, StreamEvent, StreamTransition};
use crate::remote::remote_event::RemoteEvent;
use crate::remote::serializer::{JsonSerializer, WriteResponse};
use crate::remote::watch_change::{TargetChangeState, WatchChange};
use crate::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::remote::watch_stream::WatchStream;
use crate::remote::write_stream::{WriteStream, WriteStreamMessage, MAX_PENDING_WRITES};
use crate::util::async_queue::{DelayedOperation, TimerId};
use crate::util::backoff::ExponentialBackoff;

/// Asynchronous completions routed back to the remote store through the queue.
#[derive(Debug)]
pub enum RemoteStoreEvent {
    Stream {
        kind: StreamKind,
        generation: u64,
        event: StreamEvent,
    },
    OnlineStateTimeout,
    /// Retry the streams after local storage failed to apply a server change.
    RecoverNetwork,
}

/// Delivers [`RemoteStoreEvent`]s onto the queue that owns the remote store.
pub trait RemoteEventSink: Send + Sync + 'static {
    fn deliver(&self, event: RemoteStoreEvent);

    fn deliver_after(&self, timer_id: TimerId, delay: Duration, event: RemoteStoreEvent) -> DelayedOperation;
}

/// Callbacks from the remote store into the layer that owns the local state.
pub trait RemoteSyncer {
    fn apply_remote_event(&mut self, remote: &mut RemoteStore, event: RemoteEvent) -> SyncResult<()>;

    /// The server stopped listening to `target_id` and will not resume it.
    fn reject_listen(&mut self, remote: &mut RemoteStore, target_id: TargetId, error: SyncError) -> SyncResult<()>;

    fn apply_successful_write(&mut self, remote: &mut RemoteStore, result: MutationBatchResult) -> SyncResult<()>;

    fn reject_failed_write(&mut self, remote: &mut RemoteStore, batch_id: BatchId, error: SyncError) -> SyncResult<()>;

    fn apply_online_state_change(&mut self, state: OnlineState);

    fn next_mutation_batch(&self, after_batch_id: BatchId) -> Option<MutationBatch>;

    fn last_remote_snapshot_version(&self) -> SnapshotVersion;

    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

struct SyncerMetadata<'a>(&'a dyn RemoteSyncer);

impl TargetMetadataProvider for SyncerMetadata<'_> {
    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        self.0.remote_keys_for_target(target_id)
    }

    fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.0.target_data_for_target(target_id)
    }
}

/// Stream tuning shared by the watch and write streams.
#[derive(Clone, Debug)]
pub struct RemoteStoreConfig {
    pub initial_backoff_delay: Duration,
    pub backoff_factor: f64,
    pub max_backoff_delay: Duration,
    pub idle_timeout: Duration,
    pub online_state_timeout: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    CredentialChange,
    StorageFailed,
    Shutdown,
}

/// Owns the watch and write streams.
///
/// Tracks the targets being listened to and the batches in flight, replays both
/// whenever a stream reconnects, and folds watch messages into remote events for
/// the [`RemoteSyncer`].
pub struct RemoteStore {
    watch_stream: WatchStream,
    write_stream: WriteStream,
    /// Targets that should be listened to, keyed by id.
    listen_targets: BTreeMap<TargetId, TargetData>,
    /// Present only while the watch stream is started.
    watch_change_aggregator: Option<WatchChangeAggregator>,
    /// Batches sent (or about to be sent) on the write stream, oldest first.
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
    online_state_tracker: OnlineStateTracker,
    sink: Arc<dyn RemoteEventSink>,
    recovery_backoff: ExponentialBackoff,
    recovery_timer: Option<DelayedOperation>,
}

impl RemoteStore {
    pub fn new(connector: StreamConnector, serializer: JsonSerializer, config: &RemoteStoreConfig) -> Self {
        let backoff = || {
            ExponentialBackoff::new(
                config.initial_backoff_delay,
                config.backoff_factor,
                config.max_backoff_delay,
            )
        };
        let sink = Arc::clone(&connector.sink);
        let online_state_tracker = OnlineStateTracker::new(Arc::clone(&sink), config.online_state_timeout);
        let watch_stream = WatchStream::new(
            PersistentStream::new(StreamKind::Watch, connector.clone(), backoff(), config.idle_timeout),
            serializer.clone(),
        );
        let write_stream = WriteStream::new(
            PersistentStream::new(StreamKind::Write, connector, backoff(), config.idle_timeout),
            serializer,
        );
        Self {
            watch_stream,
            write_stream,
            listen_targets: BTreeMap::new(),
            watch_change_aggregator: None,
            write_pipeline: VecDeque::new(),
            offline_causes: BTreeSet::new(),
            online_state_tracker,
            sink,
            recovery_backoff: backoff(),
            recovery_timer: None,
        }
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state_tracker.state()
    }

    pub fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    pub fn is_listening(&self, target_id: TargetId) -> bool {
        self.listen_targets.contains_key(&target_id)
    }

    pub fn write_pipeline_len(&self) -> usize {
        self.write_pipeline.len()
    }

    pub fn start(&mut self, syncer: &mut dyn RemoteSyncer) {
        self.enable_network_internal(syncer);
    }

    pub fn enable_network(&mut self, syncer: &mut dyn RemoteSyncer) {
        self.offline_causes.remove(&OfflineCause::UserDisabled);
        self.enable_network_internal(syncer);
    }

    /// Stops both streams and reports the client offline until re-enabled.
    pub fn disable_network(&mut self, syncer: &mut dyn RemoteSyncer) {
        self.offline_causes.insert(OfflineCause::UserDisabled);
        self.disable_network_internal();
        let changed = self.online_state_tracker.set(OnlineState::Offline);
        broadcast(syncer, changed);
    }

    pub fn shutdown(&mut self, syncer: &mut dyn RemoteSyncer) {
        debug!("Shutting down remote store");
        self.offline_causes.insert(OfflineCause::Shutdown);
        if let Some(timer) = self.recovery_timer.take() {
            timer.cancel();
        }
        self.disable_network_internal();
        self.online_state_tracker.shutdown();
        let changed = self.online_state_tracker.set(OnlineState::Unknown);
        broadcast(syncer, changed);
    }

    /// Tears both streams down ahead of a user change so they reconnect with the
    /// new user's credentials and mutation queue.
    pub fn begin_credential_change(&mut self, syncer: &mut dyn RemoteSyncer) {
        let used_network = self.can_use_network();
        self.offline_causes.insert(OfflineCause::CredentialChange);
        self.disable_network_internal();
        if used_network {
            let changed = self.online_state_tracker.set(OnlineState::Unknown);
            broadcast(syncer, changed);
        }
    }

    pub fn end_credential_change(&mut self, syncer: &mut dyn RemoteSyncer) {
        self.offline_causes.remove(&OfflineCause::CredentialChange);
        self.enable_network_internal(syncer);
    }

    /// Starts listening to `target_data`, opening the watch stream if needed.
    pub fn listen(&mut self, syncer: &mut dyn RemoteSyncer, target_data: TargetData) {
        let target_id = target_data.target_id;
        if self.listen_targets.contains_key(&target_id) {
            return;
        }
        self.listen_targets.insert(target_id, target_data.clone());

        if self.should_start_watch_stream() {
            self.start_watch_stream(syncer);
        } else if self.watch_stream.is_open() {
            self.send_watch_request(syncer, target_data);
        }
    }

    pub fn unlisten(&mut self, syncer: &mut dyn RemoteSyncer, target_id: TargetId) {
        if self.listen_targets.remove(&target_id).is_none() {
            debug!("Ignoring unlisten of unknown target {target_id}");
            return;
        }
        if self.watch_stream.is_open() {
            self.send_unwatch_request(target_id);
        }

        if self.listen_targets.is_empty() {
            if self.watch_stream.is_open() {
                self.watch_stream.mark_idle();
            } else if self.can_use_network() {
                let changed = self.online_state_tracker.set(OnlineState::Unknown);
                broadcast(syncer, changed);
            }
        }
    }

    /// Pulls queued batches into the write pipeline until it is full.
    pub fn fill_write_pipeline(&mut self, syncer: &mut dyn RemoteSyncer) {
        let mut last_batch_id = self
            .write_pipeline
            .back()
            .map(|batch| batch.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN);

        while self.can_add_to_write_pipeline() {
            match syncer.next_mutation_batch(last_batch_id) {
                Some(batch) => {
                    last_batch_id = batch.batch_id;
                    self.add_to_write_pipeline(batch);
                }
                None => {
                    if self.write_pipeline.is_empty() {
                        self.write_stream.mark_idle();
                    }
                    break;
                }
            }
        }

        if self.should_start_write_stream() {
            self.write_stream.start();
        }
    }

    pub fn handle_event(&mut self, syncer: &mut dyn RemoteSyncer, event: RemoteStoreEvent) {
        match event {
            RemoteStoreEvent::Stream {
                kind: StreamKind::Watch,
                generation,
                event,
            } => match self.watch_stream.handle_event(generation, event) {
                StreamTransition::Ignored => {}
                StreamTransition::Opened => self.on_watch_stream_open(syncer),
                StreamTransition::Message(payload) => match self.watch_stream.decode(&payload) {
                    Ok(Some(change)) => self.on_watch_stream_change(syncer, change),
                    Ok(None) => {}
                    Err(err) => {
                        warn!("Watch stream failed: {err}");
                        self.watch_stream.fail(err.clone());
                        self.on_watch_stream_close(syncer, Some(err));
                    }
                },
                StreamTransition::Closed(error) => self.on_watch_stream_close(syncer, error),
            },
            RemoteStoreEvent::Stream {
                kind: StreamKind::Write,
                generation,
                event,
            } => match self.write_stream.handle_event(generation, event) {
                StreamTransition::Ignored => {}
                StreamTransition::Opened => self.write_stream.write_handshake(),
                StreamTransition::Message(payload) => match self.write_stream.handle_message(&payload) {
                    Ok(WriteStreamMessage::HandshakeComplete) => self.on_write_handshake_complete(),
                    Ok(WriteStreamMessage::Response(response)) => self.on_mutation_result(syncer, response),
                    Err(err) => {
                        self.write_stream.fail(err.clone());
                        self.on_write_stream_close(syncer, Some(err));
                    }
                },
                StreamTransition::Closed(error) => self.on_write_stream_close(syncer, error),
            },
            RemoteStoreEvent::OnlineStateTimeout => {
                let changed = self.online_state_tracker.handle_timeout();
                broadcast(syncer, changed);
            }
            RemoteStoreEvent::RecoverNetwork => self.recover_network(syncer),
        }
    }

    fn enable_network_internal(&mut self, syncer: &mut dyn RemoteSyncer) {
        if !self.can_use_network() {
            return;
        }
        if self.should_start_watch_stream() {
            self.start_watch_stream(syncer);
        } else {
            let changed = self.online_state_tracker.set(OnlineState::Unknown);
            broadcast(syncer, changed);
        }
        self.fill_write_pipeline(syncer);
    }

    fn disable_network_internal(&mut self) {
        self.write_stream.stop();
        self.watch_stream.stop();
        self.clean_up_watch_stream_state();
        if !self.write_pipeline.is_empty() {
            debug!("Stopping write stream with {} pending writes", self.write_pipeline.len());
            self.write_pipeline.clear();
        }
    }

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network() && !self.watch_stream.is_started() && !self.listen_targets.is_empty()
    }

    fn start_watch_stream(&mut self, syncer: &mut dyn RemoteSyncer) {
        self.watch_change_aggregator = Some(WatchChangeAggregator::new());
        self.watch_stream.start();
        let changed = self.online_state_tracker.handle_watch_stream_start();
        broadcast(syncer, changed);
    }

    fn clean_up_watch_stream_state(&mut self) {
        self.watch_change_aggregator = None;
    }

    fn send_watch_request(&mut self, syncer: &dyn RemoteSyncer, target_data: TargetData) {
        let target_id = target_data.target_id;
        if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        let request = if !target_data.resume_token.is_empty() || target_data.snapshot_version > SnapshotVersion::min() {
            let expected_count = syncer.remote_keys_for_target(target_id).len() as i32;
            target_data.with_expected_count(expected_count)
        } else {
            target_data
        };
        self.watch_stream.watch(&request);
    }

    fn send_unwatch_request(&mut self, target_id: TargetId) {
        if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.watch_stream.unwatch(target_id);
    }

    fn on_watch_stream_open(&mut self, syncer: &mut dyn RemoteSyncer) {
        let targets: Vec<TargetData> = self.listen_targets.values().cloned().collect();
        for target_data in targets {
            self.send_watch_request(syncer, target_data);
        }
    }

    fn on_watch_stream_close(&mut self, syncer: &mut dyn RemoteSyncer, error: Option<SyncError>) {
        self.clean_up_watch_stream_state();
        if self.should_start_watch_stream() {
            let changed = self.online_state_tracker.handle_watch_stream_failure(error.as_ref());
            broadcast(syncer, changed);
            self.start_watch_stream(syncer);
        } else {
            let changed = self.online_state_tracker.set(OnlineState::Unknown);
            broadcast(syncer, changed);
        }
    }

    fn on_watch_stream_change(&mut self, syncer: &mut dyn RemoteSyncer, change: WatchChange) {
        let changed = self.online_state_tracker.set(OnlineState::Online);
        broadcast(syncer, changed);

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == TargetChangeState::Remove {
                if let Some(cause) = &target_change.cause {
                    self.handle_target_error(syncer, &target_change.target_ids, cause);
                    return;
                }
            }
        }

        let snapshot_version = change.snapshot_version();
        let Some(aggregator) = self.watch_change_aggregator.as_mut() else {
            debug!("Dropping watch change without an active aggregator");
            return;
        };
        let metadata = SyncerMetadata(&*syncer);
        match change {
            WatchChange::DocumentChange(document_change) => {
                aggregator.handle_document_change(&metadata, document_change)
            }
            WatchChange::ExistenceFilter(filter) => aggregator.handle_existence_filter(&metadata, &filter),
            WatchChange::TargetChange(target_change) => {
                aggregator.handle_target_change(&metadata, &target_change)
            }
        }

        if !snapshot_version.is_min() && snapshot_version >= syncer.last_remote_snapshot_version() {
            self.raise_watch_snapshot(syncer, snapshot_version);
        }
    }

    fn raise_watch_snapshot(&mut self, syncer: &mut dyn RemoteSyncer, snapshot_version: SnapshotVersion) {
        let Some(aggregator) = self.watch_change_aggregator.as_mut() else {
            return;
        };
        let event = aggregator.create_remote_event(&SyncerMetadata(&*syncer), snapshot_version);

        // Resume tokens advance only once the event is applied.
        let resume_tokens: Vec<(TargetId, Vec<u8>)> = event
            .target_changes
            .iter()
            .filter(|(target_id, change)| {
                !change.resume_token.is_empty() && !event.target_mismatches.contains_key(target_id)
            })
            .map(|(target_id, change)| (*target_id, change.resume_token.clone()))
            .collect();

        for (target_id, purpose) in &event.target_mismatches {
            let Some(target_data) = self.listen_targets.get(target_id).cloned() else {
                continue;
            };
            // Re-listen from scratch, flagging only this request with the mismatch purpose.
            self.listen_targets.insert(
                *target_id,
                target_data.with_resume_token(Vec::new(), target_data.snapshot_version),
            );
            self.send_unwatch_request(*target_id);
            let request = TargetData::new(
                target_data.target.clone(),
                *target_id,
                *purpose,
                target_data.sequence_number,
            );
            self.send_watch_request(syncer, request);
        }

        if let Err(err) = syncer.apply_remote_event(self, event) {
            warn!("Failed to apply remote event at {snapshot_version}: {err}");
            self.disable_network_until_recovery(syncer, &err);
            return;
        }
        self.recovery_backoff.reset();
        for (target_id, resume_token) in resume_tokens {
            if let Some(target_data) = self.listen_targets.get_mut(&target_id) {
                *target_data = target_data.with_resume_token(resume_token, snapshot_version);
            }
        }
    }

    /// Tears both streams down after local storage failed to take a server change
    /// and schedules them to come back after a backoff delay. On return the
    /// watch stream resumes from the last applied tokens and every queued batch
    /// is sent again.
    fn disable_network_until_recovery(&mut self, syncer: &mut dyn RemoteSyncer, error: &SyncError) {
        warn!("Disabling the network until local storage recovers: {error}");
        self.offline_causes.insert(OfflineCause::StorageFailed);
        self.disable_network_internal();
        let changed = self.online_state_tracker.set(OnlineState::Offline);
        broadcast(syncer, changed);

        if let Some(timer) = self.recovery_timer.take() {
            timer.cancel();
        }
        let delay = self.recovery_backoff.next_delay();
        self.recovery_timer = Some(
            self.sink
                .deliver_after(TimerId::NetworkRecovery, delay, RemoteStoreEvent::RecoverNetwork),
        );
    }

    fn recover_network(&mut self, syncer: &mut dyn RemoteSyncer) {
        self.recovery_timer = None;
        if self.offline_causes.remove(&OfflineCause::StorageFailed) {
            debug!("Re-enabling the network after a local storage failure");
            self.enable_network_internal(syncer);
        }
    }

    fn handle_target_error(&mut self, syncer: &mut dyn RemoteSyncer, target_ids: &[TargetId], cause: &SyncError) {
        for target_id in target_ids {
            if self.listen_targets.remove(target_id).is_none() {
                continue;
            }
            if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
                aggregator.remove_target(*target_id);
            }
            if let Err(err) = syncer.reject_listen(self, *target_id, cause.clone()) {
                warn!("Failed to reject listen for target {target_id}: {err}");
                self.disable_network_until_recovery(syncer, &err);
                return;
            }
        }
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        self.can_use_network() && self.write_pipeline.len() < MAX_PENDING_WRITES
    }

    fn add_to_write_pipeline(&mut self, batch: MutationBatch) {
        if self.write_stream.is_open() && self.write_stream.handshake_complete() {
            self.write_stream.write_mutations(&batch.mutations);
        }
        self.write_pipeline.push_back(batch);
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network() && !self.write_stream.is_started() && !self.write_pipeline.is_empty()
    }

    fn on_write_handshake_complete(&mut self) {
        let batches: Vec<Vec<_>> = self
            .write_pipeline
            .iter()
            .map(|batch| batch.mutations.clone())
            .collect();
        for mutations in batches {
            self.write_stream.write_mutations(&mutations);
        }
    }

    fn on_mutation_result(&mut self, syncer: &mut dyn RemoteSyncer, response: WriteResponse) {
        let Some(batch) = self.write_pipeline.pop_front() else {
            warn!("Received a write response with an empty write pipeline");
            return;
        };
        let batch_id = batch.batch_id;
        let result = MutationBatchResult::from(
            batch,
            response.commit_version,
            response.write_results,
            response.stream_token,
        );
        let applied = match result {
            Ok(result) => syncer.apply_successful_write(self, result),
            Err(err) => {
                warn!("Rejecting batch {batch_id} after a malformed write response: {err}");
                syncer.reject_failed_write(self, batch_id, err)
            }
        };
        if let Err(err) = applied {
            warn!("Failed to settle batch {batch_id}: {err}");
            self.disable_network_until_recovery(syncer, &err);
            return;
        }
        self.fill_write_pipeline(syncer);
    }

    fn on_write_stream_close(&mut self, syncer: &mut dyn RemoteSyncer, error: Option<SyncError>) {
        if let Some(error) = error {
            if self.write_stream.handshake_complete() {
                self.handle_write_error(syncer, error);
            } else {
                self.handle_handshake_error(error);
            }
        }

        if self.should_start_write_stream() {
            self.write_stream.start();
        }
    }

    fn handle_handshake_error(&mut self, error: SyncError) {
        if is_permanent_error(error.code) {
            debug!("Write stream handshake failed ({error}); resetting the stream token");
            self.write_stream.clear_stream_token();
        }
    }

    /// A permanent failure rejects the head batch; anything else is retried
    /// once the stream reconnects.
    fn handle_write_error(&mut self, syncer: &mut dyn RemoteSyncer, error: SyncError) {
        if !is_permanent_write_error(error.code) {
            debug!("Write failed transiently ({error}); retrying after reconnect");
            return;
        }
        let Some(batch) = self.write_pipeline.pop_front() else {
            return;
        };
        self.write_stream.inhibit_backoff();
        if let Err(err) = syncer.reject_failed_write(self, batch.batch_id, error) {
            warn!("Failed to reject batch {}: {err}", batch.batch_id);
            self.disable_network_until_recovery(syncer, &err);
            return;
        }
        self.fill_write_pipeline(syncer);
    }
}

fn broadcast(syncer: &mut dyn RemoteSyncer, changed: Option<OnlineState>) {
    if let Some(state) = changed {
        syncer.apply_online_state_change(state);
    }
}
