use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_channel::{Receiver, Sender};

use crate::platform::runtime::{sleep, spawn_detached};
use crate::remote::credentials::EmptyCredentialsProvider;
use crate::remote::datastore::InMemoryTransport;
use crate::remote::persistent_stream::{StreamConnector, StreamEvent};
use crate::remote::remote_store::{RemoteEventSink, RemoteStore, RemoteStoreConfig, RemoteStoreEvent};
use crate::remote::serializer::JsonSerializer;
use crate::util::async_queue::{DelayedOperation, TimerId};

/// Sink that hands delivered events to the test instead of a queue.
pub struct RecordingSink {
    sender: Sender<RemoteStoreEvent>,
    receiver: Receiver<RemoteStoreEvent>,
    delays: Mutex<Vec<(TimerId, Duration)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded();
        Self {
            sender,
            receiver,
            delays: Mutex::new(Vec::new()),
        }
    }

    pub async fn next_event(&self) -> RemoteStoreEvent {
        tokio::time::timeout(Duration::from_secs(5), self.receiver.recv())
            .await
            .expect("timed out waiting for a remote store event")
            .expect("sink closed")
    }

    pub async fn next_stream_event(&self) -> (u64, StreamEvent) {
        loop {
            if let RemoteStoreEvent::Stream { generation, event, .. } = self.next_event().await {
                return (generation, event);
            }
        }
    }

    /// Delay of the most recently scheduled timer.
    pub fn last_delay(&self) -> Option<Duration> {
        self.delays.lock().unwrap().last().map(|(_, delay)| *delay)
    }
}

impl RemoteEventSink for RecordingSink {
    fn deliver(&self, event: RemoteStoreEvent) {
        let _ = self.sender.try_send(event);
    }

    fn deliver_after(&self, timer_id: TimerId, delay: Duration, event: RemoteStoreEvent) -> DelayedOperation {
        self.delays.lock().unwrap().push((timer_id, delay));
        let handle = DelayedOperation::new(timer_id);
        let timer = handle.clone();
        let sender = self.sender.clone();
        spawn_detached(async move {
            sleep(delay).await;
            if !timer.is_cancelled() {
                let _ = sender.try_send(event);
            }
        });
        handle
    }
}

/// Remote store whose streams never get past connecting: nothing pumps the sink
/// and the server half of the transport is dropped.
pub fn offline_remote_store() -> RemoteStore {
    let (datastore, _server) = InMemoryTransport::pair();
    let connector = StreamConnector {
        datastore,
        auth: Arc::new(EmptyCredentialsProvider),
        app_check: Arc::new(EmptyCredentialsProvider),
        sink: Arc::new(RecordingSink::new()),
    };
    let config = RemoteStoreConfig {
        initial_backoff_delay: Duration::from_millis(10),
        backoff_factor: 1.5,
        max_backoff_delay: Duration::from_millis(100),
        idle_timeout: Duration::from_secs(60),
        online_state_timeout: Duration::from_secs(60),
    };
    RemoteStore::new(connector, JsonSerializer::new("projects/demo/databases/main"), &config)
}
