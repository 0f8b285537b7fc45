use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_channel::Sender;
use log::{debug, warn};

use crate::error::{SyncError, SyncErrorCode, SyncResult};
use crate::platform::runtime::spawn_detached;
use crate::remote::credentials::{CredentialsProvider, StreamCredentials};
use crate::remote::datastore::{Datastore, StreamHandle, StreamKind};
use crate::remote::remote_store::{RemoteEventSink, RemoteStoreEvent};
use crate::util::async_queue::{DelayedOperation, TimerId};
use crate::util::backoff::ExponentialBackoff;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Not started, or stopped gracefully (idle timeout).
    Initial,
    /// Fetching credentials and opening the underlying stream.
    Starting,
    Open,
    /// Open and at least one message received.
    Healthy,
    /// Closed by a failure; the next start backs off first.
    Error,
    /// Waiting out the backoff delay before reopening.
    Backoff,
    Stopped,
}

/// Completion of asynchronous stream work, delivered back through the queue.
pub enum StreamEvent {
    Opened(Arc<dyn StreamHandle>),
    OpenFailed(SyncError),
    Message(Vec<u8>),
    Closed(Option<SyncError>),
    BackoffElapsed,
    IdleTimeout,
}

impl fmt::Debug for StreamEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamEvent::Opened(_) => f.write_str("Opened"),
            StreamEvent::OpenFailed(err) => write!(f, "OpenFailed({err})"),
            StreamEvent::Message(payload) => write!(f, "Message({} bytes)", payload.len()),
            StreamEvent::Closed(err) => write!(f, "Closed({err:?})"),
            StreamEvent::BackoffElapsed => f.write_str("BackoffElapsed"),
            StreamEvent::IdleTimeout => f.write_str("IdleTimeout"),
        }
    }
}

/// What a handled event means for the owner of the stream.
#[derive(Debug, PartialEq)]
pub enum StreamTransition {
    /// Stale or irrelevant; nothing to do.
    Ignored,
    Opened,
    Message(Vec<u8>),
    /// The stream closed; `None` for a graceful close.
    Closed(Option<SyncError>),
}

#[derive(Clone)]
pub struct StreamConnector {
    pub datastore: Arc<dyn Datastore>,
    pub auth: Arc<dyn CredentialsProvider>,
    pub app_check: Arc<dyn CredentialsProvider>,
    pub sink: Arc<dyn RemoteEventSink>,
}

/// Reconnecting stream state machine.
///
/// All methods run on the async queue. I/O happens in spawned tasks whose results
/// come back as [`StreamEvent`]s tagged with the generation they were started
/// under; the generation advances on every open and close, so completions from
/// an earlier connection are dropped.
pub struct PersistentStream {
    kind: StreamKind,
    state: StreamState,
    generation: u64,
    connector: StreamConnector,
    backoff: ExponentialBackoff,
    idle_timeout: Duration,
    idle_timer: Option<DelayedOperation>,
    backoff_timer: Option<DelayedOperation>,
    outbound: Option<Sender<Vec<u8>>>,
    handle: Option<Arc<dyn StreamHandle>>,
}

impl PersistentStream {
    pub fn new(
        kind: StreamKind,
        connector: StreamConnector,
        backoff: ExponentialBackoff,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            kind,
            state: StreamState::Initial,
            generation: 0,
            connector,
            backoff,
            idle_timeout,
            idle_timer: None,
            backoff_timer: None,
            outbound: None,
            handle: None,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Starting, open, or waiting to reconnect.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state,
            StreamState::Starting | StreamState::Open | StreamState::Healthy | StreamState::Backoff
        )
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::Healthy)
    }

    /// Opens the stream, backing off first if the previous attempt failed.
    pub fn start(&mut self) {
        match self.state {
            StreamState::Error => self.perform_backoff(),
            StreamState::Initial | StreamState::Stopped => self.open(),
            _ => debug!("{} stream already started ({:?})", self.kind.label(), self.state),
        }
    }

    /// Closes the stream without treating it as a failure.
    pub fn stop(&mut self) {
        if self.is_started() {
            self.close(StreamState::Stopped, None);
        } else {
            self.state = StreamState::Stopped;
        }
    }

    /// Closes the stream with `error`, as if the connection had failed.
    pub fn fail(&mut self, error: SyncError) {
        self.close(StreamState::Error, Some(error));
    }

    /// After a failure caused by the request rather than the backend, the next
    /// start reconnects without waiting.
    pub fn inhibit_backoff(&mut self) {
        if self.state == StreamState::Error {
            self.state = StreamState::Initial;
            self.backoff.reset();
        }
    }

    /// Queues `payload` for sending and resets the idle timer.
    pub fn send(&mut self, payload: Vec<u8>) {
        self.cancel_idle_check();
        match &self.outbound {
            Some(outbound) => {
                if outbound.try_send(payload).is_err() {
                    debug!("{} stream writer is gone; dropping message", self.kind.label());
                }
            }
            None => warn!("Sending on {} stream that is not open", self.kind.label()),
        }
    }

    /// Arms the idle timer; the stream closes if nothing is sent before it fires.
    pub fn mark_idle(&mut self) {
        if self.is_open() && self.idle_timer.is_none() {
            let timer_id = match self.kind {
                StreamKind::Watch => TimerId::ListenStreamIdle,
                StreamKind::Write => TimerId::WriteStreamIdle,
            };
            self.idle_timer = Some(self.connector.sink.deliver_after(
                timer_id,
                self.idle_timeout,
                self.event(StreamEvent::IdleTimeout),
            ));
        }
    }

    pub fn handle_event(&mut self, generation: u64, event: StreamEvent) -> StreamTransition {
        if generation != self.generation {
            debug!(
                "Dropping stale {} stream event {event:?} (generation {generation}, current {})",
                self.kind.label(),
                self.generation
            );
            if let StreamEvent::Opened(handle) = event {
                close_handle(handle);
            }
            return StreamTransition::Ignored;
        }

        match event {
            StreamEvent::Opened(handle) => {
                if self.state != StreamState::Starting {
                    close_handle(handle);
                    return StreamTransition::Ignored;
                }
                self.attach(handle);
                StreamTransition::Opened
            }
            StreamEvent::OpenFailed(error) => {
                if self.state != StreamState::Starting {
                    return StreamTransition::Ignored;
                }
                warn!("Failed to open {} stream: {error}", self.kind.label());
                self.close(StreamState::Error, Some(error.clone()));
                StreamTransition::Closed(Some(error))
            }
            StreamEvent::Message(payload) => {
                if !self.is_open() {
                    return StreamTransition::Ignored;
                }
                self.state = StreamState::Healthy;
                self.backoff.reset();
                StreamTransition::Message(payload)
            }
            StreamEvent::Closed(error) => {
                if !self.is_started() {
                    return StreamTransition::Ignored;
                }
                debug!("{} stream closed: {error:?}", self.kind.label());
                self.close(StreamState::Error, error.clone());
                StreamTransition::Closed(error)
            }
            StreamEvent::BackoffElapsed => {
                if self.state == StreamState::Backoff {
                    self.backoff_timer = None;
                    self.state = StreamState::Initial;
                    self.open();
                }
                StreamTransition::Ignored
            }
            StreamEvent::IdleTimeout => {
                self.idle_timer = None;
                if !self.is_open() {
                    return StreamTransition::Ignored;
                }
                debug!("Closing idle {} stream", self.kind.label());
                self.close(StreamState::Initial, None);
                StreamTransition::Closed(None)
            }
        }
    }

    fn event(&self, event: StreamEvent) -> RemoteStoreEvent {
        RemoteStoreEvent::Stream {
            kind: self.kind,
            generation: self.generation,
            event,
        }
    }

    fn open(&mut self) {
        self.generation += 1;
        self.state = StreamState::Starting;
        debug!("Opening {} stream (generation {})", self.kind.label(), self.generation);

        let kind = self.kind;
        let generation = self.generation;
        let connector = self.connector.clone();
        spawn_detached(async move {
            let event = match connect(&connector, kind).await {
                Ok(handle) => StreamEvent::Opened(handle),
                Err(err) => StreamEvent::OpenFailed(err),
            };
            connector.sink.deliver(RemoteStoreEvent::Stream {
                kind,
                generation,
                event,
            });
        });
    }

    fn attach(&mut self, handle: Arc<dyn StreamHandle>) {
        self.state = StreamState::Open;
        debug!("{} stream open (generation {})", self.kind.label(), self.generation);

        let (outbound, outbound_rx) = async_channel::unbounded::<Vec<u8>>();
        let writer = Arc::clone(&handle);
        spawn_detached(async move {
            while let Ok(payload) = outbound_rx.recv().await {
                if let Err(err) = writer.send(payload).await {
                    debug!("Stream writer stopped: {err}");
                    break;
                }
            }
        });

        let reader = Arc::clone(&handle);
        let sink = Arc::clone(&self.connector.sink);
        let kind = self.kind;
        let generation = self.generation;
        spawn_detached(async move {
            loop {
                let event = match reader.next().await {
                    Some(Ok(payload)) => StreamEvent::Message(payload),
                    Some(Err(err)) => StreamEvent::Closed(Some(err)),
                    None => StreamEvent::Closed(None),
                };
                let closed = matches!(event, StreamEvent::Closed(_));
                sink.deliver(RemoteStoreEvent::Stream {
                    kind,
                    generation,
                    event,
                });
                if closed {
                    break;
                }
            }
        });

        self.outbound = Some(outbound);
        self.handle = Some(handle);
    }

    fn perform_backoff(&mut self) {
        self.state = StreamState::Backoff;
        let delay = self.backoff.next_delay();
        let timer_id = match self.kind {
            StreamKind::Watch => TimerId::ListenStreamConnectionBackoff,
            StreamKind::Write => TimerId::WriteStreamConnectionBackoff,
        };
        debug!("Reopening {} stream in {} ms", self.kind.label(), delay.as_millis());
        self.backoff_timer =
            Some(self.connector.sink.deliver_after(timer_id, delay, self.event(StreamEvent::BackoffElapsed)));
    }

    fn close(&mut self, final_state: StreamState, error: Option<SyncError>) {
        self.cancel_idle_check();
        if let Some(timer) = self.backoff_timer.take() {
            timer.cancel();
        }
        self.outbound = None;
        if let Some(handle) = self.handle.take() {
            close_handle(handle);
        }
        self.generation += 1;

        if final_state != StreamState::Error {
            self.backoff.reset();
        } else if let Some(error) = &error {
            match error.code {
                SyncErrorCode::ResourceExhausted => {
                    warn!("{} stream exhausted the backend's resources; backing off to the maximum", self.kind.label());
                    self.backoff.reset_to_max();
                }
                SyncErrorCode::Unauthenticated => {
                    debug!("{} stream rejected its credentials; invalidating tokens", self.kind.label());
                    self.connector.auth.invalidate_token();
                    self.connector.app_check.invalidate_token();
                }
                _ => {}
            }
        }
        self.state = final_state;
    }

    fn cancel_idle_check(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.cancel();
        }
    }
}

async fn connect(connector: &StreamConnector, kind: StreamKind) -> SyncResult<Arc<dyn StreamHandle>> {
    let credentials = StreamCredentials {
        auth_token: connector.auth.get_token().await?,
        app_check_token: connector.app_check.get_token().await?,
    };
    connector.datastore.open_stream(kind, credentials).await
}

fn close_handle(handle: Arc<dyn StreamHandle>) {
    spawn_detached(async move {
        if let Err(err) = handle.close().await {
            debug!("Failed to close stream: {err}");
        }
    });
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use crate::error::{resource_exhausted, unauthenticated};
    use crate::remote::credentials::{EmptyCredentialsProvider, StaticCredentialsProvider};
    use crate::remote::datastore::{InMemoryServer, InMemoryTransport};
    use crate::test_support::{test_backoff, RecordingSink};

    struct Harness {
        stream: PersistentStream,
        sink: Arc<RecordingSink>,
        server: InMemoryServer,
        auth: Arc<StaticCredentialsProvider>,
    }

    fn harness(idle_timeout: Duration) -> Harness {
        let (datastore, server) = InMemoryTransport::pair();
        let sink = Arc::new(RecordingSink::new());
        let auth = Arc::new(StaticCredentialsProvider::new("token-1"));
        let connector = StreamConnector {
            datastore,
            auth: auth.clone(),
            app_check: Arc::new(EmptyCredentialsProvider),
            sink: sink.clone(),
        };
        Harness {
            stream: PersistentStream::new(StreamKind::Watch, connector, test_backoff(), idle_timeout),
            sink,
            server,
            auth,
        }
    }

    impl Harness {
        /// Feeds the next delivered event back into the stream.
        async fn pump(&mut self) -> StreamTransition {
            let (generation, event) = self.sink.next_stream_event().await;
            self.stream.handle_event(generation, event)
        }
    }

    #[tokio::test]
    async fn opens_with_credentials_and_exchanges_messages() {
        let mut h = harness(Duration::from_secs(60));
        h.stream.start();
        assert_eq!(h.stream.state(), StreamState::Starting);
        assert_eq!(h.pump().await, StreamTransition::Opened);
        assert!(h.stream.is_open());

        let peer = h.server.accept().await.unwrap();
        assert_eq!(peer.credentials().auth_token.as_deref(), Some("token-1"));

        h.stream.send(b"ping".to_vec());
        assert_eq!(peer.recv().await.unwrap(), b"ping".to_vec());

        peer.send(b"pong".to_vec()).await.unwrap();
        assert_eq!(h.pump().await, StreamTransition::Message(b"pong".to_vec()));
        assert_eq!(h.stream.state(), StreamState::Healthy);
    }

    #[tokio::test]
    async fn events_from_an_older_generation_are_dropped() {
        let mut h = harness(Duration::from_secs(60));
        h.stream.start();
        h.pump().await;
        let stale = h.stream.generation();
        h.stream.stop();
        assert_eq!(h.stream.state(), StreamState::Stopped);
        assert_eq!(
            h.stream.handle_event(stale, StreamEvent::Message(b"late".to_vec())),
            StreamTransition::Ignored
        );
        assert_eq!(
            h.stream.handle_event(stale, StreamEvent::Closed(None)),
            StreamTransition::Ignored
        );
    }

    #[tokio::test]
    async fn failure_backs_off_before_reopening() {
        let mut h = harness(Duration::from_secs(60));
        h.server.set_reachable(false).await;
        h.stream.start();
        match h.pump().await {
            StreamTransition::Closed(Some(err)) => assert_eq!(err.code, SyncErrorCode::Unavailable),
            other => panic!("unexpected transition {other:?}"),
        }
        assert_eq!(h.stream.state(), StreamState::Error);

        h.server.set_reachable(true).await;
        h.stream.start();
        assert_eq!(h.stream.state(), StreamState::Backoff);
        assert_eq!(h.pump().await, StreamTransition::Ignored);
        assert_eq!(h.stream.state(), StreamState::Starting);
        assert_eq!(h.pump().await, StreamTransition::Opened);
    }

    #[tokio::test]
    async fn unauthenticated_close_invalidates_the_token() {
        let mut h = harness(Duration::from_secs(60));
        h.stream.start();
        h.pump().await;
        let peer = h.server.accept().await.unwrap();
        peer.fail(unauthenticated("expired")).await;
        match h.pump().await {
            StreamTransition::Closed(Some(err)) => assert_eq!(err.code, SyncErrorCode::Unauthenticated),
            other => panic!("unexpected transition {other:?}"),
        }
        assert_eq!(h.auth.invalidation_count(), 1);
    }

    #[tokio::test]
    async fn resource_exhausted_waits_the_maximum_delay() {
        let mut h = harness(Duration::from_secs(60));
        h.stream.start();
        h.pump().await;
        h.stream.fail(resource_exhausted("slow down"));
        h.stream.start();
        assert_eq!(h.stream.state(), StreamState::Backoff);
        assert!(h.sink.last_delay().unwrap() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn idle_stream_closes_gracefully() {
        let mut h = harness(Duration::from_millis(10));
        h.stream.start();
        h.pump().await;
        h.stream.mark_idle();
        assert_eq!(h.pump().await, StreamTransition::Closed(None));
        assert_eq!(h.stream.state(), StreamState::Initial);
    }
}
