use std::fmt;
use std::sync::Arc;

use async_channel::{Receiver, Sender};
use async_lock::Mutex;
use async_trait::async_trait;
use log::debug;
use serde_json::Value as JsonValue;

use crate::error::{internal_error, unavailable, SyncError, SyncResult};
use crate::remote::credentials::StreamCredentials;

#[cfg(not(target_arch = "wasm32"))]
pub type StreamingFuture<'a, T> = futures::future::BoxFuture<'a, T>;
#[cfg(target_arch = "wasm32")]
pub type StreamingFuture<'a, T> = futures::future::LocalBoxFuture<'a, T>;

#[cfg(target_arch = "wasm32")]
pub(crate) fn box_stream_future<'a, F, T>(future: F) -> StreamingFuture<'a, T>
where
    F: std::future::Future<Output = T> + 'a,
{
    use futures::FutureExt;
    future.boxed_local()
}

#[cfg(not(target_arch = "wasm32"))]
pub(crate) fn box_stream_future<'a, F, T>(future: F) -> StreamingFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    use futures::FutureExt;
    future.boxed()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Watch,
    Write,
}

impl StreamKind {
    pub fn label(&self) -> &'static str {
        match self {
            StreamKind::Watch => "watch",
            StreamKind::Write => "write",
        }
    }
}

/// One open bidirectional stream.
///
/// `next` yields `None` once the peer closed the stream cleanly and an error
/// when it failed.
pub trait StreamHandle: Send + Sync + 'static {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, SyncResult<()>>;

    fn next(&self) -> StreamingFuture<'_, Option<SyncResult<Vec<u8>>>>;

    fn close(&self) -> StreamingFuture<'_, SyncResult<()>>;
}

/// Opens watch and write streams against the backend.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait Datastore: Send + Sync + 'static {
    async fn open_stream(
        &self,
        kind: StreamKind,
        credentials: StreamCredentials,
    ) -> SyncResult<Arc<dyn StreamHandle>>;
}

#[derive(Clone, Debug)]
pub enum FrameKind {
    Data(Vec<u8>),
    Close,
    Error(SyncError),
}

/// Paired in-process transport: the client side implements [`Datastore`], the
/// server side accepts the streams it opens.
pub struct InMemoryTransport;

impl InMemoryTransport {
    pub fn pair() -> (Arc<InMemoryDatastore>, InMemoryServer) {
        let (accept_tx, accept_rx) = async_channel::unbounded();
        let datastore = Arc::new(InMemoryDatastore {
            accept_tx,
            state: Mutex::new(TransportState {
                reachable: true,
                opened: 0,
            }),
        });
        let server = InMemoryServer {
            accept_rx,
            datastore: Arc::clone(&datastore),
        };
        (datastore, server)
    }
}

struct TransportState {
    reachable: bool,
    opened: usize,
}

pub struct InMemoryDatastore {
    accept_tx: Sender<ServerStream>,
    state: Mutex<TransportState>,
}

impl InMemoryDatastore {
    /// While unreachable, every open fails with `Unavailable`.
    pub async fn set_reachable(&self, reachable: bool) {
        self.state.lock().await.reachable = reachable;
    }

    /// Number of streams successfully opened so far.
    pub async fn opened_streams(&self) -> usize {
        self.state.lock().await.opened
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl Datastore for InMemoryDatastore {
    async fn open_stream(
        &self,
        kind: StreamKind,
        credentials: StreamCredentials,
    ) -> SyncResult<Arc<dyn StreamHandle>> {
        let mut state = self.state.lock().await;
        if !state.reachable {
            return Err(unavailable("Backend is unreachable"));
        }

        let (client_tx, server_rx) = async_channel::unbounded();
        let (server_tx, client_rx) = async_channel::unbounded();
        let server_stream = ServerStream {
            kind,
            credentials,
            outbound: server_tx,
            inbound: server_rx,
        };
        self.accept_tx
            .send(server_stream)
            .await
            .map_err(|_| unavailable("In-memory server has shut down"))?;
        state.opened += 1;
        debug!("Opened in-memory {} stream", kind.label());
        Ok(Arc::new(ChannelStream {
            outbound: client_tx,
            inbound: client_rx,
        }))
    }
}

struct ChannelStream {
    outbound: Sender<FrameKind>,
    inbound: Receiver<FrameKind>,
}

impl StreamHandle for ChannelStream {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, SyncResult<()>> {
        box_stream_future(async move {
            self.outbound
                .send(FrameKind::Data(payload))
                .await
                .map_err(|_| unavailable("Stream is closed"))
        })
    }

    fn next(&self) -> StreamingFuture<'_, Option<SyncResult<Vec<u8>>>> {
        box_stream_future(async move {
            match self.inbound.recv().await {
                Ok(FrameKind::Data(payload)) => Some(Ok(payload)),
                Ok(FrameKind::Error(err)) => Some(Err(err)),
                Ok(FrameKind::Close) | Err(_) => None,
            }
        })
    }

    fn close(&self) -> StreamingFuture<'_, SyncResult<()>> {
        box_stream_future(async move {
            let _ = self.outbound.send(FrameKind::Close).await;
            self.outbound.close();
            self.inbound.close();
            Ok(())
        })
    }
}

/// Server side of the in-memory transport.
pub struct InMemoryServer {
    accept_rx: Receiver<ServerStream>,
    datastore: Arc<InMemoryDatastore>,
}

impl InMemoryServer {
    /// Waits for the client to open its next stream.
    pub async fn accept(&self) -> Option<ServerStream> {
        self.accept_rx.recv().await.ok()
    }

    pub async fn set_reachable(&self, reachable: bool) {
        self.datastore.set_reachable(reachable).await;
    }
}

pub struct ServerStream {
    kind: StreamKind,
    credentials: StreamCredentials,
    outbound: Sender<FrameKind>,
    inbound: Receiver<FrameKind>,
}

impl fmt::Debug for ServerStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerStream")
            .field("kind", &self.kind)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl ServerStream {
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn credentials(&self) -> &StreamCredentials {
        &self.credentials
    }

    /// Next payload from the client; `None` once the client closed the stream.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        match self.inbound.recv().await {
            Ok(FrameKind::Data(payload)) => Some(payload),
            _ => None,
        }
    }

    pub async fn recv_json(&self) -> Option<SyncResult<JsonValue>> {
        let payload = self.recv().await?;
        Some(
            serde_json::from_slice(&payload)
                .map_err(|err| internal_error(format!("Client sent invalid JSON: {err}"))),
        )
    }

    pub async fn send(&self, payload: Vec<u8>) -> SyncResult<()> {
        self.outbound
            .send(FrameKind::Data(payload))
            .await
            .map_err(|_| unavailable("Client closed the stream"))
    }

    pub async fn send_json(&self, value: &JsonValue) -> SyncResult<()> {
        let payload = serde_json::to_vec(value)
            .map_err(|err| internal_error(format!("Failed to encode frame: {err}")))?;
        self.send(payload).await
    }

    /// Ends the stream with `error`.
    pub async fn fail(&self, error: SyncError) {
        let _ = self.outbound.send(FrameKind::Error(error)).await;
        self.outbound.close();
    }

    pub async fn close(&self) {
        let _ = self.outbound.send(FrameKind::Close).await;
        self.outbound.close();
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::SyncErrorCode;

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (datastore, server) = InMemoryTransport::pair();
        let credentials = StreamCredentials {
            auth_token: Some("token".into()),
            app_check_token: None,
        };
        let client = datastore
            .open_stream(StreamKind::Write, credentials.clone())
            .await
            .unwrap();
        let peer = server.accept().await.unwrap();
        assert_eq!(peer.kind(), StreamKind::Write);
        assert_eq!(peer.credentials(), &credentials);

        client.send(b"{\"hello\":1}".to_vec()).await.unwrap();
        assert_eq!(peer.recv_json().await.unwrap().unwrap(), json!({ "hello": 1 }));

        peer.send_json(&json!({ "world": 2 })).await.unwrap();
        let payload = client.next().await.unwrap().unwrap();
        assert_eq!(payload, b"{\"world\":2}".to_vec());

        client.close().await.unwrap();
        assert!(peer.recv().await.is_none());
    }

    #[tokio::test]
    async fn server_failure_reaches_the_client() {
        let (datastore, server) = InMemoryTransport::pair();
        let client = datastore
            .open_stream(StreamKind::Watch, StreamCredentials::default())
            .await
            .unwrap();
        let peer = server.accept().await.unwrap();
        peer.fail(unavailable("gone")).await;

        let err = client.next().await.unwrap().unwrap_err();
        assert_eq!(err.code, SyncErrorCode::Unavailable);
        assert!(client.next().await.is_none());
    }

    #[tokio::test]
    async fn unreachable_backend_refuses_streams() {
        let (datastore, server) = InMemoryTransport::pair();
        server.set_reachable(false).await;
        let err = datastore
            .open_stream(StreamKind::Watch, StreamCredentials::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.code, SyncErrorCode::Unavailable);
        assert_eq!(datastore.opened_streams().await, 0);
    }
}
