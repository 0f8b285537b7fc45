use log::debug;
use serde_json::Value as JsonValue;

use crate::error::{internal_error, SyncError, SyncResult};
use crate::model::Mutation;
use crate::remote::persistent_stream::{PersistentStream, StreamEvent, StreamTransition};
use crate::remote::rpc_error::map_error_frame;
use crate::remote::serializer::{JsonSerializer, WriteResponse};

/// Maximum number of batches in flight on the write stream.
pub const MAX_PENDING_WRITES: usize = 10;

#[derive(Debug, PartialEq)]
pub enum WriteStreamMessage {
    HandshakeComplete,
    Response(WriteResponse),
}

/// Write stream: a handshake establishes the stream token, after which every
/// request carries the latest token and one batch of mutations.
pub struct WriteStream {
    stream: PersistentStream,
    serializer: JsonSerializer,
    handshake_complete: bool,
    last_stream_token: Vec<u8>,
}

impl WriteStream {
    pub fn new(stream: PersistentStream, serializer: JsonSerializer) -> Self {
        Self {
            stream,
            serializer,
            handshake_complete: false,
            last_stream_token: Vec::new(),
        }
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_started()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    pub fn last_stream_token(&self) -> &[u8] {
        &self.last_stream_token
    }

    pub fn clear_stream_token(&mut self) {
        self.last_stream_token.clear();
    }

    pub fn start(&mut self) {
        self.handshake_complete = false;
        self.stream.start();
    }

    pub fn stop(&mut self) {
        self.stream.stop();
    }

    pub fn mark_idle(&mut self) {
        self.stream.mark_idle();
    }

    pub fn inhibit_backoff(&mut self) {
        self.stream.inhibit_backoff();
    }

    pub fn fail(&mut self, error: SyncError) {
        self.stream.fail(error);
    }

    pub fn handle_event(&mut self, generation: u64, event: StreamEvent) -> StreamTransition {
        let transition = self.stream.handle_event(generation, event);
        if transition == StreamTransition::Opened {
            self.handshake_complete = false;
        }
        transition
    }

    pub fn write_handshake(&mut self) {
        debug!("Sending write stream handshake");
        let request = self.serializer.encode_handshake();
        self.stream.send(request.to_string().into_bytes());
    }

    pub fn write_mutations(&mut self, mutations: &[Mutation]) {
        let request = self
            .serializer
            .encode_write_request(&self.last_stream_token, mutations);
        self.stream.send(request.to_string().into_bytes());
    }

    /// Decodes one response, recording its stream token. The first response on
    /// a connection completes the handshake.
    pub fn handle_message(&mut self, payload: &[u8]) -> SyncResult<WriteStreamMessage> {
        let value: JsonValue = serde_json::from_slice(payload)
            .map_err(|err| internal_error(format!("Invalid write response: {err}")))?;
        if value.get("error").is_some() {
            return Err(map_error_frame(&value.to_string()));
        }
        let response = self.serializer.decode_write_response(&value)?;
        self.last_stream_token = response.stream_token.clone();

        if !self.handshake_complete {
            self.handshake_complete = true;
            return Ok(WriteStreamMessage::HandshakeComplete);
        }
        Ok(WriteStreamMessage::Response(response))
    }
}
