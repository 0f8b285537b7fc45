use serde_json::Value as JsonValue;

use crate::error::{internal_error, SyncError, SyncResult};
use crate::local::target_data::TargetData;
use crate::model::TargetId;
use crate::remote::persistent_stream::{PersistentStream, StreamEvent, StreamTransition};
use crate::remote::rpc_error::map_error_frame;
use crate::remote::serializer::JsonSerializer;
use crate::remote::watch_change::{decode_watch_change, WatchChange};

/// Watch stream: adds and removes listen targets and decodes the changes the
/// server sends back.
pub struct WatchStream {
    stream: PersistentStream,
    serializer: JsonSerializer,
}

impl WatchStream {
    pub fn new(stream: PersistentStream, serializer: JsonSerializer) -> Self {
        Self { stream, serializer }
    }

    pub fn stream(&self) -> &PersistentStream {
        &self.stream
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_started()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    pub fn start(&mut self) {
        self.stream.start();
    }

    pub fn stop(&mut self) {
        self.stream.stop();
    }

    pub fn mark_idle(&mut self) {
        self.stream.mark_idle();
    }

    pub fn fail(&mut self, error: SyncError) {
        self.stream.fail(error);
    }

    pub fn handle_event(&mut self, generation: u64, event: StreamEvent) -> StreamTransition {
        self.stream.handle_event(generation, event)
    }

    pub fn watch(&mut self, target_data: &TargetData) {
        let request = self.serializer.encode_listen_request(target_data);
        self.stream.send(request.to_string().into_bytes());
    }

    pub fn unwatch(&mut self, target_id: TargetId) {
        let request = self.serializer.encode_unlisten_request(target_id);
        self.stream.send(request.to_string().into_bytes());
    }

    /// Decodes one server message. An error frame decodes to its status.
    pub fn decode(&self, payload: &[u8]) -> SyncResult<Option<WatchChange>> {
        let value: JsonValue = serde_json::from_slice(payload)
            .map_err(|err| internal_error(format!("Invalid watch response: {err}")))?;
        if value.get("error").is_some() {
            return Err(map_error_frame(&value.to_string()));
        }
        decode_watch_change(&self.serializer, &value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::error::SyncErrorCode;
    use crate::remote::credentials::EmptyCredentialsProvider;
    use crate::remote::datastore::{InMemoryTransport, StreamKind};
    use crate::remote::persistent_stream::StreamConnector;
    use crate::test_support::{test_backoff, RecordingSink};

    fn watch_stream() -> WatchStream {
        let (datastore, _server) = InMemoryTransport::pair();
        let connector = StreamConnector {
            datastore,
            auth: Arc::new(EmptyCredentialsProvider),
            app_check: Arc::new(EmptyCredentialsProvider),
            sink: Arc::new(RecordingSink::new()),
        };
        WatchStream::new(
            PersistentStream::new(StreamKind::Watch, connector, test_backoff(), Duration::from_secs(60)),
            JsonSerializer::new("projects/demo/databases/main"),
        )
    }

    #[test]
    fn error_frames_decode_to_their_status() {
        let stream = watch_stream();
        let payload = json!({ "error": { "code": 8, "message": "quota" } }).to_string();
        let err = stream.decode(payload.as_bytes()).unwrap_err();
        assert_eq!(err.code, SyncErrorCode::ResourceExhausted);
    }

    #[test]
    fn garbage_is_an_internal_error() {
        let stream = watch_stream();
        let err = stream.decode(b"not json").unwrap_err();
        assert_eq!(err.code, SyncErrorCode::Internal);
    }

    #[test]
    fn decodes_target_changes() {
        let stream = watch_stream();
        let payload = json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [2] } }).to_string();
        assert!(matches!(
            stream.decode(payload.as_bytes()).unwrap(),
            Some(WatchChange::TargetChange(_))
        ));
    }
}
