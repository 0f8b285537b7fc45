use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::error::SyncError;
use crate::remote::remote_store::{RemoteEventSink, RemoteStoreEvent};
use crate::util::async_queue::{DelayedOperation, TimerId};

/// Failed watch connection attempts tolerated before reporting `Offline`.
const MAX_WATCH_STREAM_FAILURES: u32 = 1;

pub const DEFAULT_ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineState {
    /// No connection attempt has succeeded or conclusively failed yet.
    Unknown,
    Online,
    Offline,
}

/// Infers whether the client is online from the watch stream's behavior.
///
/// Each method returns the new state when it changed, for the caller to
/// broadcast.
pub struct OnlineStateTracker {
    state: OnlineState,
    watch_stream_failures: u32,
    online_state_timer: Option<DelayedOperation>,
    should_warn_client_is_offline: bool,
    timeout: Duration,
    sink: Arc<dyn RemoteEventSink>,
}

impl OnlineStateTracker {
    pub fn new(sink: Arc<dyn RemoteEventSink>, timeout: Duration) -> Self {
        Self {
            state: OnlineState::Unknown,
            watch_stream_failures: 0,
            online_state_timer: None,
            should_warn_client_is_offline: true,
            timeout,
            sink,
        }
    }

    pub fn state(&self) -> OnlineState {
        self.state
    }

    /// Called when the watch stream starts connecting. The first attempt arms the
    /// timer that reports `Offline` if no message arrives in time.
    pub fn handle_watch_stream_start(&mut self) -> Option<OnlineState> {
        if self.watch_stream_failures != 0 {
            return None;
        }
        let changed = self.set_and_broadcast(OnlineState::Unknown);
        if self.online_state_timer.is_none() {
            self.online_state_timer = Some(self.sink.deliver_after(
                TimerId::OnlineStateTimeout,
                self.timeout,
                RemoteStoreEvent::OnlineStateTimeout,
            ));
        }
        changed
    }

    pub fn handle_timeout(&mut self) -> Option<OnlineState> {
        if self.online_state_timer.take().is_none() || self.state != OnlineState::Unknown {
            return None;
        }
        self.log_client_offline_warning_if_necessary(&format!(
            "Backend didn't respond within {} seconds.",
            self.timeout.as_secs()
        ));
        self.set_and_broadcast(OnlineState::Offline)
    }

    pub fn handle_watch_stream_failure(&mut self, error: Option<&SyncError>) -> Option<OnlineState> {
        if self.state == OnlineState::Online {
            return self.set_and_broadcast(OnlineState::Unknown);
        }

        self.watch_stream_failures += 1;
        if self.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
            self.clear_online_state_timer();
            let reason = match error {
                Some(error) => format!("Connection failed {} times. Most recent error: {error}", self.watch_stream_failures),
                None => format!("Connection failed {} times.", self.watch_stream_failures),
            };
            self.log_client_offline_warning_if_necessary(&reason);
            return self.set_and_broadcast(OnlineState::Offline);
        }
        None
    }

    /// Explicitly sets the state, resetting the failure count.
    pub fn set(&mut self, state: OnlineState) -> Option<OnlineState> {
        self.clear_online_state_timer();
        self.watch_stream_failures = 0;
        if state == OnlineState::Online {
            self.should_warn_client_is_offline = false;
        }
        self.set_and_broadcast(state)
    }

    pub fn shutdown(&mut self) {
        self.clear_online_state_timer();
    }

    fn set_and_broadcast(&mut self, state: OnlineState) -> Option<OnlineState> {
        if state == self.state {
            return None;
        }
        debug!("Online state {:?} -> {state:?}", self.state);
        self.state = state;
        Some(state)
    }

    fn log_client_offline_warning_if_necessary(&mut self, details: &str) {
        if self.should_warn_client_is_offline {
            warn!("Could not reach the backend. {details} The client will operate in offline mode until the connection succeeds.");
            self.should_warn_client_is_offline = false;
        } else {
            debug!("{details}");
        }
    }

    fn clear_online_state_timer(&mut self) {
        if let Some(timer) = self.online_state_timer.take() {
            timer.cancel();
        }
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use crate::error::unavailable;
    use crate::test_support::RecordingSink;

    fn tracker() -> (OnlineStateTracker, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        (OnlineStateTracker::new(sink.clone(), Duration::from_millis(10)), sink)
    }

    #[test]
    fn single_failure_before_online_means_offline() {
        let (mut tracker, _sink) = tracker();
        tracker.handle_watch_stream_start();
        assert_eq!(
            tracker.handle_watch_stream_failure(Some(&unavailable("down"))),
            Some(OnlineState::Offline)
        );
    }

    #[test]
    fn failure_after_online_goes_back_to_unknown() {
        let (mut tracker, _sink) = tracker();
        tracker.handle_watch_stream_start();
        assert_eq!(tracker.set(OnlineState::Online), Some(OnlineState::Online));
        assert_eq!(tracker.handle_watch_stream_failure(None), Some(OnlineState::Unknown));
    }

    #[tokio::test]
    async fn timeout_marks_offline() {
        let (mut tracker, sink) = tracker();
        tracker.handle_watch_stream_start();
        assert!(matches!(sink.next_event().await, RemoteStoreEvent::OnlineStateTimeout));
        assert_eq!(tracker.handle_timeout(), Some(OnlineState::Offline));
    }

    #[test]
    fn message_before_timeout_cancels_it() {
        let (mut tracker, _sink) = tracker();
        tracker.handle_watch_stream_start();
        tracker.set(OnlineState::Online);
        assert_eq!(tracker.handle_timeout(), None);
        assert_eq!(tracker.state(), OnlineState::Online);
    }
}
