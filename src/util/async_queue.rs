use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use log::debug;

use crate::error::{cancelled, SyncResult};
use crate::platform::runtime::{sleep, spawn_detached};

type Operation<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// Identifies the purpose of a delayed operation, for logging and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerId {
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    OnlineStateTimeout,
    NetworkRecovery,
    GarbageCollection,
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`].
///
/// Dropping the handle does not cancel the operation.
#[derive(Clone)]
pub struct DelayedOperation {
    timer_id: TimerId,
    cancelled: Arc<AtomicBool>,
}

impl DelayedOperation {
    pub(crate) fn new(timer_id: TimerId) -> Self {
        Self {
            timer_id,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Prevents the operation from running if it has not started yet.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for DelayedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedOperation")
            .field("timer_id", &self.timer_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Serial executor owning a piece of state.
///
/// Operations run one at a time, in enqueue order, each to completion with
/// exclusive access to the state. Once shut down, queued and future operations
/// are skipped.
pub struct AsyncQueue<S> {
    sender: Sender<Operation<S>>,
    shut_down: Arc<AtomicBool>,
}

impl<S> Clone for AsyncQueue<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            shut_down: Arc::clone(&self.shut_down),
        }
    }
}

impl<S: Send + 'static> AsyncQueue<S> {
    /// Spawns the worker that owns `state`.
    pub fn start(state: S) -> Self {
        let (sender, receiver) = async_channel::unbounded();
        let shut_down = Arc::new(AtomicBool::new(false));
        spawn_detached(run_worker(state, receiver, Arc::clone(&shut_down)));
        Self { sender, shut_down }
    }

    pub fn enqueue_and_forget<F>(&self, operation: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        if self.is_shut_down() {
            debug!("Async queue is shut down; dropping operation");
            return;
        }
        if self.sender.try_send(Box::new(operation)).is_err() {
            debug!("Async queue worker is gone; dropping operation");
        }
    }

    /// Runs `operation` on the queue and waits for its result.
    pub async fn enqueue<T, F>(&self, operation: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> SyncResult<T> + Send + 'static,
    {
        let (reply, result) = async_channel::bounded(1);
        self.enqueue_and_forget(move |state| {
            let _ = reply.try_send(operation(state));
        });
        match result.recv().await {
            Ok(result) => result,
            Err(_) => Err(cancelled("The client has been shut down")),
        }
    }

    /// Schedules `operation` to run after `delay` unless cancelled first.
    pub fn enqueue_after_delay<F>(&self, timer_id: TimerId, delay: Duration, operation: F) -> DelayedOperation
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let handle = DelayedOperation::new(timer_id);
        let timer = handle.clone();
        let queue = self.clone();
        spawn_detached(async move {
            sleep(delay).await;
            if timer.is_cancelled() {
                return;
            }
            queue.enqueue_and_forget(move |state| {
                if timer.is_cancelled() {
                    debug!("Skipping cancelled {:?} timer", timer.timer_id());
                    return;
                }
                operation(state);
            });
        });
        handle
    }

    /// Stops running operations. Anything still queued is dropped.
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("Shutting down async queue");
        }
        self.sender.close();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

async fn run_worker<S>(mut state: S, receiver: Receiver<Operation<S>>, shut_down: Arc<AtomicBool>) {
    while let Ok(operation) = receiver.recv().await {
        if shut_down.load(Ordering::SeqCst) {
            continue;
        }
        operation(&mut state);
    }
    debug!("Async queue worker stopped");
}
