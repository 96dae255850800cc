//! Server-streaming calls.
//!
//! A background task reads frames off the response and queues one task per
//! event on the stream's [`TaskQueue`]. Listeners only ever run on the event
//! loop thread, in the order events were received, and `end` is always the
//! last event of a stream.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt;
use grpcweb_core::{Code, Status};
use prost_reflect::MethodDescriptor;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, ClientError};
use crate::event_loop::TaskQueue;
use crate::host::{Metric, Tags, Telemetry};
use crate::request::Opened;

/// Kinds of events a stream emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Data,
    Error,
    End,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Data => "data",
            EventKind::Error => "error",
            EventKind::End => "end",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for an event name other than `data`, `error` or `end`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported event type: {0}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data" => Ok(EventKind::Data),
            "error" => Ok(EventKind::Error),
            "end" => Ok(EventKind::End),
            other => Err(UnknownEventKind(other.to_string())),
        }
    }
}

/// One event delivered to stream listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A decoded response message.
    Data(Value),
    /// The status the server ended the stream with.
    Error(Status),
    /// The stream is over.
    End,
}

impl StreamEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StreamEvent::Data(_) => EventKind::Data,
            StreamEvent::Error(_) => EventKind::Error,
            StreamEvent::End => EventKind::End,
        }
    }
}

/// Lifecycle of a stream as seen from the loop thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    /// An `error` event has been dispatched.
    Errored,
    /// The `end` event has been dispatched.
    Ended,
}

type Listener = Box<dyn FnMut(&StreamEvent) -> Result<(), BoxError> + Send + 'static>;

#[derive(Default)]
struct Listeners {
    data: Vec<Listener>,
    error: Vec<Listener>,
    end: Vec<Listener>,
}

impl Listeners {
    fn slot(&mut self, kind: EventKind) -> &mut Vec<Listener> {
        match kind {
            EventKind::Data => &mut self.data,
            EventKind::Error => &mut self.error,
            EventKind::End => &mut self.end,
        }
    }
}

struct Shared {
    method: String,
    listeners: Mutex<Listeners>,
    state: Mutex<StreamState>,
    close: CancellationToken,
}

impl Shared {
    /// Run the listeners for `event`. Loop thread only.
    fn dispatch(&self, event: StreamEvent) -> Result<(), BoxError> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match (event.kind(), *state) {
                (_, StreamState::Ended) => return Ok(()),
                (EventKind::Data, StreamState::Errored) => return Ok(()),
                (EventKind::Error, _) => *state = StreamState::Errored,
                (EventKind::End, _) => *state = StreamState::Ended,
                (EventKind::Data, StreamState::Open) => {}
            }
        }

        let kind = event.kind();
        // Listeners run unlocked so they can register more listeners.
        let mut running = std::mem::take(
            self.listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .slot(kind),
        );

        let mut result = Ok(());
        for listener in running.iter_mut() {
            if let Err(err) = listener(&event) {
                result = Err(err);
                break;
            }
        }

        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = listeners.slot(kind);
        running.append(slot);
        *slot = running;
        result
    }
}

/// Handle to an open server-streaming call.
///
/// Cheap to clone; all clones refer to the same stream.
#[derive(Clone)]
pub struct StreamHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("method", &self.shared.method)
            .field("state", &self.state())
            .finish()
    }
}

impl StreamHandle {
    fn new(method: String) -> Self {
        Self {
            shared: Arc::new(Shared {
                method,
                listeners: Mutex::new(Listeners::default()),
                state: Mutex::new(StreamState::Open),
                close: CancellationToken::new(),
            }),
        }
    }

    /// Register a listener for `data`, `error` or `end`.
    ///
    /// Listeners for one kind run in registration order; one returning an
    /// error stops the rest for that event only. Unknown kinds are logged
    /// and ignored.
    pub fn on<F>(&self, kind: &str, listener: F) -> &Self
    where
        F: FnMut(&StreamEvent) -> Result<(), BoxError> + Send + 'static,
    {
        match kind.parse::<EventKind>() {
            Ok(kind) => self.add_listener(kind, listener),
            Err(err) => tracing::warn!(method = %self.shared.method, "can't register event handler: {}", err),
        }
        self
    }

    /// Register a listener for a known event kind.
    pub fn add_listener<F>(&self, kind: EventKind, listener: F)
    where
        F: FnMut(&StreamEvent) -> Result<(), BoxError> + Send + 'static,
    {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .slot(kind)
            .push(Box::new(listener));
    }

    /// Stop receiving. Already queued events are still delivered, followed
    /// by `end`; no `error` event is produced.
    pub fn close(&self) {
        self.shared.close.cancel();
    }

    pub fn state(&self) -> StreamState {
        *self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dispatch path of the call.
    pub fn method(&self) -> &str {
        &self.shared.method
    }
}

/// Everything the receive loop needs.
pub(crate) struct Receiver {
    pub method: MethodDescriptor,
    pub path: String,
    pub queue: TaskQueue,
    pub telemetry: Telemetry,
    pub tags: Tags,
    pub deadline: Option<Instant>,
    /// The caller's context.
    pub done: CancellationToken,
}

/// Create the handle and the future that drives it.
pub(crate) fn start(
    opened: Opened,
    receiver: Receiver,
) -> (StreamHandle, impl std::future::Future<Output = ()> + Send + 'static) {
    let handle = StreamHandle::new(receiver.path.clone());
    let shared = handle.shared.clone();
    (handle, receive(opened, receiver, shared))
}

async fn receive(opened: Opened, receiver: Receiver, shared: Arc<Shared>) {
    let Receiver {
        method,
        path,
        queue,
        telemetry,
        tags,
        deadline,
        done,
    } = receiver;
    let output = method.output();

    let emit = |event: StreamEvent| {
        let shared = shared.clone();
        queue.queue(move || shared.dispatch(event));
    };

    match opened {
        Opened::Ended(status) => {
            if !status.is_ok() {
                emit(StreamEvent::Error(status));
            }
        }
        Opened::Frames(mut frames) => {
            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };
            tokio::pin!(expired);

            loop {
                tokio::select! {
                    biased;
                    _ = shared.close.cancelled() => break,
                    _ = done.cancelled() => break,
                    _ = &mut expired => {
                        emit(StreamEvent::Error(Status::new(
                            Code::DeadlineExceeded,
                            "stream deadline exceeded",
                        )));
                        break;
                    }
                    item = frames.next() => match item {
                        Some(Ok(frame)) => match frame.decode(&output) {
                            Ok(message) => {
                                telemetry.push(Metric::StreamMessagesReceived, 1.0, &tags);
                                emit(StreamEvent::Data(message));
                            }
                            Err(err) => {
                                tracing::error!(method = %path, error = %err, "failed to unmarshal message");
                            }
                        },
                        Some(Err(err @ ClientError::Status { .. })) => {
                            emit(StreamEvent::Error(err.to_status()));
                            break;
                        }
                        Some(Err(err)) => {
                            tracing::error!(method = %path, error = %err, "unexpected error from server");
                            break;
                        }
                        None => break,
                    },
                }
            }
        }
    }

    emit(StreamEvent::End);
    queue.close();
}
