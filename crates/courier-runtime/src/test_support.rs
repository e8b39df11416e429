use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use courier_core::{
    CloseReason, CourierError, Credential, MessagePayload, RetryMessageCache, TransportEvent,
    TransportEventSink,
};

use crate::transport::{
    ConnectRequest, SessionHandle, Transport, TransportConnection, TransportHandle,
};

/// Records every command issued through the handles it hands out.
#[derive(Default)]
pub(crate) struct Recorder {
    fail_sends_to: Option<String>,
    next_id: AtomicUsize,
    logouts: AtomicUsize,
    sent: Mutex<Vec<(String, MessagePayload)>>,
    rejected: Mutex<Vec<(String, String)>>,
}

impl Recorder {
    pub(crate) fn failing_for(target: &str) -> Self {
        Self {
            fail_sends_to: Some(target.to_owned()),
            ..Self::default()
        }
    }

    pub(crate) fn handle(self: &Arc<Self>) -> Arc<dyn TransportHandle> {
        Arc::new(RecordingHandle {
            recorder: Arc::clone(self),
        })
    }

    pub(crate) fn session(self: &Arc<Self>) -> SessionHandle {
        SessionHandle::new(self.handle(), RetryMessageCache::default())
    }

    pub(crate) fn sent(&self) -> Vec<(String, MessagePayload)> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub(crate) fn rejected(&self) -> Vec<(String, String)> {
        self.rejected.lock().expect("rejected lock").clone()
    }

    pub(crate) fn logouts(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }
}

struct RecordingHandle {
    recorder: Arc<Recorder>,
}

#[async_trait]
impl TransportHandle for RecordingHandle {
    async fn send_message(
        &self,
        target: &str,
        payload: &MessagePayload,
    ) -> Result<String, CourierError> {
        if self.recorder.fail_sends_to.as_deref() == Some(target) {
            return Err(CourierError::network("send_failed", "mock send failure"));
        }
        self.recorder
            .sent
            .lock()
            .expect("sent lock")
            .push((target.to_owned(), payload.clone()));
        let id = self.recorder.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("MSG-{id}"))
    }

    async fn reject_call(&self, call_id: &str, from: &str) -> Result<(), CourierError> {
        self.recorder
            .rejected
            .lock()
            .expect("rejected lock")
            .push((call_id.to_owned(), from.to_owned()));
        Ok(())
    }

    async fn logout(&self) -> Result<(), CourierError> {
        self.recorder.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// What one `connect` call does.
pub(crate) enum Script {
    Fail(CourierError),
    /// Deliver the events; keep the stream open afterwards when `hold_open`.
    Events {
        events: Vec<TransportEvent>,
        hold_open: bool,
    },
}

impl Script {
    pub(crate) fn closes_with(status: u16) -> Self {
        Self::Events {
            events: vec![close_event(status)],
            hold_open: false,
        }
    }

    pub(crate) fn held(events: Vec<TransportEvent>) -> Self {
        Self::Events {
            events,
            hold_open: true,
        }
    }
}

pub(crate) fn open_event() -> TransportEvent {
    TransportEvent::ConnectionUpdate(courier_core::ConnectionUpdate::open())
}

pub(crate) fn close_event(status: u16) -> TransportEvent {
    TransportEvent::ConnectionUpdate(courier_core::ConnectionUpdate::closed(CloseReason::new(
        Some(status),
        "scripted close",
    )))
}

/// Transport that replays one script per `connect` call.
///
/// Once the scripts run out every further connect opens a silent session.
pub(crate) struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    pub(crate) recorder: Arc<Recorder>,
    requests: Mutex<Vec<(Option<Credential>, bool)>>,
    held: Mutex<Vec<Option<TransportEventSink>>>,
}

impl ScriptedTransport {
    pub(crate) fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            recorder: Arc::new(Recorder::default()),
            requests: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn connects(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }

    pub(crate) fn requests(&self) -> Vec<(Option<Credential>, bool)> {
        self.requests.lock().expect("requests lock").clone()
    }

    /// Sink of the `index`-th connection, if its stream was held open.
    pub(crate) fn sink(&self, index: usize) -> Option<TransportEventSink> {
        self.held
            .lock()
            .expect("held lock")
            .get(index)
            .cloned()
            .flatten()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, request: ConnectRequest) -> Result<TransportConnection, CourierError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push((request.credential, request.pairing));
        let script = self
            .scripts
            .lock()
            .expect("scripts lock")
            .pop_front()
            .unwrap_or(Script::Events {
                events: Vec::new(),
                hold_open: true,
            });

        match script {
            Script::Fail(err) => {
                self.held.lock().expect("held lock").push(None);
                Err(err)
            }
            Script::Events { events, hold_open } => {
                let (sink, stream) = TransportEventSink::new(events.len() + 8);
                for event in events {
                    sink.emit(event).await.expect("scripted event fits the buffer");
                }
                self.held
                    .lock()
                    .expect("held lock")
                    .push(hold_open.then_some(sink));
                Ok(TransportConnection {
                    handle: self.recorder.handle(),
                    events: stream,
                })
            }
        }
    }
}
