use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{CloseReason, ConnectionUpdate, TransportEvent};

/// Receiving end of a transport's event stream.
pub type TransportEventStream = mpsc::Receiver<TransportEvent>;

/// Errors returned by transport channel operations.
#[derive(Debug, Error)]
pub enum TransportChannelError {
    /// The consumer side of the event stream is gone.
    #[error("transport event stream is closed")]
    EventStreamClosed,
}

/// Producer side used by transport implementations to publish events.
#[derive(Clone, Debug)]
pub struct TransportEventSink {
    event_tx: mpsc::Sender<TransportEvent>,
}

impl TransportEventSink {
    /// Create a sink and the stream it feeds.
    pub fn new(buffer: usize) -> (Self, TransportEventStream) {
        let (event_tx, event_rx) = mpsc::channel(buffer.max(1));
        (Self { event_tx }, event_rx)
    }

    /// Publish one event, waiting for buffer space.
    pub async fn emit(&self, event: TransportEvent) -> Result<(), TransportChannelError> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| TransportChannelError::EventStreamClosed)
    }

    pub async fn emit_open(&self) -> Result<(), TransportChannelError> {
        self.emit(TransportEvent::ConnectionUpdate(ConnectionUpdate::open()))
            .await
    }

    pub async fn emit_close(&self, reason: CloseReason) -> Result<(), TransportChannelError> {
        self.emit(TransportEvent::ConnectionUpdate(ConnectionUpdate::closed(
            reason,
        )))
        .await
    }

    pub fn is_closed(&self) -> bool {
        self.event_tx.is_closed()
    }
}
