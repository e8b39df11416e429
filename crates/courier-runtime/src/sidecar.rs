//! Transport backed by an out-of-process protocol bridge.
//!
//! The bridge speaks newline-delimited JSON over TCP. Every connect opens a
//! fresh socket; losing that socket surfaces as a close without a status
//! code, which the supervisor treats as recoverable.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use courier_core::{
    CloseReason, CourierError, CourierErrorCategory, Credential, MessagePayload,
    RetryMessageCache, TransportEvent, TransportEventSink, TransportOptions,
};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex as AsyncMutex, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{ConnectRequest, Transport, TransportConnection, TransportHandle};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_EVENT_BUFFER: usize = 256;

/// Frames written by this process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    Connect {
        credential: Option<Credential>,
        pairing: bool,
        options: TransportOptions,
    },
    Send {
        request_id: u64,
        target: String,
        payload: MessagePayload,
    },
    RejectCall {
        request_id: u64,
        call_id: String,
        from: String,
    },
    Logout {
        request_id: u64,
    },
    /// Answer to a bridge `lookup_message`; empty payload on a miss.
    LookupResult {
        request_id: u64,
        payload: MessagePayload,
    },
}

/// Frames written by the bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeFrame {
    Event {
        event: TransportEvent,
    },
    LookupMessage {
        request_id: u64,
        message_id: String,
    },
    Reply {
        request_id: u64,
        #[serde(flatten)]
        reply: BridgeReply,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BridgeReply {
    pub ok: bool,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<BridgeReply>>>>;
type SharedWriter = Arc<AsyncMutex<OwnedWriteHalf>>;

#[derive(Debug, Clone)]
pub struct SidecarTransport {
    addr: String,
    request_timeout: Duration,
    event_buffer: usize,
}

impl SidecarTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Transport for SidecarTransport {
    async fn connect(&self, request: ConnectRequest) -> Result<TransportConnection, CourierError> {
        let stream = timeout(
            request.options.connect_timeout(),
            TcpStream::connect(&self.addr),
        )
        .await
        .map_err(|_| {
            CourierError::network(
                "connect_timeout",
                format!("timed out connecting to bridge at {}", self.addr),
            )
        })?
        .map_err(|err| {
            CourierError::network(
                "connect_failed",
                format!("failed connecting to bridge at {}: {err}", self.addr),
            )
        })?;
        let (read_half, write_half) = stream.into_split();
        let writer: SharedWriter = Arc::new(AsyncMutex::new(write_half));

        write_frame(
            &writer,
            &ClientFrame::Connect {
                credential: request.credential,
                pairing: request.pairing,
                options: request.options,
            },
        )
        .await?;
        info!(addr = %self.addr, "bridge connection established");

        let (sink, events) = TransportEventSink::new(self.event_buffer);
        let pending: PendingReplies = Arc::default();
        let closed = CancellationToken::new();
        let reader = tokio::spawn(read_bridge_frames(
            read_half,
            Arc::clone(&writer),
            Arc::clone(&pending),
            sink,
            request.retry_cache,
            closed.clone(),
        ));

        Ok(TransportConnection {
            handle: Arc::new(SidecarHandle {
                writer,
                pending,
                next_request_id: AtomicU64::new(1),
                request_timeout: self.request_timeout,
                closed,
                reader,
            }),
            events,
        })
    }
}

struct SidecarHandle {
    writer: SharedWriter,
    pending: PendingReplies,
    next_request_id: AtomicU64,
    request_timeout: Duration,
    /// Cancelled once the bridge reader has stopped.
    closed: CancellationToken,
    reader: JoinHandle<()>,
}

impl SidecarHandle {
    async fn request(
        &self,
        build: impl FnOnce(u64) -> ClientFrame,
    ) -> Result<BridgeReply, CourierError> {
        if self.closed.is_cancelled() {
            return Err(bridge_disconnected());
        }
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        lock_pending(&self.pending).insert(request_id, reply_tx);

        if let Err(err) = write_frame(&self.writer, &build(request_id)).await {
            lock_pending(&self.pending).remove(&request_id);
            return Err(err);
        }

        let reply = tokio::select! {
            biased;
            reply = timeout(self.request_timeout, reply_rx) => reply,
            () = self.closed.cancelled() => {
                lock_pending(&self.pending).remove(&request_id);
                return Err(bridge_disconnected());
            }
        };
        match reply {
            Err(_) => {
                lock_pending(&self.pending).remove(&request_id);
                Err(CourierError::network(
                    "request_timeout",
                    format!("bridge did not answer request {request_id}"),
                ))
            }
            Ok(Err(_)) => Err(bridge_disconnected()),
            Ok(Ok(reply)) if reply.ok => Ok(reply),
            Ok(Ok(reply)) => Err(CourierError::new(
                CourierErrorCategory::Transport,
                "bridge_rejected",
                reply.error.unwrap_or_else(|| "request rejected".to_owned()),
            )),
        }
    }
}

impl Drop for SidecarHandle {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl TransportHandle for SidecarHandle {
    async fn send_message(
        &self,
        target: &str,
        payload: &MessagePayload,
    ) -> Result<String, CourierError> {
        let reply = self
            .request(|request_id| ClientFrame::Send {
                request_id,
                target: target.to_owned(),
                payload: payload.clone(),
            })
            .await?;
        reply.message_id.ok_or_else(|| {
            CourierError::new(
                CourierErrorCategory::Transport,
                "missing_message_id",
                "bridge accepted the send without a message id",
            )
        })
    }

    async fn reject_call(&self, call_id: &str, from: &str) -> Result<(), CourierError> {
        self.request(|request_id| ClientFrame::RejectCall {
            request_id,
            call_id: call_id.to_owned(),
            from: from.to_owned(),
        })
        .await
        .map(|_| ())
    }

    async fn logout(&self) -> Result<(), CourierError> {
        self.request(|request_id| ClientFrame::Logout { request_id })
            .await
            .map(|_| ())
    }
}

fn bridge_disconnected() -> CourierError {
    CourierError::network(
        "bridge_disconnected",
        "bridge connection closed before replying",
    )
}

fn lock_pending(
    pending: &PendingReplies,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<BridgeReply>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn write_frame(writer: &SharedWriter, frame: &ClientFrame) -> Result<(), CourierError> {
    let mut line = serde_json::to_vec(frame).map_err(|err| {
        CourierError::new(
            CourierErrorCategory::Serialization,
            "frame_encode_failed",
            err.to_string(),
        )
    })?;
    line.push(b'\n');

    let mut writer = writer.lock().await;
    writer.write_all(&line).await.map_err(|err| {
        CourierError::network("bridge_write_failed", format!("failed writing frame: {err}"))
    })?;
    writer.flush().await.map_err(|err| {
        CourierError::network("bridge_write_failed", format!("failed flushing frame: {err}"))
    })
}

async fn read_bridge_frames(
    read_half: OwnedReadHalf,
    writer: SharedWriter,
    pending: PendingReplies,
    sink: TransportEventSink,
    retry_cache: RetryMessageCache,
    closed: CancellationToken,
) {
    // Also fires when the task is aborted or returns early.
    let _closed_on_exit = closed.clone().drop_guard();
    let mut lines = BufReader::new(read_half).lines();
    let close_reason = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break CloseReason::new(None, "bridge closed the connection"),
            Err(err) => break CloseReason::new(None, format!("bridge read failed: {err}")),
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<BridgeFrame>(&line) {
            Ok(BridgeFrame::Event { event }) => {
                if sink.emit(event).await.is_err() {
                    debug!("event consumer is gone; stopping bridge reader");
                    lock_pending(&pending).clear();
                    return;
                }
            }
            Ok(BridgeFrame::LookupMessage {
                request_id,
                message_id,
            }) => {
                let payload = retry_cache.get(&message_id);
                debug!(
                    message_id = %message_id,
                    hit = !payload.is_empty(),
                    "answering bridge retry lookup"
                );
                let answer = ClientFrame::LookupResult {
                    request_id,
                    payload,
                };
                if let Err(err) = write_frame(&writer, &answer).await {
                    warn!(error = %err, "failed answering bridge retry lookup");
                }
            }
            Ok(BridgeFrame::Reply { request_id, reply }) => {
                match lock_pending(&pending).remove(&request_id) {
                    Some(reply_tx) => {
                        let _ = reply_tx.send(reply);
                    }
                    None => debug!(request_id, "reply for unknown or expired request"),
                }
            }
            Err(err) => warn!(error = %err, "ignoring malformed bridge frame"),
        }
    };

    lock_pending(&pending).clear();
    closed.cancel();
    if sink.emit_close(close_reason).await.is_err() {
        debug!("event consumer already gone when bridge closed");
    }
}
