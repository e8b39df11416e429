//! Seams to the external protocol library.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use courier_core::{
    CourierError, Credential, MessagePayload, RetryMessageCache, TransportEventStream,
    TransportOptions,
};
use uuid::Uuid;

/// Everything a transport needs to open one connection.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Credential to authenticate with; `None` bootstraps a brand-new identity.
    pub credential: Option<Credential>,
    /// The transport should issue an out-of-band pairing code.
    pub pairing: bool,
    pub options: TransportOptions,
    /// Answers the transport's "what was message X" lookups.
    pub retry_cache: RetryMessageCache,
}

/// A live connection: the command handle plus its event stream.
pub struct TransportConnection {
    pub handle: Arc<dyn TransportHandle>,
    pub events: TransportEventStream,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<TransportConnection, CourierError>;
}

#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Send a message and return the transport-assigned message id.
    async fn send_message(
        &self,
        target: &str,
        payload: &MessagePayload,
    ) -> Result<String, CourierError>;

    async fn reject_call(&self, call_id: &str, from: &str) -> Result<(), CourierError>;

    async fn logout(&self) -> Result<(), CourierError>;
}

/// Explicitly owned connection object passed to the router and handlers.
///
/// One handle exists per connection; it is never shared across reconnects.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: Uuid,
    inner: Arc<dyn TransportHandle>,
    retry_cache: RetryMessageCache,
}

impl SessionHandle {
    pub fn new(inner: Arc<dyn TransportHandle>, retry_cache: RetryMessageCache) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            inner,
            retry_cache,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Send and remember the payload so transport retries can restate it.
    pub async fn send_message(
        &self,
        target: &str,
        payload: MessagePayload,
    ) -> Result<String, CourierError> {
        let message_id = self.inner.send_message(target, &payload).await?;
        self.retry_cache.record(message_id.clone(), payload);
        Ok(message_id)
    }

    pub async fn reject_call(&self, call_id: &str, from: &str) -> Result<(), CourierError> {
        self.inner.reject_call(call_id, from).await
    }

    pub async fn logout(&self) -> Result<(), CourierError> {
        self.inner.logout().await
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Recorder;

    #[tokio::test]
    async fn send_records_payload_for_transport_retries() {
        let recorder = Arc::new(Recorder::default());
        let cache = RetryMessageCache::default();
        let session = SessionHandle::new(recorder.handle(), cache.clone());

        let message_id = session
            .send_message("555@s.whatsapp.net", MessagePayload::text("hello"))
            .await
            .expect("send should work");

        assert_eq!(cache.get(&message_id), MessagePayload::text("hello"));
        assert_eq!(recorder.sent().len(), 1);
    }

    #[tokio::test]
    async fn failed_send_records_nothing() {
        let recorder = Arc::new(Recorder::failing_for("bad@s.whatsapp.net"));
        let cache = RetryMessageCache::default();
        let session = SessionHandle::new(recorder.handle(), cache.clone());

        session
            .send_message("bad@s.whatsapp.net", MessagePayload::text("hello"))
            .await
            .expect_err("send must fail");
        assert!(cache.is_empty());
    }

    #[test]
    fn handles_get_distinct_session_ids() {
        let recorder = Arc::new(Recorder::default());
        let a = SessionHandle::new(recorder.handle(), RetryMessageCache::default());
        let b = SessionHandle::new(recorder.handle(), RetryMessageCache::default());
        assert_ne!(a.session_id(), b.session_id());
    }
}
