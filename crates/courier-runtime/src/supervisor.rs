//! Connection supervision loop.
//!
//! The supervisor owns the state machine and drives one transport connection
//! at a time: connect, consume events until close, decide via the state
//! machine whether to back off and reconnect or to fail terminally.

use std::{sync::Arc, time::Duration};

use courier_core::{
    CloseDecision, CloseKind, CloseReason, ConnectionState, ConnectionStateMachine,
    ConnectionUpdate, CourierError, Credential, FailureReason, LinkState, RetryMessageCache, RetryPolicy,
    TransportEvent, TransportOptions, retry_cache,
};
use courier_platform::CredentialStore;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    credentials::CredentialSource,
    notifier::StartupNotifier,
    router::{DispatchTable, EventRouter},
    transport::{ConnectRequest, SessionHandle, Transport, TransportConnection},
};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub max_reconnect: u32,
    pub close_retry: RetryPolicy,
    pub connect_retry: RetryPolicy,
    pub transport_options: TransportOptions,
    pub cache_sweep_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_reconnect: 3,
            close_retry: RetryPolicy::after_close(),
            connect_retry: RetryPolicy::after_connect_failure(),
            transport_options: TransportOptions::default(),
            cache_sweep_interval: retry_cache::DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Clean end of supervision. Terminal failures are returned as `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    Shutdown,
}

/// Snapshot published on every lifecycle change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
}

enum SessionOutcome {
    Closed(CloseReason),
    Shutdown,
}

pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    initial: CredentialSource,
    state_machine: ConnectionStateMachine,
    retry_cache: RetryMessageCache,
    dispatch: Arc<DispatchTable>,
    notifier: Arc<StartupNotifier>,
    options: TransportOptions,
    sweep_interval: Duration,
    shutdown: CancellationToken,
    status_tx: watch::Sender<SupervisorStatus>,
    attempts_started: u64,
}

impl ConnectionSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
        initial: CredentialSource,
        retry_cache: RetryMessageCache,
        dispatch: Arc<DispatchTable>,
        notifier: Arc<StartupNotifier>,
        config: SupervisorConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let state_machine = ConnectionStateMachine::new(
            config.max_reconnect,
            config.close_retry,
            config.connect_retry,
        );
        let (status_tx, _) = watch::channel(SupervisorStatus {
            state: state_machine.state(),
            reconnect_attempts: 0,
        });
        Self {
            transport,
            store,
            initial,
            state_machine,
            retry_cache,
            dispatch,
            notifier,
            options: config.transport_options,
            sweep_interval: config.cache_sweep_interval,
            shutdown,
            status_tx,
            attempts_started: 0,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.status_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.state_machine.state()
    }

    /// Supervise until shutdown (`Ok`) or a terminal failure (`Err`).
    pub async fn run(mut self) -> Result<SupervisorExit, CourierError> {
        let sweeper = self.spawn_cache_sweeper();
        let result = self.supervise().await;
        sweeper.abort();
        result
    }

    async fn supervise(&mut self) -> Result<SupervisorExit, CourierError> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(self.finish_shutdown(None).await);
            }

            self.state_machine.begin_connect()?;
            self.publish_status();
            let request = self.connect_request();
            info!(
                attempt = self.state_machine.reconnect_attempts(),
                max_attempts = self.state_machine.max_reconnect(),
                pairing = request.pairing,
                "connecting to transport"
            );

            let connected = self.transport.connect(request).await;
            let (close, stale_session) = match connected {
                Ok(connection) => {
                    let session =
                        SessionHandle::new(Arc::clone(&connection.handle), self.retry_cache.clone());
                    match self.supervise_session(connection, &session).await {
                        SessionOutcome::Closed(reason) => (CloseKind::Remote(reason), Some(session)),
                        SessionOutcome::Shutdown => {
                            return Ok(self.finish_shutdown(Some(session)).await);
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "failed to establish transport connection");
                    (CloseKind::ConnectFailed, None)
                }
            };

            let decision = self.state_machine.on_close(&close)?;
            self.publish_status();
            match decision {
                CloseDecision::Reconnect { attempt, delay } => {
                    if let Some(session) = stale_session {
                        logout_best_effort(&session).await;
                    }
                    info!(
                        attempt,
                        max_attempts = self.state_machine.max_reconnect(),
                        delay_ms = delay.as_millis() as u64,
                        "reconnect scheduled"
                    );
                    let shutdown = self.shutdown.clone();
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            return Ok(self.finish_shutdown(None).await);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                CloseDecision::Fail(reason) => {
                    self.notifier.cancel_pending();
                    error!(reason = ?reason, "connection failed permanently");
                    if let FailureReason::LoggedOut { .. } = reason {
                        self.discard_credential();
                    }
                    return Err(reason.into_error());
                }
            }
        }
    }

    fn connect_request(&mut self) -> ConnectRequest {
        self.attempts_started += 1;
        let (credential, pairing) = if self.attempts_started == 1 {
            (self.initial.credential().cloned(), self.initial.pairing_mode())
        } else {
            self.reload_credential()
        };
        ConnectRequest {
            credential,
            pairing,
            options: self.options.clone(),
            retry_cache: self.retry_cache.clone(),
        }
    }

    /// Rotated credentials live in the store, so reconnects read it back.
    fn reload_credential(&self) -> (Option<Credential>, bool) {
        match self.store.load() {
            Ok(Some(credential)) => (Some(credential), false),
            Ok(None) => (
                self.initial.credential().cloned(),
                self.initial.pairing_mode(),
            ),
            Err(err) => {
                warn!(error = %err, "failed reloading stored session; reusing initial credential");
                (
                    self.initial.credential().cloned(),
                    self.initial.pairing_mode(),
                )
            }
        }
    }

    async fn supervise_session(
        &mut self,
        connection: TransportConnection,
        session: &SessionHandle,
    ) -> SessionOutcome {
        let TransportConnection { mut events, .. } = connection;
        let shutdown = self.shutdown.clone();
        let mut router: Option<EventRouter> = None;

        let outcome = loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break SessionOutcome::Shutdown,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                warn!("transport event stream ended without a close notification");
                break SessionOutcome::Closed(CloseReason::new(None, "event stream ended"));
            };

            match event {
                TransportEvent::ConnectionUpdate(update) => {
                    if let Some(reason) = self.apply_connection_update(update, session, &mut router)
                    {
                        break SessionOutcome::Closed(reason);
                    }
                }
                TransportEvent::CredentialsUpdated(credential) => {
                    self.persist_rotated_credential(&credential);
                }
                other => match &router {
                    Some(router) => {
                        router.route(other);
                    }
                    None => debug!(event = other.kind(), "dropping event received before open"),
                },
            }
        };

        self.notifier.on_close();
        if let Some(router) = router {
            match outcome {
                SessionOutcome::Shutdown => router.shutdown().await,
                SessionOutcome::Closed(_) => router.detach(),
            }
        }
        outcome
    }

    fn apply_connection_update(
        &mut self,
        update: ConnectionUpdate,
        session: &SessionHandle,
        router: &mut Option<EventRouter>,
    ) -> Option<CloseReason> {
        if let Some(code) = update.pairing_code.as_deref() {
            info!(pairing_code = %code, "pairing code issued; enter it on the primary device");
        }

        match update.state {
            Some(LinkState::Connecting) => debug!("transport is connecting"),
            Some(LinkState::Open) => match self.state_machine.on_open() {
                Ok(_) => {
                    self.publish_status();
                    info!(session_id = %session.session_id(), "connection open");
                    if router.is_none() {
                        *router = Some(EventRouter::start(
                            Arc::clone(&self.dispatch),
                            session.clone(),
                        ));
                    }
                    if self.notifier.on_open(session) {
                        info!("startup notifications scheduled");
                    }
                }
                Err(err) => warn!(error = %err, "ignoring unexpected open notification"),
            },
            Some(LinkState::Close) => {
                let reason = update.close_reason.unwrap_or_default();
                let will_reconnect = reason.is_recoverable()
                    && self.state_machine.reconnect_attempts() < self.state_machine.max_reconnect();
                warn!(
                    status_code = ?reason.status_code,
                    reason = reason.message.as_deref().unwrap_or("unspecified"),
                    disconnect = ?reason.disconnect_reason(),
                    will_reconnect,
                    "connection closed"
                );
                return Some(reason);
            }
            None => {}
        }
        None
    }

    fn persist_rotated_credential(&self, credential: &Credential) {
        match self.store.save(credential) {
            Ok(()) => debug!("rotated session credential persisted"),
            Err(err) => error!(error = %err, "failed persisting rotated session credential"),
        }
    }

    /// The remote side revoked this identity; the stored record is useless now.
    fn discard_credential(&self) {
        match self.store.clear() {
            Ok(()) => info!("stored session credential cleared after remote logout"),
            Err(err) => warn!(error = %err, "failed clearing revoked session credential"),
        }
    }

    async fn finish_shutdown(&mut self, session: Option<SessionHandle>) -> SupervisorExit {
        info!("shutting down connection supervisor");
        if let Err(err) = self.state_machine.begin_shutdown() {
            debug!(error = %err, "shutdown from terminal state");
        }
        self.publish_status();
        self.notifier.cancel_pending();
        if let Some(session) = session {
            logout_best_effort(&session).await;
        }
        SupervisorExit::Shutdown
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(SupervisorStatus {
            state: self.state_machine.state(),
            reconnect_attempts: self.state_machine.reconnect_attempts(),
        });
    }

    fn spawn_cache_sweeper(&self) -> JoinHandle<()> {
        let cache = self.retry_cache.clone();
        let period = self.sweep_interval;
        let stop = self.shutdown.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.sweep();
                        if removed > 0 {
                            trace!(removed, "swept expired retry cache entries");
                        }
                    }
                }
            }
        })
    }
}

async fn logout_best_effort(session: &SessionHandle) {
    match session.logout().await {
        Ok(()) => debug!(session_id = %session.session_id(), "previous session logged out"),
        Err(err) => warn!(
            session_id = %session.session_id(),
            error = %err,
            "logout of previous session failed; continuing"
        ),
    }
}
