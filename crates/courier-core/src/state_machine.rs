use std::time::Duration;

use crate::{
    error::{CourierError, CourierErrorCategory},
    retry::RetryPolicy,
    types::{CloseReason, ConnectionState},
};

/// How a connection attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseKind {
    /// The transport signalled `close` on an attempt or an open connection.
    Remote(CloseReason),
    /// `connect` itself failed before any connection existed.
    ConnectFailed,
}

/// What the supervisor must do after a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDecision {
    /// Wait `delay`, then start attempt number `attempt`.
    Reconnect { attempt: u32, delay: Duration },
    /// Terminal failure.
    Fail(FailureReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The remote endpoint logged this identity out.
    LoggedOut { status_code: Option<u16> },
    /// The reconnect budget is spent.
    RetriesExhausted { attempts: u32 },
}

impl FailureReason {
    pub fn into_error(self) -> CourierError {
        match self {
            Self::LoggedOut { status_code } => CourierError::new(
                CourierErrorCategory::Auth,
                "logged_out",
                format!("remote endpoint logged this session out (status {status_code:?})"),
            ),
            Self::RetriesExhausted { attempts } => CourierError::new(
                CourierErrorCategory::Network,
                "retries_exhausted",
                format!("connection closed after {attempts} reconnect attempts"),
            ),
        }
    }
}

/// Connection lifecycle with a bounded reconnect counter.
///
/// Invariant: `0 <= reconnect_attempts <= max_reconnect`.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    reconnect_attempts: u32,
    max_reconnect: u32,
    close_policy: RetryPolicy,
    connect_policy: RetryPolicy,
}

impl ConnectionStateMachine {
    pub fn new(max_reconnect: u32, close_policy: RetryPolicy, connect_policy: RetryPolicy) -> Self {
        Self {
            state: ConnectionState::Idle,
            reconnect_attempts: 0,
            max_reconnect,
            close_policy,
            connect_policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn max_reconnect(&self) -> u32 {
        self.max_reconnect
    }

    pub fn begin_connect(&mut self) -> Result<ConnectionState, CourierError> {
        self.transition_from_any_of(
            &[ConnectionState::Idle, ConnectionState::Closing],
            ConnectionState::Connecting,
            "begin_connect",
        )
    }

    /// Enter `Open` and reset the reconnect counter.
    pub fn on_open(&mut self) -> Result<ConnectionState, CourierError> {
        let next = self.transition_from_any_of(
            &[ConnectionState::Connecting],
            ConnectionState::Open,
            "on_open",
        )?;
        self.reconnect_attempts = 0;
        Ok(next)
    }

    pub fn on_close(&mut self, kind: &CloseKind) -> Result<CloseDecision, CourierError> {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            return Err(CourierError::invalid_state(self.state, "on_close"));
        }

        if let CloseKind::Remote(reason) = kind
            && !reason.is_recoverable()
        {
            self.state = ConnectionState::Failed;
            return Ok(CloseDecision::Fail(FailureReason::LoggedOut {
                status_code: reason.status_code,
            }));
        }

        if self.reconnect_attempts >= self.max_reconnect {
            self.state = ConnectionState::Failed;
            return Ok(CloseDecision::Fail(FailureReason::RetriesExhausted {
                attempts: self.reconnect_attempts,
            }));
        }

        self.reconnect_attempts += 1;
        self.state = ConnectionState::Closing;
        let policy = match kind {
            CloseKind::Remote(_) => self.close_policy,
            CloseKind::ConnectFailed => self.connect_policy,
        };
        Ok(CloseDecision::Reconnect {
            attempt: self.reconnect_attempts,
            delay: policy.delay_for_attempt(self.reconnect_attempts),
        })
    }

    /// Graceful shutdown requested by the process.
    pub fn begin_shutdown(&mut self) -> Result<ConnectionState, CourierError> {
        self.transition_from_any_of(
            &[
                ConnectionState::Idle,
                ConnectionState::Connecting,
                ConnectionState::Open,
                ConnectionState::Closing,
            ],
            ConnectionState::Closing,
            "begin_shutdown",
        )
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[ConnectionState],
        next: ConnectionState,
        action: &str,
    ) -> Result<ConnectionState, CourierError> {
        if !expected.contains(&self.state) {
            return Err(CourierError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(next)
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new(
            3,
            RetryPolicy::after_close(),
            RetryPolicy::after_connect_failure(),
        )
    }
}
