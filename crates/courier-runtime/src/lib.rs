//! Runtime for a long-lived messaging client session.
//!
//! [`ConnectionSupervisor`] keeps one transport connection alive with bounded
//! reconnects, [`CredentialResolver`] bootstraps the identity from an operator
//! token, and [`EventRouter`] fans transport events out to handler sets.

pub mod credentials;
pub mod handlers;
pub mod notifier;
pub mod router;
pub mod scheduler;
pub mod sidecar;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use credentials::{CredentialResolver, CredentialSource};
pub use handlers::{CallHandler, ContactHandler, GroupHandler, HandlerSets, MessageHandler};
pub use notifier::{CommandCountSource, NotifierConfig, NotifySummary, StartupNotifier, notify_all};
pub use router::{CategoryStats, DispatchTable, DispatchTableBuilder, EventHandler, EventRouter};
pub use scheduler::Scheduler;
pub use sidecar::SidecarTransport;
pub use supervisor::{ConnectionSupervisor, SupervisorConfig, SupervisorExit, SupervisorStatus};
pub use transport::{
    ConnectRequest, SessionHandle, Transport, TransportConnection, TransportHandle,
};
