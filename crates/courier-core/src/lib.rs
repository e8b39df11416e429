//! Core contract shared by the courier runtime, platform and daemon.
//!
//! This crate defines the transport event protocol, the connection lifecycle
//! model, retry/backoff helpers and the retry message cache.

/// Transport event channel primitives.
pub mod channel;
/// Stable error types and close status classification.
pub mod error;
/// Recipient address normalization.
pub mod normalization;
/// Linear backoff policy used by the reconnect loop.
pub mod retry;
/// Bounded, expiring cache of sent payloads.
pub mod retry_cache;
/// Connection lifecycle state machine.
pub mod state_machine;
/// Transport-facing protocol types.
pub mod types;

pub use channel::{TransportChannelError, TransportEventSink, TransportEventStream};
pub use error::{CourierError, CourierErrorCategory, DisconnectReason};
pub use normalization::{normalize_recipient, normalize_recipients};
pub use retry::RetryPolicy;
pub use retry_cache::RetryMessageCache;
pub use state_machine::{CloseDecision, CloseKind, ConnectionStateMachine, FailureReason};
pub use types::{
    CallOffer, CloseReason, ConnectionState, ConnectionUpdate, ContactUpdate, Credential,
    DeliveryClass, EventCategory, GroupMetadataUpdate, InboundMessage, LinkState, MessageDelete,
    MessagePayload, MessageUpdate, ParticipantAction, ParticipantsUpdate, RoutedEvent,
    TransportEvent, TransportOptions,
};
