use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DisconnectReason;

/// Connection lifecycle state owned by the connection supervisor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection attempt has been made yet.
    Idle,
    /// A connection attempt is in flight.
    Connecting,
    /// The transport reported the connection as open.
    Open,
    /// The previous connection closed and a reconnect (or shutdown) is pending.
    Closing,
    /// Terminal: no further supervision happens.
    Failed,
}

/// Durable credential record required by the transport to authenticate.
///
/// The record is opaque to this crate: it is always a JSON object, and only the
/// transport interprets its keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct Credential(Map<String, Value>);

impl Credential {
    /// Wrap an already-parsed JSON object.
    pub fn from_map(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Parse a JSON document, accepting only objects.
    pub fn from_json(raw: &str) -> Option<Self> {
        match serde_json::from_str::<Value>(raw).ok()? {
            Value::Object(fields) => Some(Self(fields)),
            _ => None,
        }
    }

    /// Parse JSON bytes, accepting only objects.
    pub fn from_json_bytes(raw: &[u8]) -> Option<Self> {
        match serde_json::from_slice::<Value>(raw).ok()? {
            Value::Object(fields) => Some(Self(fields)),
            _ => None,
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// Outbound or remembered message content.
///
/// The empty payload is the benign answer to a transport retry lookup miss.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MessagePayload {
    /// Plain conversation text.
    #[serde(default)]
    pub conversation: String,
}

impl MessagePayload {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            conversation: body.into(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.conversation.is_empty()
    }
}

/// Link state reported by the transport in a `connection.update`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Connecting,
    Open,
    Close,
}

/// Why the transport closed the connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CloseReason {
    /// Transport status code, when the transport supplied one.
    pub status_code: Option<u16>,
    /// Human-readable cause.
    pub message: Option<String>,
}

impl CloseReason {
    pub fn new(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status_code,
            message: Some(message.into()),
        }
    }

    pub fn disconnect_reason(&self) -> DisconnectReason {
        self.status_code
            .map(DisconnectReason::from_status)
            .unwrap_or(DisconnectReason::ConnectionLost)
    }

    /// Only an explicit remote logout is unrecoverable.
    pub fn is_recoverable(&self) -> bool {
        self.disconnect_reason().is_recoverable()
    }
}

/// The transport's `connection.update` notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ConnectionUpdate {
    pub state: Option<LinkState>,
    pub close_reason: Option<CloseReason>,
    /// Out-of-band pairing code (for example a scannable code) issued by the transport.
    pub pairing_code: Option<String>,
}

impl ConnectionUpdate {
    pub fn open() -> Self {
        Self {
            state: Some(LinkState::Open),
            ..Self::default()
        }
    }

    pub fn connecting() -> Self {
        Self {
            state: Some(LinkState::Connecting),
            ..Self::default()
        }
    }

    pub fn closed(reason: CloseReason) -> Self {
        Self {
            state: Some(LinkState::Close),
            close_reason: Some(reason),
            pairing_code: None,
        }
    }
}

/// Delivery class of a `messages.upsert` batch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryClass {
    /// Live delivery; the only class that is routed.
    Notify,
    /// Messages appended by another device of the same account.
    Append,
    /// Historical backfill.
    History,
}

/// One inbound message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: String,
    /// Conversation the message belongs to.
    pub chat: String,
    /// Author inside group chats.
    pub sender: Option<String>,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub payload: MessagePayload,
    /// Seconds since Unix epoch.
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageUpdate {
    pub id: String,
    pub chat: String,
    /// Delivery/read status reported by the transport.
    pub status: Option<String>,
    pub payload: Option<MessagePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageDelete {
    pub id: String,
    pub chat: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantAction {
    Add,
    Remove,
    Leave,
    Promote,
    Demote,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantsUpdate {
    pub group_id: String,
    pub participants: Vec<String>,
    pub action: ParticipantAction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupMetadataUpdate {
    pub group_id: String,
    pub subject: Option<String>,
    pub description: Option<String>,
    /// Only admins may send messages.
    pub announce: Option<bool>,
    /// Only admins may edit group settings.
    pub restrict: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallOffer {
    pub id: String,
    pub from: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactUpdate {
    pub id: String,
    pub name: Option<String>,
    pub notify: Option<String>,
}

/// Everything the transport can emit on its event stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TransportEvent {
    ConnectionUpdate(ConnectionUpdate),
    /// The transport rotated its credential and wants it persisted.
    CredentialsUpdated(Credential),
    MessagesUpsert {
        messages: Vec<InboundMessage>,
        delivery: DeliveryClass,
    },
    MessagesUpdate(Vec<MessageUpdate>),
    MessagesDelete(Vec<MessageDelete>),
    GroupParticipantsUpdate(ParticipantsUpdate),
    GroupsUpdate(Vec<GroupMetadataUpdate>),
    Call(Vec<CallOffer>),
    ContactsUpdate(Vec<ContactUpdate>),
}

impl TransportEvent {
    /// Short stable name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionUpdate(_) => "connection.update",
            Self::CredentialsUpdated(_) => "creds.update",
            Self::MessagesUpsert { .. } => "messages.upsert",
            Self::MessagesUpdate(_) => "messages.update",
            Self::MessagesDelete(_) => "messages.delete",
            Self::GroupParticipantsUpdate(_) => "group-participants.update",
            Self::GroupsUpdate(_) => "groups.update",
            Self::Call(_) => "call",
            Self::ContactsUpdate(_) => "contacts.update",
        }
    }

    /// Split a category event into individually routed events.
    ///
    /// Returns an empty list for lifecycle events and for upserts outside the
    /// live delivery class.
    pub fn into_routed(self) -> Vec<RoutedEvent> {
        match self {
            Self::ConnectionUpdate(_) | Self::CredentialsUpdated(_) => Vec::new(),
            Self::MessagesUpsert { messages, delivery } => {
                if delivery != DeliveryClass::Notify {
                    return Vec::new();
                }
                messages.into_iter().map(RoutedEvent::MessageUpsert).collect()
            }
            Self::MessagesUpdate(updates) => {
                updates.into_iter().map(RoutedEvent::MessageUpdate).collect()
            }
            Self::MessagesDelete(deletes) => {
                deletes.into_iter().map(RoutedEvent::MessageDelete).collect()
            }
            Self::GroupParticipantsUpdate(update) => vec![RoutedEvent::GroupParticipants(update)],
            Self::GroupsUpdate(updates) => {
                updates.into_iter().map(RoutedEvent::GroupMetadata).collect()
            }
            Self::Call(offers) => offers.into_iter().map(RoutedEvent::Call).collect(),
            Self::ContactsUpdate(updates) => {
                updates.into_iter().map(RoutedEvent::ContactUpdate).collect()
            }
        }
    }
}

/// Independent ordering domain of routed events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventCategory {
    MessageUpsert,
    MessageUpdate,
    MessageDelete,
    GroupParticipants,
    GroupMetadata,
    Call,
    ContactUpdate,
}

impl EventCategory {
    pub const ALL: [EventCategory; 7] = [
        EventCategory::MessageUpsert,
        EventCategory::MessageUpdate,
        EventCategory::MessageDelete,
        EventCategory::GroupParticipants,
        EventCategory::GroupMetadata,
        EventCategory::Call,
        EventCategory::ContactUpdate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageUpsert => "message_upsert",
            Self::MessageUpdate => "message_update",
            Self::MessageDelete => "message_delete",
            Self::GroupParticipants => "group_participants",
            Self::GroupMetadata => "group_metadata",
            Self::Call => "call",
            Self::ContactUpdate => "contact_update",
        }
    }
}

/// A single event handed to exactly one handler set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutedEvent {
    MessageUpsert(InboundMessage),
    MessageUpdate(MessageUpdate),
    MessageDelete(MessageDelete),
    GroupParticipants(ParticipantsUpdate),
    GroupMetadata(GroupMetadataUpdate),
    Call(CallOffer),
    ContactUpdate(ContactUpdate),
}

impl RoutedEvent {
    pub fn category(&self) -> EventCategory {
        match self {
            Self::MessageUpsert(_) => EventCategory::MessageUpsert,
            Self::MessageUpdate(_) => EventCategory::MessageUpdate,
            Self::MessageDelete(_) => EventCategory::MessageDelete,
            Self::GroupParticipants(_) => EventCategory::GroupParticipants,
            Self::GroupMetadata(_) => EventCategory::GroupMetadata,
            Self::Call(_) => EventCategory::Call,
            Self::ContactUpdate(_) => EventCategory::ContactUpdate,
        }
    }
}

/// Tuning forwarded to the transport on every connect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportOptions {
    /// Historical backfill is never requested; only live events are wanted.
    pub sync_full_history: bool,
    pub emit_own_events: bool,
    pub mark_online_on_connect: bool,
    pub connect_timeout_ms: u64,
    pub pairing_timeout_ms: u64,
    pub default_query_timeout_ms: u64,
    pub keep_alive_interval_ms: u64,
    pub retry_request_delay_ms: u64,
    pub max_message_retry_count: u32,
}

impl TransportOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            sync_full_history: false,
            emit_own_events: false,
            mark_online_on_connect: true,
            connect_timeout_ms: 60_000,
            pairing_timeout_ms: 60_000,
            default_query_timeout_ms: 120_000,
            keep_alive_interval_ms: 20_000,
            retry_request_delay_ms: 5_000,
            max_message_retry_count: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str) -> InboundMessage {
        InboundMessage {
            id: id.to_owned(),
            chat: "12345@s.whatsapp.net".to_owned(),
            sender: None,
            from_me: false,
            payload: MessagePayload::text("hi"),
            timestamp: Some(1_731_000_000),
        }
    }

    #[test]
    fn credential_accepts_only_json_objects() {
        let credential = Credential::from_json(r#"{"foo":1}"#).expect("object should parse");
        assert_eq!(credential.get("foo"), Some(&Value::from(1)));

        assert_eq!(Credential::from_json("[1,2]"), None);
        assert_eq!(Credential::from_json("\"text\""), None);
        assert_eq!(Credential::from_json("not json"), None);
    }

    #[test]
    fn only_logged_out_close_is_unrecoverable() {
        assert!(!CloseReason::new(Some(401), "logged out").is_recoverable());
        assert!(CloseReason::new(Some(428), "closed").is_recoverable());
        assert!(CloseReason::new(Some(515), "restart").is_recoverable());
        assert!(CloseReason::default().is_recoverable());
    }

    #[test]
    fn explodes_live_upsert_batches_per_message() {
        let routed = TransportEvent::MessagesUpsert {
            messages: vec![message("a"), message("b")],
            delivery: DeliveryClass::Notify,
        }
        .into_routed();

        assert_eq!(routed.len(), 2);
        assert!(
            routed
                .iter()
                .all(|event| event.category() == EventCategory::MessageUpsert)
        );
    }

    #[test]
    fn skips_non_live_upserts_and_lifecycle_events() {
        let history = TransportEvent::MessagesUpsert {
            messages: vec![message("a")],
            delivery: DeliveryClass::History,
        };
        assert!(history.into_routed().is_empty());

        let update = TransportEvent::ConnectionUpdate(ConnectionUpdate::open());
        assert!(update.into_routed().is_empty());
    }

    #[test]
    fn transport_event_wire_shape_is_tagged() {
        let event = TransportEvent::Call(vec![CallOffer {
            id: "call-1".into(),
            from: "555@s.whatsapp.net".into(),
            status: "offer".into(),
        }]);
        let encoded = serde_json::to_value(&event).expect("encode");
        assert_eq!(encoded["type"], "call");
        assert_eq!(encoded["data"][0]["id"], "call-1");
    }

    #[test]
    fn default_transport_options_disable_history_sync() {
        let options = TransportOptions::default();
        assert!(!options.sync_full_history);
        assert_eq!(options.connect_timeout(), Duration::from_secs(60));
    }
}
