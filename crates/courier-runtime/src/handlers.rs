//! Built-in handler sets wired into the default dispatch table.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use courier_core::{CourierError, EventCategory, MessagePayload, RoutedEvent};
use tracing::{debug, info};

use crate::{
    router::{DispatchTable, EventHandler},
    transport::SessionHandle,
};

fn unexpected(handler: &str, event: &RoutedEvent) -> CourierError {
    CourierError::handler(format!(
        "{handler} handler received {} event",
        event.category().as_str()
    ))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageStats {
    pub received: u64,
    pub updated: u64,
    pub deleted: u64,
}

/// Observes message traffic. Command processing plugs in behind this seam.
#[derive(Debug, Default)]
pub struct MessageHandler {
    received: AtomicU64,
    updated: AtomicU64,
    deleted: AtomicU64,
}

impl MessageHandler {
    pub fn stats(&self) -> MessageStats {
        MessageStats {
            received: self.received.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl EventHandler for MessageHandler {
    async fn handle(
        &self,
        _session: &SessionHandle,
        event: &RoutedEvent,
    ) -> Result<(), CourierError> {
        match event {
            RoutedEvent::MessageUpsert(message) => {
                self.received.fetch_add(1, Ordering::Relaxed);
                debug!(
                    message_id = %message.id,
                    chat = %message.chat,
                    from_me = message.from_me,
                    "message received"
                );
            }
            RoutedEvent::MessageUpdate(update) => {
                self.updated.fetch_add(1, Ordering::Relaxed);
                debug!(
                    message_id = %update.id,
                    status = update.status.as_deref().unwrap_or("unknown"),
                    "message updated"
                );
            }
            RoutedEvent::MessageDelete(delete) => {
                self.deleted.fetch_add(1, Ordering::Relaxed);
                debug!(message_id = %delete.id, chat = %delete.chat, "message deleted");
            }
            other => return Err(unexpected("message", other)),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallStats {
    pub offers: u64,
    pub rejected: u64,
    pub replied: u64,
}

/// Answers incoming call offers, either by rejecting or with a text notice.
#[derive(Debug)]
pub struct CallHandler {
    auto_reject: bool,
    offers: AtomicU64,
    rejected: AtomicU64,
    replied: AtomicU64,
}

pub const CALL_NOTICE: &str = "Calls are not answered here. Please send a message instead.";

impl CallHandler {
    pub fn new(auto_reject: bool) -> Self {
        Self {
            auto_reject,
            offers: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            replied: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> CallStats {
        CallStats {
            offers: self.offers.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            replied: self.replied.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl EventHandler for CallHandler {
    async fn handle(
        &self,
        session: &SessionHandle,
        event: &RoutedEvent,
    ) -> Result<(), CourierError> {
        let RoutedEvent::Call(call) = event else {
            return Err(unexpected("call", event));
        };
        if call.status != "offer" {
            debug!(call_id = %call.id, status = %call.status, "call status change");
            return Ok(());
        }

        self.offers.fetch_add(1, Ordering::Relaxed);
        if self.auto_reject {
            session.reject_call(&call.id, &call.from).await?;
            self.rejected.fetch_add(1, Ordering::Relaxed);
            info!(call_id = %call.id, from = %call.from, "incoming call rejected");
        } else {
            session
                .send_message(&call.from, MessagePayload::text(CALL_NOTICE))
                .await?;
            self.replied.fetch_add(1, Ordering::Relaxed);
            info!(call_id = %call.id, from = %call.from, "replied to incoming call");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupStats {
    pub participant_changes: u64,
    pub metadata_changes: u64,
}

#[derive(Debug, Default)]
pub struct GroupHandler {
    participant_changes: AtomicU64,
    metadata_changes: AtomicU64,
}

impl GroupHandler {
    pub fn stats(&self) -> GroupStats {
        GroupStats {
            participant_changes: self.participant_changes.load(Ordering::Relaxed),
            metadata_changes: self.metadata_changes.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl EventHandler for GroupHandler {
    async fn handle(
        &self,
        _session: &SessionHandle,
        event: &RoutedEvent,
    ) -> Result<(), CourierError> {
        match event {
            RoutedEvent::GroupParticipants(update) => {
                self.participant_changes
                    .fetch_add(update.participants.len() as u64, Ordering::Relaxed);
                info!(
                    group_id = %update.group_id,
                    action = ?update.action,
                    participants = update.participants.len(),
                    "group participants changed"
                );
            }
            RoutedEvent::GroupMetadata(update) => {
                self.metadata_changes.fetch_add(1, Ordering::Relaxed);
                info!(
                    group_id = %update.group_id,
                    subject = update.subject.as_deref().unwrap_or(""),
                    announce = ?update.announce,
                    restrict = ?update.restrict,
                    "group metadata changed"
                );
            }
            other => return Err(unexpected("group", other)),
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ContactHandler {
    updates: AtomicU64,
}

impl ContactHandler {
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventHandler for ContactHandler {
    async fn handle(
        &self,
        _session: &SessionHandle,
        event: &RoutedEvent,
    ) -> Result<(), CourierError> {
        let RoutedEvent::ContactUpdate(contact) = event else {
            return Err(unexpected("contact", event));
        };
        self.updates.fetch_add(1, Ordering::Relaxed);
        debug!(
            contact_id = %contact.id,
            name = contact.name.as_deref().or(contact.notify.as_deref()).unwrap_or(""),
            "contact updated"
        );
        Ok(())
    }
}

/// The four handler sets, kept so callers can read their stats.
#[derive(Clone)]
pub struct HandlerSets {
    pub messages: Arc<MessageHandler>,
    pub calls: Arc<CallHandler>,
    pub groups: Arc<GroupHandler>,
    pub contacts: Arc<ContactHandler>,
}

impl HandlerSets {
    pub fn new(auto_reject_calls: bool) -> Self {
        Self {
            messages: Arc::new(MessageHandler::default()),
            calls: Arc::new(CallHandler::new(auto_reject_calls)),
            groups: Arc::new(GroupHandler::default()),
            contacts: Arc::new(ContactHandler::default()),
        }
    }

    /// Wire every category to its handler set.
    pub fn dispatch_table(&self) -> DispatchTable {
        DispatchTable::builder()
            .route(EventCategory::MessageUpsert, self.messages.clone())
            .route(EventCategory::MessageUpdate, self.messages.clone())
            .route(EventCategory::MessageDelete, self.messages.clone())
            .route(EventCategory::GroupParticipants, self.groups.clone())
            .route(EventCategory::GroupMetadata, self.groups.clone())
            .route(EventCategory::Call, self.calls.clone())
            .route(EventCategory::ContactUpdate, self.contacts.clone())
            .build()
    }
}
