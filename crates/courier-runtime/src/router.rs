//! Category-keyed event dispatch.
//!
//! The dispatch table is built once at startup. Each routed category gets its
//! own worker and FIFO queue, so events within a category are handled strictly
//! in arrival order while categories progress independently. A handler error
//! or panic is logged and counted; it never stops the worker.

use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use courier_core::{CourierError, EventCategory, RoutedEvent, TransportEvent};
use futures::FutureExt;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, trace, warn};

use crate::transport::SessionHandle;

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, session: &SessionHandle, event: &RoutedEvent)
    -> Result<(), CourierError>;
}

struct Route {
    handler: Arc<dyn EventHandler>,
    delivered: AtomicU64,
    faulted: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryStats {
    pub category: EventCategory,
    pub delivered: u64,
    pub faulted: u64,
}

/// Immutable category to handler mapping.
pub struct DispatchTable {
    routes: BTreeMap<EventCategory, Route>,
}

#[derive(Default)]
pub struct DispatchTableBuilder {
    routes: BTreeMap<EventCategory, Arc<dyn EventHandler>>,
}

impl DispatchTableBuilder {
    /// Register `handler` for `category`, replacing any earlier one.
    pub fn route(mut self, category: EventCategory, handler: Arc<dyn EventHandler>) -> Self {
        self.routes.insert(category, handler);
        self
    }

    pub fn build(self) -> DispatchTable {
        let routes = self
            .routes
            .into_iter()
            .map(|(category, handler)| {
                (
                    category,
                    Route {
                        handler,
                        delivered: AtomicU64::new(0),
                        faulted: AtomicU64::new(0),
                    },
                )
            })
            .collect();
        DispatchTable { routes }
    }
}

impl DispatchTable {
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder::default()
    }

    pub fn is_routed(&self, category: EventCategory) -> bool {
        self.routes.contains_key(&category)
    }

    pub fn categories(&self) -> impl Iterator<Item = EventCategory> + '_ {
        self.routes.keys().copied()
    }

    pub fn stats(&self) -> Vec<CategoryStats> {
        self.routes
            .iter()
            .map(|(category, route)| CategoryStats {
                category: *category,
                delivered: route.delivered.load(Ordering::Relaxed),
                faulted: route.faulted.load(Ordering::Relaxed),
            })
            .collect()
    }

    pub fn category_stats(&self, category: EventCategory) -> Option<CategoryStats> {
        self.stats().into_iter().find(|stats| stats.category == category)
    }
}

/// Per-connection dispatcher. Lives exactly as long as one open session.
pub struct EventRouter {
    queues: HashMap<EventCategory, mpsc::UnboundedSender<RoutedEvent>>,
    workers: Vec<JoinHandle<()>>,
}

impl EventRouter {
    pub fn start(table: Arc<DispatchTable>, session: SessionHandle) -> Self {
        let mut queues = HashMap::new();
        let mut workers = Vec::new();
        for category in table.categories() {
            let (tx, rx) = mpsc::unbounded_channel();
            queues.insert(category, tx);
            workers.push(tokio::spawn(run_category_worker(
                category,
                Arc::clone(&table),
                session.clone(),
                rx,
            )));
        }
        Self { queues, workers }
    }

    /// Split a transport event and queue each piece. Returns how many were queued.
    pub fn route(&self, event: TransportEvent) -> usize {
        let kind = event.kind();
        let routed = event.into_routed();
        if routed.is_empty() {
            trace!(event = kind, "event carries nothing to route");
            return 0;
        }
        routed
            .into_iter()
            .map(|event| self.dispatch(event))
            .filter(|queued| *queued)
            .count()
    }

    /// Queue one event for its category worker.
    pub fn dispatch(&self, event: RoutedEvent) -> bool {
        let category = event.category();
        let Some(queue) = self.queues.get(&category) else {
            debug!(category = category.as_str(), "no handler set for category; event dropped");
            return false;
        };
        if queue.send(event).is_err() {
            warn!(category = category.as_str(), "category worker is gone; event dropped");
            return false;
        }
        true
    }

    /// Stop accepting events; workers drain their queues in the background.
    pub fn detach(self) {
        drop(self.queues);
    }

    /// Stop accepting events and wait for every queued event to be handled.
    pub async fn shutdown(self) {
        drop(self.queues);
        for worker in self.workers {
            if let Err(err) = worker.await {
                error!(error = %err, "category worker ended abnormally");
            }
        }
    }
}

async fn run_category_worker(
    category: EventCategory,
    table: Arc<DispatchTable>,
    session: SessionHandle,
    mut queue: mpsc::UnboundedReceiver<RoutedEvent>,
) {
    let Some(route) = table.routes.get(&category) else {
        return;
    };

    while let Some(event) = queue.recv().await {
        let outcome = AssertUnwindSafe(route.handler.handle(&session, &event))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {
                route.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(err)) => {
                route.faulted.fetch_add(1, Ordering::Relaxed);
                warn!(category = category.as_str(), error = %err, "event handler failed");
            }
            Err(panic) => {
                route.faulted.fetch_add(1, Ordering::Relaxed);
                error!(
                    category = category.as_str(),
                    panic = %panic_message(panic.as_ref()),
                    "event handler panicked"
                );
            }
        }
    }
    debug!(category = category.as_str(), "category worker stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Recorder;
    use courier_core::{
        CallOffer, ContactUpdate, DeliveryClass, InboundMessage, MessagePayload,
    };
    use std::sync::Mutex;

    /// Records handled message ids; fails on `fail-*` ids and panics on `panic-*` ids.
    #[derive(Default)]
    struct ScriptedHandler {
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedHandler {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().expect("seen lock").clone()
        }
    }

    #[async_trait]
    impl EventHandler for ScriptedHandler {
        async fn handle(
            &self,
            _session: &SessionHandle,
            event: &RoutedEvent,
        ) -> Result<(), CourierError> {
            let id = match event {
                RoutedEvent::MessageUpsert(message) => message.id.clone(),
                RoutedEvent::Call(call) => call.id.clone(),
                RoutedEvent::ContactUpdate(contact) => contact.id.clone(),
                other => return Err(CourierError::handler(format!("unexpected {other:?}"))),
            };
            self.seen.lock().expect("seen lock").push(id.clone());
            if id.starts_with("panic") {
                panic!("handler exploded on {id}");
            }
            if id.starts_with("fail") {
                return Err(CourierError::handler(format!("rejected {id}")));
            }
            Ok(())
        }
    }

    fn upsert(ids: &[&str]) -> TransportEvent {
        TransportEvent::MessagesUpsert {
            messages: ids
                .iter()
                .map(|id| InboundMessage {
                    id: (*id).to_owned(),
                    chat: "1@s.whatsapp.net".to_owned(),
                    sender: None,
                    from_me: false,
                    payload: MessagePayload::text("hi"),
                    timestamp: None,
                })
                .collect(),
            delivery: DeliveryClass::Notify,
        }
    }

    fn call(id: &str) -> TransportEvent {
        TransportEvent::Call(vec![CallOffer {
            id: id.to_owned(),
            from: "2@s.whatsapp.net".to_owned(),
            status: "offer".to_owned(),
        }])
    }

    fn setup(handler: &Arc<ScriptedHandler>) -> (Arc<DispatchTable>, EventRouter) {
        let table = Arc::new(
            DispatchTable::builder()
                .route(EventCategory::MessageUpsert, handler.clone())
                .route(EventCategory::Call, handler.clone())
                .build(),
        );
        let recorder = Arc::new(Recorder::default());
        let router = EventRouter::start(Arc::clone(&table), recorder.session());
        (table, router)
    }

    #[tokio::test]
    async fn preserves_order_within_a_category() {
        let handler = Arc::new(ScriptedHandler::default());
        let (_table, router) = setup(&handler);

        assert_eq!(router.route(upsert(&["m1", "m2"])), 2);
        assert_eq!(router.route(upsert(&["m3"])), 1);
        router.shutdown().await;

        assert_eq!(handler.seen(), vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn handler_errors_and_panics_do_not_stop_the_category() {
        let handler = Arc::new(ScriptedHandler::default());
        let (table, router) = setup(&handler);

        router.route(upsert(&["fail-1", "panic-2", "m3"]));
        router.route(call("c1"));
        router.shutdown().await;

        let seen = handler.seen();
        assert!(seen.contains(&"m3".to_owned()));
        assert!(seen.contains(&"c1".to_owned()));
        assert_eq!(
            table.category_stats(EventCategory::MessageUpsert),
            Some(CategoryStats {
                category: EventCategory::MessageUpsert,
                delivered: 1,
                faulted: 2,
            })
        );
        assert_eq!(
            table
                .category_stats(EventCategory::Call)
                .map(|stats| stats.delivered),
            Some(1)
        );
    }

    #[tokio::test]
    async fn unrouted_categories_and_background_upserts_are_dropped() {
        let handler = Arc::new(ScriptedHandler::default());
        let (_table, router) = setup(&handler);

        let contacts = TransportEvent::ContactsUpdate(vec![ContactUpdate {
            id: "contact-1".to_owned(),
            name: None,
            notify: None,
        }]);
        assert_eq!(router.route(contacts), 0);

        let history = match upsert(&["old"]) {
            TransportEvent::MessagesUpsert { messages, .. } => TransportEvent::MessagesUpsert {
                messages,
                delivery: DeliveryClass::History,
            },
            other => other,
        };
        assert_eq!(router.route(history), 0);
        router.shutdown().await;

        assert!(handler.seen().is_empty());
    }

    #[test]
    fn panic_message_reads_str_and_string_payloads() {
        let boxed: Box<dyn Any + Send> = Box::new("plain");
        assert_eq!(panic_message(boxed.as_ref()), "plain");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
