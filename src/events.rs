// Typed publish/subscribe hub. Every component notifies the rest of the
// application only through this bus; handlers run synchronously in
// registration order, and a panicking handler never breaks delivery to the
// others.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use log::{debug, error};

use crate::call::{CallSession, CallState};
use crate::models::{Contact, Message};

/// Closed set of events the engine publishes for the UI layer.
#[derive(Debug, Clone)]
pub enum UiEvent {
    /// The full contact list changed (order included).
    ContactsUpdated(Vec<Contact>),
    /// A single contact record changed.
    ContactUpdated(Contact),
    /// The message thread of the currently active contact changed.
    ThreadUpdated {
        contact_id: String,
        messages: Vec<Message>,
    },
    /// A contact started or stopped composing.
    TypingChanged { contact_id: String, composing: bool },
    /// The call signaling machine changed state.
    CallChanged {
        state: CallState,
        session: Option<CallSession>,
    },
    /// The transport reported an error event.
    TransportError { message: String },
}

/// Discriminant used for subscription routing. No ordering guarantee is made
/// across kinds, only within a single kind's handler list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UiEventKind {
    Contacts,
    Contact,
    Thread,
    Typing,
    Call,
    TransportError,
}

impl UiEvent {
    pub fn kind(&self) -> UiEventKind {
        match self {
            UiEvent::ContactsUpdated(_) => UiEventKind::Contacts,
            UiEvent::ContactUpdated(_) => UiEventKind::Contact,
            UiEvent::ThreadUpdated { .. } => UiEventKind::Thread,
            UiEvent::TypingChanged { .. } => UiEventKind::Typing,
            UiEvent::CallChanged { .. } => UiEventKind::Call,
            UiEvent::TransportError { .. } => UiEventKind::TransportError,
        }
    }
}

pub type EventHandler = Box<dyn Fn(&UiEvent) + Send + Sync>;

pub type SubscriptionId = usize;

struct Subscription {
    id: SubscriptionId,
    once: bool,
    handler: EventHandler,
}

/// Synchronous event bus. Owned by the client, constructed fresh per client
/// (and per test); there is no ambient global instance.
pub struct EventBus {
    next_id: SubscriptionId,
    handlers: HashMap<UiEventKind, Vec<Subscription>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            next_id: 1,
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for one event kind. Handlers fire in registration
    /// order.
    pub fn subscribe(&mut self, kind: UiEventKind, handler: EventHandler) -> SubscriptionId {
        self.add(kind, handler, false)
    }

    /// Like subscribe, but the handler is removed after its first invocation.
    pub fn once(&mut self, kind: UiEventKind, handler: EventHandler) -> SubscriptionId {
        self.add(kind, handler, true)
    }

    fn add(&mut self, kind: UiEventKind, handler: EventHandler, once: bool) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        self.handlers.entry(kind).or_default().push(Subscription {
            id,
            once,
            handler,
        });
        debug!("Registered handler {} for {:?} (once: {})", id, kind, once);
        id
    }

    /// Remove a handler by subscription id. Returns false if it was already
    /// gone.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        for subs in self.handlers.values_mut() {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            if subs.len() < before {
                debug!("Removed handler {}", id);
                return true;
            }
        }
        false
    }

    /// Invoke every handler registered for the event's kind, in registration
    /// order. A panicking handler is logged and skipped; delivery to the
    /// remaining handlers continues.
    pub fn publish(&mut self, event: &UiEvent) {
        let kind = event.kind();
        let Some(subs) = self.handlers.get(&kind) else {
            return;
        };

        let mut fired_once = Vec::new();
        for sub in subs.iter() {
            let result = catch_unwind(AssertUnwindSafe(|| (sub.handler)(event)));
            if result.is_err() {
                error!("Event handler {} panicked on {:?}; continuing", sub.id, kind);
            }
            if sub.once {
                fired_once.push(sub.id);
            }
        }

        if !fired_once.is_empty() {
            if let Some(subs) = self.handlers.get_mut(&kind) {
                subs.retain(|s| !fired_once.contains(&s.id));
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn typing_event(contact: &str) -> UiEvent {
        UiEvent::TypingChanged {
            contact_id: contact.to_string(),
            composing: true,
        }
    }

    #[test]
    fn handlers_fire_in_registration_order() {
        let mut bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            bus.subscribe(
                UiEventKind::Typing,
                Box::new(move |_| order.lock().unwrap().push(tag)),
            );
        }

        bus.publish(&typing_event("123"));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn once_handler_fires_exactly_one_time() {
        let mut bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        let count_clone = count.clone();
        bus.once(
            UiEventKind::Typing,
            Box::new(move |_| *count_clone.lock().unwrap() += 1),
        );

        bus.publish(&typing_event("123"));
        bus.publish(&typing_event("123"));
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let mut bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        let count_clone = count.clone();
        let id = bus.subscribe(
            UiEventKind::Typing,
            Box::new(move |_| *count_clone.lock().unwrap() += 1),
        );

        bus.publish(&typing_event("123"));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(&typing_event("123"));
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn panicking_handler_does_not_break_delivery() {
        let mut bus = EventBus::new();
        let reached = Arc::new(Mutex::new(false));

        bus.subscribe(UiEventKind::Typing, Box::new(|_| panic!("faulty listener")));
        let reached_clone = reached.clone();
        bus.subscribe(
            UiEventKind::Typing,
            Box::new(move |_| *reached_clone.lock().unwrap() = true),
        );

        bus.publish(&typing_event("123"));
        assert!(*reached.lock().unwrap());
    }

    #[test]
    fn events_only_reach_matching_kind() {
        let mut bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        let count_clone = count.clone();
        bus.subscribe(
            UiEventKind::Contacts,
            Box::new(move |_| *count_clone.lock().unwrap() += 1),
        );

        bus.publish(&typing_event("123"));
        assert_eq!(*count.lock().unwrap(), 0);
    }
}
