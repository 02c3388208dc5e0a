//! The nexus: the observer bus connecting a stream transport to the
//! session(s) multiplexed over it.
//!
//! The transport publishes events as they happen (new data, connection
//! state changes, errors); sessions subscribe to the nexus(es) their
//! connections are assigned to.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::CoreError;
use crate::header::TlvFrame;
use crate::id::SessionId;

/// Events a transport publishes to its subscribed sessions.
#[derive(Debug)]
pub enum NexusEvent {
    NewConnection { connection_index: usize },
    Established { connection_index: usize },
    NewMessage { connection_index: usize, frame: TlvFrame },
    AssignInBuf { connection_index: usize, size_hint: usize },
    Disconnected { connection_index: usize },
    Reconnected { connection_index: usize },
    Closed { connection_index: usize },
    MessageError { connection_index: usize, status: i32 },
    Error { connection_index: Option<usize>, error: CoreError },
}

/// A session-side subscriber.
pub trait NexusObserver {
    fn on_nexus_event(&self, event: &NexusEvent);
}

/// The publish/subscribe registry itself: one per transport.
#[derive(Default)]
pub struct Nexus {
    observers: RefCell<HashMap<SessionId, Rc<dyn NexusObserver>>>,
}

impl Nexus {
    pub fn new() -> Self {
        Self { observers: RefCell::new(HashMap::new()) }
    }

    pub fn subscribe(&self, session_id: SessionId, observer: Rc<dyn NexusObserver>) {
        self.observers.borrow_mut().insert(session_id, observer);
    }

    pub fn unsubscribe(&self, session_id: SessionId) {
        self.observers.borrow_mut().remove(&session_id);
    }

    pub fn is_subscribed(&self, session_id: SessionId) -> bool {
        self.observers.borrow().contains_key(&session_id)
    }

    /// Deliver `event` to a single subscribed session. No-op if no session
    /// with this id is subscribed (e.g. it already tore down).
    pub fn publish(&self, session_id: SessionId, event: NexusEvent) {
        if let Some(observer) = self.observers.borrow().get(&session_id) {
            observer.on_nexus_event(&event);
        }
    }

    /// Deliver an error or a transport-wide event to every subscriber, used
    /// for conditions not scoped to a single session (e.g. the transport
    /// itself failed to allocate a socket).
    pub fn broadcast(&self, event: NexusEvent) {
        for observer in self.observers.borrow().values() {
            observer.on_nexus_event(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.observers.borrow().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::SessionError;
    use std::cell::RefCell as StdRefCell;

    struct RecordingObserver {
        seen: StdRefCell<Vec<String>>,
    }

    impl NexusObserver for RecordingObserver {
        fn on_nexus_event(&self, event: &NexusEvent) {
            self.seen.borrow_mut().push(format!("{event:?}"));
        }
    }

    #[test]
    fn publish_reaches_only_the_subscribed_session() {
        let nexus = Nexus::new();
        let a = Rc::new(RecordingObserver { seen: StdRefCell::new(Vec::new()) });
        let b = Rc::new(RecordingObserver { seen: StdRefCell::new(Vec::new()) });
        nexus.subscribe(1, a.clone());
        nexus.subscribe(2, b.clone());

        nexus.publish(1, NexusEvent::Established { connection_index: 0 });

        assert_eq!(a.seen.borrow().len(), 1);
        assert!(b.seen.borrow().is_empty());
    }

    #[test]
    fn publish_to_unknown_session_is_a_no_op() {
        let nexus = Nexus::new();
        nexus.publish(99, NexusEvent::Closed { connection_index: 0 });
    }

    #[test]
    fn unsubscribe_stops_future_delivery() {
        let nexus = Nexus::new();
        let observer = Rc::new(RecordingObserver { seen: StdRefCell::new(Vec::new()) });
        nexus.subscribe(1, observer.clone());
        nexus.unsubscribe(1);

        nexus.publish(1, NexusEvent::Disconnected { connection_index: 0 });
        assert!(observer.seen.borrow().is_empty());
        assert!(!nexus.is_subscribed(1));
    }

    #[test]
    fn broadcast_reaches_every_subscriber() {
        let nexus = Nexus::new();
        let a = Rc::new(RecordingObserver { seen: StdRefCell::new(Vec::new()) });
        let b = Rc::new(RecordingObserver { seen: StdRefCell::new(Vec::new()) });
        nexus.subscribe(1, a.clone());
        nexus.subscribe(2, b.clone());

        nexus.broadcast(NexusEvent::Error { connection_index: None, error: CoreError::Session(SessionError::Busy) });

        assert_eq!(a.seen.borrow().len(), 1);
        assert_eq!(b.seen.borrow().len(), 1);
        assert_eq!(nexus.subscriber_count(), 2);
    }
}
