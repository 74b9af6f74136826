//! Event subscription: a simple, synchronous, same-thread publish interface
//! (`spec.md` §1 "Event subscription ... treat as a simple publish
//! interface", §4.7, §9).
use std::sync::{Arc, Mutex};

/// Events a [`crate::working_copy::WorkingFeatureCollection`] publishes on
/// successful mutation (`spec.md` §4.7).
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureEvent {
    Added { eid: String },
    Deleted { eid: String },
    Updated { eid: String },
}

impl FeatureEvent {
    pub fn eid(&self) -> &str {
        match self {
            FeatureEvent::Added { eid } | FeatureEvent::Deleted { eid } | FeatureEvent::Updated { eid } => eid,
        }
    }
}

type Listener = Box<dyn Fn(&FeatureEvent) + Send + Sync>;

/// Idempotent subscribe/unsubscribe, synchronous same-thread delivery, no
/// ordering guarantee across distinct event names (`spec.md` §9).
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_id: Mutex<u64>,
}

/// A handle returned by [`EventBus::subscribe`]; unsubscribing twice is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription(u64);

impl EventBus {
    pub fn new() -> EventBus {
        EventBus::default()
    }

    pub fn subscribe(self: &Arc<Self>, listener: impl Fn(&FeatureEvent) + Send + Sync + 'static) -> Subscription {
        let mut next_id = self.next_id.lock().unwrap();
        let id = *next_id;
        *next_id += 1;
        self.listeners.lock().unwrap().push((id, Box::new(listener)));
        Subscription(id)
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.listeners.lock().unwrap().retain(|(id, _)| *id != subscription.0);
    }

    /// Emitting to a bus with no listeners is a no-op (`spec.md` §4.7).
    pub fn publish(&self, event: FeatureEvent) {
        for (_, listener) in self.listeners.lock().unwrap().iter() {
            listener(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn publish_with_no_listeners_is_a_no_op() {
        let bus = EventBus::new();
        bus.publish(FeatureEvent::Added { eid: "x".into() });
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let sub = bus.subscribe(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(FeatureEvent::Added { eid: "a".into() });
        bus.unsubscribe(sub);
        bus.unsubscribe(sub);
        bus.publish(FeatureEvent::Added { eid: "b".into() });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
