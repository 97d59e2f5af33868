//! Event listener registry.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cube_core::{CodeSource, Compartment, Device, LockEvent};
use parking_lot::Mutex;
use tracing::error;

/// Kinds of events a listener can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Open,
    Close,
    Lock,
    Code,
    Compartments,
    Devices,
}

/// An event delivered to listeners.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// Connection to the relay established.
    Open,
    /// Connection to the relay lost.
    Close,
    Lock(LockEvent),
    Code { code: String, source: CodeSource },
    Compartments(Vec<Compartment>),
    Devices(Vec<Device>),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Open => EventKind::Open,
            Self::Close => EventKind::Close,
            Self::Lock(_) => EventKind::Lock,
            Self::Code { .. } => EventKind::Code,
            Self::Compartments(_) => EventKind::Compartments,
            Self::Devices(_) => EventKind::Devices,
        }
    }
}

/// Identifies one registration, so the same callback registered twice can
/// be removed once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Ordered listener lists, one per [`EventKind`].
#[derive(Default)]
pub struct Listeners {
    next_id: AtomicU64,
    by_kind: Mutex<HashMap<EventKind, Vec<(ListenerId, Listener)>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, kind: EventKind, listener: impl Fn(&Event) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.by_kind
            .lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove exactly the registration `id`. Returns whether it was present.
    pub fn remove(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut by_kind = self.by_kind.lock();
        let Some(list) = by_kind.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        list.len() != before
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.by_kind.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Call every listener for the event's kind in registration order.
    ///
    /// Listeners run outside the registry lock, so they may add or remove
    /// listeners; changes apply from the next dispatch. A panicking listener
    /// is logged and the remaining listeners still run.
    pub fn dispatch(&self, event: &Event) -> usize {
        let kind = event.kind();
        let snapshot: Vec<Listener> = match self.by_kind.lock().get(&kind) {
            Some(list) => list.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return 0,
        };
        for listener in &snapshot {
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(event = ?kind, "error in event listener");
            }
        }
        snapshot.len()
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let by_kind = self.by_kind.lock();
        let counts: HashMap<_, _> = by_kind.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("Listeners").field("counts", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cube_core::LockStatus;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> impl Fn(&Event) + Send + Sync {
        let log = Arc::clone(log);
        move |_| log.lock().push(tag.to_string())
    }

    #[test]
    fn dispatch_in_registration_order() {
        let listeners = Listeners::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _ = listeners.add(EventKind::Open, recorder(&log, "first"));
        let _ = listeners.add(EventKind::Open, recorder(&log, "second"));
        let _ = listeners.add(EventKind::Close, recorder(&log, "close"));

        assert_eq!(listeners.dispatch(&Event::Open), 2);
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[test]
    fn remove_by_identity() {
        let listeners = Listeners::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = listeners.add(EventKind::Lock, recorder(&log, "same"));
        let _b = listeners.add(EventKind::Lock, recorder(&log, "same"));

        assert!(listeners.remove(EventKind::Lock, a));
        assert!(!listeners.remove(EventKind::Lock, a));
        assert!(!listeners.remove(EventKind::Code, a));
        assert_eq!(listeners.count(EventKind::Lock), 1);

        let _ = listeners.dispatch(&Event::Lock(LockEvent::new("L1", LockStatus::Open)));
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn panicking_listener_does_not_stop_others() {
        let listeners = Listeners::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _ = listeners.add(EventKind::Close, |_| panic!("listener failure"));
        let _ = listeners.add(EventKind::Close, recorder(&log, "after"));

        assert_eq!(listeners.dispatch(&Event::Close), 2);
        assert_eq!(*log.lock(), vec!["after"]);
    }

    #[test]
    fn listener_may_register_during_dispatch() {
        let listeners = Arc::new(Listeners::new());
        let inner = Arc::clone(&listeners);
        let _ = listeners.add(EventKind::Open, move |_| {
            let _ = inner.add(EventKind::Open, |_| {});
        });
        assert_eq!(listeners.dispatch(&Event::Open), 1);
        assert_eq!(listeners.count(EventKind::Open), 2);
    }

    #[test]
    fn event_kinds() {
        assert_eq!(Event::Devices(vec![]).kind(), EventKind::Devices);
        assert_eq!(
            Event::Code {
                code: "1".into(),
                source: CodeSource::Scanner
            }
            .kind(),
            EventKind::Code
        );
    }
}
