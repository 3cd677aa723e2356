use std::fmt;
use std::sync::Arc;

use super::event::{EventKind, RemoteEvent};

/// A subscriber to transport events. Identity is the `Arc` allocation, so
/// keep a clone of it to unsubscribe later.
pub type EventHandler = Arc<dyn Fn(&RemoteEvent) + Send + Sync>;

/// Wrap a closure as an [`EventHandler`].
pub fn event_handler(f: impl Fn(&RemoteEvent) + Send + Sync + 'static) -> EventHandler {
    Arc::new(f)
}

/// Which registrations [`EventBus::off`] removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveMode {
    First,
    All,
}

/// Typed publish/subscribe surface for transport events.
#[derive(Default)]
pub struct EventBus {
    /// Registrations in registration order.
    handlers: Vec<(EventKind, EventHandler)>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for one event category. The same handler may be
    /// registered more than once.
    pub fn on(&mut self, kind: EventKind, handler: EventHandler) {
        self.handlers.push((kind, handler));
    }

    /// Remove registrations of `handler` across all categories.
    /// Returns how many were removed.
    pub fn off(&mut self, handler: &EventHandler, mode: RemoveMode) -> usize {
        match mode {
            RemoveMode::First => {
                let Some(index) = self
                    .handlers
                    .iter()
                    .position(|(_, h)| Arc::ptr_eq(h, handler))
                else {
                    return 0;
                };
                self.handlers.remove(index);
                1
            }
            RemoveMode::All => {
                let before = self.handlers.len();
                self.handlers.retain(|(_, h)| !Arc::ptr_eq(h, handler));
                before - self.handlers.len()
            }
        }
    }

    pub fn emit(&self, event: &RemoteEvent) {
        let kind = event.kind();
        for (_, handler) in self.handlers.iter().filter(|(k, _)| *k == kind) {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(tag: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> EventHandler {
        let log = log.clone();
        event_handler(move |_| log.lock().unwrap().push(tag))
    }

    #[test]
    fn test_emit_in_registration_order_and_by_kind() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        bus.on(EventKind::Connected, recorder("a", &log));
        bus.on(EventKind::Disconnected, recorder("other", &log));
        bus.on(EventKind::Connected, recorder("b", &log));

        bus.emit(&RemoteEvent::Connected);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_off_first_removes_one_registration() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = recorder("h", &log);
        let mut bus = EventBus::new();
        bus.on(EventKind::Connected, handler.clone());
        bus.on(EventKind::Connected, handler.clone());

        assert_eq!(bus.off(&handler, RemoveMode::First), 1);
        bus.emit(&RemoteEvent::Connected);
        assert_eq!(*log.lock().unwrap(), vec!["h"]);
    }

    #[test]
    fn test_off_all_removes_every_registration() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = recorder("h", &log);
        let keep = recorder("keep", &log);
        let mut bus = EventBus::new();
        bus.on(EventKind::Connected, handler.clone());
        bus.on(EventKind::Ready, handler.clone());
        bus.on(EventKind::Connected, keep);

        assert_eq!(bus.off(&handler, RemoveMode::All), 2);
        assert_eq!(bus.off(&handler, RemoveMode::All), 0);
        assert_eq!(bus.len(), 1);
        bus.emit(&RemoteEvent::Connected);
        assert_eq!(*log.lock().unwrap(), vec!["keep"]);
    }
}
