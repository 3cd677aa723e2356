use std::fmt;

/// A callback registered on an entity.
pub type Listener<E> = Box<dyn FnMut(&E) + Send>;

/// Append-only listener registry owned by a single entity.
///
/// Delivery is synchronous and in registration order. Listeners only see the
/// event, never the entity graph: the graph is mid-mutation while they run.
pub struct Listeners<E> {
    callbacks: Vec<Listener<E>>,
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self {
            callbacks: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, callback: impl FnMut(&E) + Send + 'static) {
        self.callbacks.push(Box::new(callback));
    }

    pub fn emit(&mut self, event: &E) {
        for callback in &mut self.callbacks {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.callbacks.len())
            .finish()
    }
}

/// Store `value` in `slot`. Returns the previous value only if it differed,
/// so callers fire change events exactly when something changed.
pub fn replace_if_changed<T: PartialEq>(slot: &mut T, value: T) -> Option<T> {
    if *slot == value {
        None
    } else {
        Some(std::mem::replace(slot, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_emit_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut listeners = Listeners::<u32>::new();

        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            listeners.subscribe(move |v| seen.lock().unwrap().push(format!("{tag}:{v}")));
        }

        listeners.emit(&7);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:7", "second:7", "third:7"]
        );
        assert_eq!(listeners.len(), 3);
    }

    #[test]
    fn test_emit_without_listeners_is_noop() {
        let mut listeners = Listeners::<String>::default();
        assert!(listeners.is_empty());
        listeners.emit(&"nothing".to_string());
    }

    #[test]
    fn test_replace_if_changed() {
        let mut name = String::from("Lobby");
        assert_eq!(replace_if_changed(&mut name, "Lobby".into()), None);
        assert_eq!(
            replace_if_changed(&mut name, "AFK".into()),
            Some("Lobby".to_string())
        );
        assert_eq!(name, "AFK");
    }
}
