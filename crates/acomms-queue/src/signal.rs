//! Registration lists for notifications

use std::fmt;

/// Handle returned by [`Signal::connect`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u64);

type Slot<E, R> = Box<dyn FnMut(&E) -> R + Send>;

/// Ordered list of handlers invoked with an event
///
/// Handlers run in registration order. Each one may return a value; `emit`
/// collects them in the same order.
pub struct Signal<E, R = ()> {
    slots: Vec<(SlotId, Slot<E, R>)>,
    next_id: u64,
}

impl<E, R> Signal<E, R> {
    pub fn new() -> Self {
        Signal {
            slots: Vec::new(),
            next_id: 0,
        }
    }

    /// Register a handler
    pub fn connect<F>(&mut self, handler: F) -> SlotId
    where
        F: FnMut(&E) -> R + Send + 'static,
    {
        let id = SlotId(self.next_id);
        self.next_id += 1;
        self.slots.push((id, Box::new(handler)));
        id
    }

    /// Remove a handler; returns false if it was not registered
    pub fn disconnect(&mut self, id: SlotId) -> bool {
        let before = self.slots.len();
        self.slots.retain(|(slot, _)| *slot != id);
        self.slots.len() != before
    }

    pub fn emit(&mut self, event: &E) -> Vec<R> {
        self.slots
            .iter_mut()
            .map(|(_, handler)| handler(event))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<E, R> Default for Signal<E, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E, R> fmt::Debug for Signal<E, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("slots", &self.slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_emit_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut signal: Signal<u32> = Signal::new();

        for tag in ["first", "second"] {
            let seen = seen.clone();
            signal.connect(move |value: &u32| seen.lock().unwrap().push((tag, *value)));
        }

        signal.emit(&7);
        assert_eq!(*seen.lock().unwrap(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn test_collect_return_values() {
        let mut signal: Signal<u32, Option<u32>> = Signal::new();
        signal.connect(|value: &u32| Some(value * 2));
        signal.connect(|_: &u32| None);

        assert_eq!(signal.emit(&4), vec![Some(8), None]);
    }

    #[test]
    fn test_disconnect() {
        let mut signal: Signal<()> = Signal::new();
        let a = signal.connect(|_| ());
        let b = signal.connect(|_| ());
        assert_ne!(a, b);
        assert_eq!(signal.len(), 2);

        assert!(signal.disconnect(a));
        assert!(!signal.disconnect(a));
        assert_eq!(signal.len(), 1);

        assert_eq!(signal.emit(&()).len(), 1);

        signal.disconnect(b);
        assert!(signal.is_empty());
        assert!(signal.emit(&()).is_empty());
    }

    #[test]
    fn test_stateful_handler() {
        let mut signal: Signal<u32, u32> = Signal::new();
        let mut total = 0;
        signal.connect(move |value: &u32| {
            total += value;
            total
        });

        signal.emit(&2);
        assert_eq!(signal.emit(&3), vec![5]);
    }
}
