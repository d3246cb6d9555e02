use std::collections::BTreeMap;
use std::rc::Rc;

/// Handle returned by every `subscribe`/`on_*` registration; pass it back to
/// the matching unsubscribe call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

/// Explicit replacement for reactive signal subscribers: a set of callbacks
/// invoked in registration order.
///
/// Callers take a [`snapshot`](Observers::snapshot) while borrowing their
/// state and invoke it after the borrow is released, so a callback may freely
/// re-enter the component that notified it.
pub(crate) struct Observers<T: ?Sized> {
    next_id: u64,
    handlers: BTreeMap<ObserverId, Rc<dyn Fn(&T)>>,
}

impl<T: ?Sized> Observers<T> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 0,
            handlers: BTreeMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, handler: Rc<dyn Fn(&T)>) -> ObserverId {
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        self.handlers.insert(id, handler);
        id
    }

    pub(crate) fn remove(&mut self, id: ObserverId) -> bool {
        self.handlers.remove(&id).is_some()
    }

    pub(crate) fn snapshot(&self) -> Snapshot<T> {
        Snapshot(self.handlers.values().cloned().collect())
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }

    pub(crate) fn clear(&mut self) {
        self.handlers.clear();
    }
}

impl<T: ?Sized> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Callbacks captured from an [`Observers`] set, detached from its owner.
pub(crate) struct Snapshot<T: ?Sized>(Vec<Rc<dyn Fn(&T)>>);

impl<T: ?Sized> Snapshot<T> {
    pub(crate) fn notify(&self, value: &T) {
        for handler in &self.0 {
            handler(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn handlers_run_in_registration_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut observers: Observers<u32> = Observers::new();

        for tag in ["a", "b"] {
            let log = log.clone();
            observers.insert(Rc::new(move |value: &u32| log.borrow_mut().push(format!("{}{}", tag, value))));
        }

        observers.snapshot().notify(&1);
        assert_eq!(*log.borrow(), vec!["a1", "b1"]);
    }

    #[test]
    fn removed_handler_is_not_called() {
        let hits = Rc::new(RefCell::new(0));
        let mut observers: Observers<()> = Observers::new();
        let id = {
            let hits = hits.clone();
            observers.insert(Rc::new(move |_: &()| *hits.borrow_mut() += 1))
        };

        assert!(observers.remove(id));
        assert!(!observers.remove(id));
        observers.snapshot().notify(&());

        assert_eq!(*hits.borrow(), 0);
        assert_eq!(observers.len(), 0);
    }
}
