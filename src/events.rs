//! Optional lifecycle callback slots.

use std::sync::Arc;

use parking_lot::RwLock;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A replaceable callback. Emitting with no callback set does nothing.
pub struct EventSlot<T: ?Sized> {
    callback: RwLock<Option<Callback<T>>>,
}

impl<T: ?Sized> EventSlot<T> {
    /// An empty slot.
    pub fn new() -> Self {
        Self { callback: RwLock::new(None) }
    }

    /// Installs `callback`, replacing any previous one.
    pub fn set(&self, callback: impl Fn(&T) + Send + Sync + 'static) {
        *self.callback.write() = Some(Arc::new(callback));
    }

    /// Removes the callback.
    pub fn clear(&self) {
        *self.callback.write() = None;
    }

    /// A callback is installed.
    pub fn is_set(&self) -> bool {
        self.callback.read().is_some()
    }

    /// Invokes the callback, if any. The slot is not locked while it runs.
    pub fn emit(&self, value: &T) {
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(value);
        }
    }
}

impl<T: ?Sized> Default for EventSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emits_only_when_set() {
        let slot: EventSlot<usize> = EventSlot::new();
        slot.emit(&1);

        let total = Arc::new(AtomicUsize::new(0));
        let seen = total.clone();
        slot.set(move |v| {
            seen.fetch_add(*v, Ordering::SeqCst);
        });
        slot.emit(&2);
        slot.emit(&3);
        assert_eq!(total.load(Ordering::SeqCst), 5);

        slot.clear();
        slot.emit(&10);
        assert_eq!(total.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn callback_may_replace_itself() {
        let slot = Arc::new(EventSlot::<()>::new());
        let inner = slot.clone();
        slot.set(move |_| inner.clear());
        slot.emit(&());
        assert!(!slot.is_set());
    }
}
