//! Peer-list subscriptions.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::protocol::State;

/// Receives the reconciled member list after every change.
pub type PeersCallback = Arc<dyn Fn(&[State]) + Send + Sync>;

/// Removes one registration. Dropping it without calling
/// [`Unsubscribe::unsubscribe`] keeps the registration alive.
#[must_use = "call .unsubscribe() to remove the registration"]
pub struct Unsubscribe(Option<Box<dyn FnOnce() + Send>>);

impl Unsubscribe {
    pub(crate) fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    pub fn unsubscribe(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Unsubscribe")
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    callbacks: Vec<(u64, PeersCallback)>,
}

/// Subscriber list for member-list changes of one channel.
///
/// Callbacks fire in registration order. A new subscriber does not get a
/// replay of the current list; its first call is the next change.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: impl Fn(&[State]) + Send + Sync + 'static) -> Unsubscribe {
        let id = {
            let mut registry = self.inner.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.callbacks.push((id, Arc::new(callback)));
            id
        };

        let weak = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().callbacks.retain(|(cb_id, _)| *cb_id != id);
            }
        })
    }

    /// Deliver `members` to every subscriber.
    ///
    /// The lock is released before any callback runs, so callbacks may
    /// subscribe or unsubscribe.
    pub fn trigger(&self, members: &[State]) {
        let callbacks: Vec<PeersCallback> = self
            .inner
            .lock()
            .callbacks
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(members);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_trigger_in_registration_order() {
        let registry = PeerRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            let _ = registry.subscribe(move |_| order.lock().push(tag));
        }

        registry.trigger(&[]);
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_trigger_passes_members() {
        let registry = PeerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _ = registry.subscribe(move |members| {
            sink.lock().extend(members.iter().filter_map(State::id));
        });

        registry.trigger(&[State::new("p2"), State::new("p3")]);
        assert_eq!(*seen.lock(), vec!["p2".to_string(), "p3".to_string()]);
    }

    #[test]
    fn test_unsubscribe_removes_exact_registration() {
        let registry = PeerRegistry::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));

        let a2 = a.clone();
        let unsub_a = registry.subscribe(move |_| {
            a2.fetch_add(1, Ordering::SeqCst);
        });
        let b2 = b.clone();
        let _keep_b = registry.subscribe(move |_| {
            b2.fetch_add(1, Ordering::SeqCst);
        });

        registry.trigger(&[]);
        unsub_a.unsubscribe();
        registry.trigger(&[]);

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_callback_may_subscribe_during_trigger() {
        let registry = PeerRegistry::new();
        let inner = registry.clone();
        let _ = registry.subscribe(move |_| {
            let _ = inner.subscribe(|_| {});
        });

        registry.trigger(&[]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unsubscribe_after_registry_dropped() {
        let registry = PeerRegistry::new();
        let unsub = registry.subscribe(|_| {});
        drop(registry);
        unsub.unsubscribe();
    }
}
