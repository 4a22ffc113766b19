//! Listener registries and subscription guards

use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Shared listener callback.
pub(crate) type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

struct ListenerSet<T> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

/// Registered callbacks for one kind of notification.
pub(crate) struct Listeners<T> {
    set: Arc<Mutex<ListenerSet<T>>>,
}

impl<T: Clone + 'static> Listeners<T> {
    pub(crate) fn new() -> Self {
        Self {
            set: Arc::new(Mutex::new(ListenerSet {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ListenerSet<T>> {
        self.set.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn add(&self, callback: Callback<T>) -> Subscription {
        let id = {
            let mut set = self.lock();
            let id = set.next_id;
            set.next_id += 1;
            set.entries.push((id, callback));
            id
        };
        let weak: Weak<Mutex<ListenerSet<T>>> = Arc::downgrade(&self.set);
        Subscription::new(move || {
            if let Some(set) = weak.upgrade() {
                let mut set = set.lock().unwrap_or_else(|e| e.into_inner());
                set.entries.retain(|(entry, _)| *entry != id);
            }
        })
    }

    /// Call every listener with `value`. Listeners run outside the registry
    /// lock, so they may subscribe or unsubscribe.
    pub(crate) fn notify(&self, value: T) {
        let callbacks: Vec<Callback<T>> = self
            .lock()
            .entries
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(value.clone());
        }
    }

    pub(crate) fn clear(&self) {
        self.lock().entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().entries.len()
    }
}

/// Keeps a listener attached. Dropping it (or calling
/// [`Subscription::unsubscribe`]) detaches the listener, including every
/// registration it made on parent managers.
#[must_use = "dropping a Subscription detaches the listener immediately"]
pub struct Subscription {
    detach: Vec<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(detach: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            detach: vec![Box::new(detach)],
        }
    }

    /// Fold `other` into this guard so both detach together.
    pub(crate) fn join(mut self, mut other: Subscription) -> Self {
        self.detach.append(&mut other.detach);
        self
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for detach in self.detach.drain(..) {
            detach();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("registrations", &self.detach.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_notify_and_detach() {
        let listeners = Listeners::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let sub = listeners.add(Arc::new(move |v: u32| {
            counter.fetch_add(v as usize, Ordering::SeqCst);
        }));
        listeners.notify(2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        sub.unsubscribe();
        assert_eq!(listeners.len(), 0);
        listeners.notify(5);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_joined_subscription_detaches_all() {
        let a = Listeners::<()>::new();
        let b = Listeners::<()>::new();
        let sub = a.add(Arc::new(|_: ()| {})).join(b.add(Arc::new(|_: ()| {})));
        assert_eq!((a.len(), b.len()), (1, 1));
        drop(sub);
        assert_eq!((a.len(), b.len()), (0, 0));
    }

    #[test]
    fn test_listener_may_unsubscribe_during_notify() {
        let listeners = Arc::new(Listeners::<()>::new());
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let inner_slot = slot.clone();
        let sub = listeners.add(Arc::new(move |_: ()| {
            inner_slot.lock().unwrap().take();
        }));
        *slot.lock().unwrap() = Some(sub);
        listeners.notify(());
        assert_eq!(listeners.len(), 0);
    }

    #[test]
    fn test_subscription_outliving_registry() {
        let listeners = Listeners::<()>::new();
        let sub = listeners.add(Arc::new(|_: ()| {}));
        drop(listeners);
        drop(sub);
    }
}
