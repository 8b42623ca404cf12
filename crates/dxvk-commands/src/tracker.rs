use std::{any::Any, sync::Arc};

use ahash::AHashMap;
use dxvk::sync::Signal;

use crate::Access;

///Keeps resources alive until the command list that uses them completed.
///
/// Resources are identified by the address of their allocation. Tracking the same resource twice merges the access
/// classes, so the tracker holds exactly one strong reference per resource.
#[derive(Default)]
pub struct ResourceTracker {
    entries: AHashMap<usize, (Access, Arc<dyn Any + Send + Sync>)>,
}

impl ResourceTracker {
    ///Tracks `resource` with `access`. Returns true if the resource was not tracked before.
    pub fn track<T: Any + Send + Sync>(&mut self, resource: &Arc<T>, access: Access) -> bool {
        let key = Arc::as_ptr(resource) as *const () as usize;
        match self.entries.get_mut(&key) {
            Some((existing, _)) => {
                *existing |= access;
                false
            }
            None => {
                self.entries.insert(key, (access, resource.clone()));
                true
            }
        }
    }

    ///Access classes `resource` was tracked with, if it is tracked at all.
    pub fn access<T: Any + Send + Sync>(&self, resource: &Arc<T>) -> Option<Access> {
        let key = Arc::as_ptr(resource) as *const () as usize;
        self.entries.get(&key).map(|(access, _)| *access)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    ///Drops every tracked reference.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl std::fmt::Debug for ResourceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceTracker")
            .field("resources", &self.entries.len())
            .finish()
    }
}

///Host signals that fire once the command list completed.
#[derive(Default)]
pub struct SignalTracker {
    signals: Vec<(Arc<dyn Signal>, u64)>,
}

impl SignalTracker {
    pub fn add(&mut self, signal: Arc<dyn Signal>, value: u64) {
        self.signals.push((signal, value));
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    ///Fires and removes all signals, in the order they were added.
    pub fn notify(&mut self) {
        for (signal, value) in self.signals.drain(..) {
            signal.signal(value);
        }
    }

    ///Removes all signals without firing them.
    pub fn reset(&mut self) {
        self.signals.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    struct Counter(AtomicU64);

    impl Signal for Counter {
        fn signal(&self, value: u64) {
            self.0.fetch_max(value, Ordering::SeqCst);
        }
    }

    #[test]
    fn tracking_deduplicates() {
        let resource = Arc::new(5u32);
        let mut tracker = ResourceTracker::default();
        assert!(tracker.track(&resource, Access::READ));
        assert!(!tracker.track(&resource, Access::WRITE));
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.access(&resource), Some(Access::READ | Access::WRITE));
        assert_eq!(Arc::strong_count(&resource), 2);

        tracker.clear();
        assert_eq!(Arc::strong_count(&resource), 1);
    }

    #[test]
    fn signals_fire_once() {
        let counter = Arc::new(Counter(AtomicU64::new(0)));
        let mut signals = SignalTracker::default();
        signals.add(counter.clone(), 3);
        signals.add(counter.clone(), 7);
        signals.notify();
        assert_eq!(counter.0.load(Ordering::SeqCst), 7);
        assert!(signals.is_empty());
    }
}
