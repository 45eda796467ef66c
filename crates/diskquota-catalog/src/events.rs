//! Storage-event subscription hub.
//!
//! The host's storage manager announces file lifecycle events here; the
//! host's DDL machinery announces object creation. Listeners are chained
//! in registration order and must never fail: dropping an event is
//! acceptable, corrupting the caller is not.

use diskquota_common::{Oid, RelFileNodeBackend};
use parking_lot::RwLock;
use std::sync::Arc;

/// Object class of a post-create announcement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectClass {
    Relation,
    Other,
}

/// Phase of an object-access announcement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessPhase {
    PostCreate,
    Drop,
}

/// Subscriber interface for storage and object events. All methods default
/// to no-ops so a listener only implements what it watches.
#[allow(unused_variables)]
pub trait StorageEventListener: Send + Sync {
    fn on_create(&self, rnode: &RelFileNodeBackend) {}
    fn on_extend(&self, rnode: &RelFileNodeBackend) {}
    fn on_truncate(&self, rnode: &RelFileNodeBackend) {}
    fn on_unlink(&self, rnode: &RelFileNodeBackend) {}
    fn on_object_access(&self, phase: AccessPhase, class: ObjectClass, oid: Oid, sub_id: u32) {}
}

/// Fan-out point for storage events. The host owns one hub per node.
#[derive(Default)]
pub struct StorageEventHub {
    listeners: RwLock<Vec<Arc<dyn StorageEventListener>>>,
}

impl StorageEventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn StorageEventListener>) {
        self.listeners.write().push(listener);
    }

    fn each(&self, f: impl Fn(&Arc<dyn StorageEventListener>)) {
        let listeners = self.listeners.read();
        for listener in listeners.iter() {
            f(listener);
        }
    }

    pub fn fire_create(&self, rnode: &RelFileNodeBackend) {
        self.each(|l| l.on_create(rnode));
    }

    pub fn fire_extend(&self, rnode: &RelFileNodeBackend) {
        self.each(|l| l.on_extend(rnode));
    }

    pub fn fire_truncate(&self, rnode: &RelFileNodeBackend) {
        self.each(|l| l.on_truncate(rnode));
    }

    pub fn fire_unlink(&self, rnode: &RelFileNodeBackend) {
        self.each(|l| l.on_unlink(rnode));
    }

    pub fn fire_object_access(
        &self,
        phase: AccessPhase,
        class: ObjectClass,
        oid: Oid,
        sub_id: u32,
    ) {
        self.each(|l| l.on_object_access(phase, class, oid, sub_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diskquota_common::RelFileNode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        extends: AtomicUsize,
        creates: AtomicUsize,
    }

    impl StorageEventListener for Counter {
        fn on_create(&self, _rnode: &RelFileNodeBackend) {
            self.creates.fetch_add(1, Ordering::Relaxed);
        }
        fn on_extend(&self, _rnode: &RelFileNodeBackend) {
            self.extends.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn all_registered_listeners_fire() {
        let hub = StorageEventHub::new();
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        hub.register(a.clone());
        hub.register(b.clone());

        let rnode = RelFileNodeBackend::permanent(RelFileNode::new(1, 1663, 16400));
        hub.fire_extend(&rnode);
        hub.fire_extend(&rnode);
        hub.fire_create(&rnode);

        assert_eq!(a.extends.load(Ordering::Relaxed), 2);
        assert_eq!(b.extends.load(Ordering::Relaxed), 2);
        assert_eq!(b.creates.load(Ordering::Relaxed), 1);
    }
}
