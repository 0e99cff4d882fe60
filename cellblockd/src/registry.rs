//! The set of live instances, guarded by one process-wide mutex.
//!
//! Every reader and writer of an instance record or its ring buffer goes
//! through [`Registry::lock`]. Callers keep the critical section to registry
//! mutation only: socket writes and external scripts run after the guard is
//! dropped.

use std::sync::{Mutex, MutexGuard, PoisonError};

use cellblock_common::protocol::InstanceEntry;

use crate::instance::{id_matches, Instance};

#[derive(Default)]
pub struct Instances {
    entries: Vec<Instance>,
}

impl Instances {
    pub fn insert(&mut self, instance: Instance) {
        self.entries.push(instance);
    }

    /// First instance whose id matches `query` (see [`id_matches`]).
    pub fn find(&self, query: &str) -> Option<&Instance> {
        self.entries.iter().find(|inst| id_matches(&inst.id, query))
    }

    pub fn find_mut(&mut self, query: &str) -> Option<&mut Instance> {
        self.entries.iter_mut().find(|inst| id_matches(&inst.id, query))
    }

    /// Exact lookup by full id.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Instance> {
        self.entries.iter_mut().find(|inst| inst.id == id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Instance> {
        let pos = self.entries.iter().position(|inst| inst.id == id)?;
        Some(self.entries.remove(pos))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instance> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct Registry {
    instances: Mutex<Instances>,
    tty_buffer_size: usize,
}

impl Registry {
    pub fn new(tty_buffer_size: usize) -> Self {
        Self {
            instances: Mutex::new(Instances::default()),
            tty_buffer_size,
        }
    }

    /// A panic while holding the lock leaves the list structurally intact,
    /// so poisoning is ignored.
    pub fn lock(&self) -> MutexGuard<'_, Instances> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn tty_buffer_size(&self) -> usize {
        self.tty_buffer_size
    }

    pub fn register(&self, instance: Instance) {
        self.lock().insert(instance);
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn contains(&self, query: &str) -> bool {
        self.lock().find(query).is_some()
    }

    /// Point-in-time listing of at most `max` instances.
    pub fn snapshot(&self, max: usize) -> Vec<InstanceEntry> {
        self.lock().iter().take(max).map(Instance::entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::tests::fake_instance;
    use cellblock_common::protocol::InstanceKind;

    fn id(prefix: &str) -> String {
        format!("{:0<64}", prefix)
    }

    #[test]
    fn find_by_prefix_or_full_id() {
        let registry = Registry::new(1024);
        registry.register(fake_instance(&id("1234567890ab"), InstanceKind::Regular));
        registry.register(fake_instance(&id("feedface00"), InstanceKind::Build));

        let guard = registry.lock();
        assert_eq!(guard.find("1234567890").unwrap().id, id("1234567890ab"));
        assert_eq!(guard.find(&id("feedface00")).unwrap().kind, InstanceKind::Build);
        assert!(guard.find("12345678").is_none());
        assert!(guard.find("1234567890a").is_none());
    }

    #[test]
    fn ambiguous_prefix_returns_first_registered() {
        let registry = Registry::new(1024);
        registry.register(fake_instance(&id("aaaaaaaaaa1"), InstanceKind::Regular));
        registry.register(fake_instance(&id("aaaaaaaaaa2"), InstanceKind::Regular));
        assert_eq!(
            registry.lock().find("aaaaaaaaaa").unwrap().id,
            id("aaaaaaaaaa1")
        );
    }

    #[test]
    fn snapshot_and_removal() {
        let registry = Registry::new(1024);
        for n in 0..3 {
            registry.register(fake_instance(&id(&n.to_string()), InstanceKind::Regular));
        }
        assert_eq!(registry.count(), 3);
        let listing = registry.snapshot(2);
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].pid, 4242);
        assert_eq!(listing[0].kind, InstanceKind::Regular);

        let removed = registry.lock().remove(&id("1")).unwrap();
        assert_eq!(removed.id, id("1"));
        assert!(!registry.contains(&id("1")));
        assert_eq!(registry.count(), 2);
    }
}
