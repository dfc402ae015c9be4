//! Persisted mapping from cloud instances to the nodes they host.
//!
//! The registry is the single source of truth for whether an instance is
//! still in use. Every mutation takes the lock of the affected instance,
//! writes the new node set to the [`RegistryStore`], and only then updates
//! memory. Operations on different instances never wait for each other.
//!
//! Instances move through three states: pending (tracked by acquisition with
//! no nodes yet), active (one or more nodes), and retired (emptied by a
//! removal). Retiring an instance replaces its record with a tombstone and
//! drops it from memory; later registrations against it consult the store
//! and are rejected, including after a restart.
//!
//! Locks are taken in the order: instance slot, slot map, owner index.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};

use tracing::{debug, info};

mod error;
mod store;

pub use error::{RegistryError, StoreError};
pub use store::{DirectoryStore, InstanceRecords, MemoryStore, RegistryStore};

#[derive(Debug, Default)]
struct InstanceSlot {
    nodes: BTreeSet<String>,
    persisted: bool,
    retired: bool,
}

impl InstanceSlot {
    const fn is_live(&self) -> bool {
        self.persisted && !self.retired
    }
}

type SharedSlot = Arc<Mutex<InstanceSlot>>;

/// Result of removing a node from the registry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Removal {
    /// Instance that owned the removed node.
    pub instance_id: String,
    /// Nodes still attributed to that instance after the removal.
    pub remaining: usize,
}

impl Removal {
    /// Returns true when this removal emptied the instance. Exactly one
    /// removal per instance observes this.
    #[must_use]
    pub const fn emptied_instance(&self) -> bool {
        self.remaining == 0
    }
}

/// Concurrent, persisted instance to node-set mapping.
#[derive(Debug)]
pub struct NodeInstanceRegistry<S> {
    store: S,
    slots: RwLock<HashMap<String, SharedSlot>>,
    owners: Mutex<HashMap<String, String>>,
}

impl<S: RegistryStore> NodeInstanceRegistry<S> {
    /// Opens a registry, reloading every record from `store`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Store`] when the records cannot be loaded and
    /// [`RegistryError::Conflict`] when two records claim the same node.
    pub fn open(store: S) -> Result<Self, RegistryError> {
        let records = store.load_all()?;
        let mut owners = HashMap::new();
        let mut slots = HashMap::new();
        for (instance_id, nodes) in records {
            for node in &nodes {
                if let Some(first) = owners.insert(node.clone(), instance_id.clone()) {
                    return Err(RegistryError::Conflict {
                        node: node.clone(),
                        first,
                        second: instance_id,
                    });
                }
            }
            let slot = InstanceSlot {
                nodes,
                persisted: true,
                retired: false,
            };
            slots.insert(instance_id, Arc::new(Mutex::new(slot)));
        }
        info!(instances = slots.len(), nodes = owners.len(), "registry loaded");
        Ok(Self {
            store,
            slots: RwLock::new(slots),
            owners: Mutex::new(owners),
        })
    }

    /// Returns the backing store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Records a freshly created instance that has no nodes yet, so the
    /// instance survives a restart before any node joins it. Tracking an
    /// instance twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InstanceRetired`] for a retired instance and
    /// [`RegistryError::Store`] when the record cannot be written.
    pub fn track_instance(&self, instance_id: &str) -> Result<(), RegistryError> {
        let slot = self.slot_or_insert(instance_id);
        let mut guard = lock(&slot);
        self.reject_retired(instance_id, &slot, &mut guard)?;
        if guard.persisted {
            return Ok(());
        }
        self.store.save(instance_id, &guard.nodes)?;
        guard.persisted = true;
        debug!(%instance_id, "tracking pending instance");
        Ok(())
    }

    /// Associates `node` with `instance_id`.
    ///
    /// Returns `true` when the association is new and `false` when it already
    /// existed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateNode`] when the node belongs to a
    /// different instance, [`RegistryError::InstanceRetired`] when the
    /// instance has been emptied, and [`RegistryError::Store`] when the record
    /// cannot be written. On error nothing changes.
    pub fn put(&self, instance_id: &str, node: &str) -> Result<bool, RegistryError> {
        let slot = self.slot_or_insert(instance_id);
        let mut guard = lock(&slot);
        self.reject_retired(instance_id, &slot, &mut guard)?;
        if guard.nodes.contains(node) {
            return Ok(false);
        }

        self.claim(instance_id, node)?;
        let mut next = guard.nodes.clone();
        next.insert(node.to_owned());
        if let Err(err) = self.store.save(instance_id, &next) {
            lock(&self.owners).remove(node);
            return Err(err.into());
        }

        guard.nodes = next;
        guard.persisted = true;
        debug!(%instance_id, %node, nodes = guard.nodes.len(), "node recorded");
        Ok(true)
    }

    /// Removes `node` from the instance that owns it.
    ///
    /// When the removal empties the instance, its record is replaced by a
    /// tombstone and the instance is retired in the same critical section, so
    /// concurrent
    /// removals on one instance see `remaining == 0` exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownNode`] when the node is not tracked and
    /// [`RegistryError::Store`] when the change cannot be persisted. On error
    /// nothing changes.
    pub fn remove(&self, node: &str) -> Result<Removal, RegistryError> {
        loop {
            let unknown = || RegistryError::UnknownNode {
                node: node.to_owned(),
            };
            let instance_id = lock(&self.owners).get(node).cloned().ok_or_else(unknown)?;
            let slot = self.slot(&instance_id).ok_or_else(unknown)?;
            let mut guard = lock(&slot);
            if !guard.nodes.contains(node) {
                // The node moved between the owner lookup and the slot lock.
                if lock(&self.owners).contains_key(node) {
                    continue;
                }
                return Err(unknown());
            }

            let mut next = guard.nodes.clone();
            next.remove(node);
            let remaining = next.len();
            if next.is_empty() {
                self.store.retire(&instance_id)?;
            } else {
                self.store.save(&instance_id, &next)?;
            }

            guard.nodes = next;
            if remaining == 0 {
                guard.retired = true;
                guard.persisted = false;
                self.evict(&instance_id, &slot);
            }
            lock(&self.owners).remove(node);
            debug!(%instance_id, %node, remaining, "node removed");
            return Ok(Removal {
                instance_id,
                remaining,
            });
        }
    }

    /// Retires an instance that never received a node, replacing its record
    /// with a tombstone.
    ///
    /// Returns `true` when this call retired the instance and `false` when it
    /// was already retired.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InstanceInUse`] when nodes are still
    /// attributed to the instance, [`RegistryError::UnknownInstance`] when it
    /// was never tracked, and [`RegistryError::Store`] when the record cannot
    /// be written.
    pub fn retire_instance(&self, instance_id: &str) -> Result<bool, RegistryError> {
        let retired_or_unknown = || -> Result<bool, RegistryError> {
            if self.store.is_retired(instance_id)? {
                Ok(false)
            } else {
                Err(RegistryError::UnknownInstance {
                    instance_id: instance_id.to_owned(),
                })
            }
        };
        let Some(slot) = self.slot(instance_id) else {
            return retired_or_unknown();
        };
        let mut guard = lock(&slot);
        if guard.retired {
            return Ok(false);
        }
        if !guard.persisted {
            return retired_or_unknown();
        }
        if !guard.nodes.is_empty() {
            return Err(RegistryError::InstanceInUse {
                instance_id: instance_id.to_owned(),
                nodes: guard.nodes.len(),
            });
        }
        self.store.retire(instance_id)?;
        guard.retired = true;
        guard.persisted = false;
        self.evict(instance_id, &slot);
        debug!(%instance_id, "pending instance retired");
        Ok(true)
    }

    /// Returns the nodes currently attributed to `instance_id`.
    #[must_use]
    pub fn nodes_of(&self, instance_id: &str) -> BTreeSet<String> {
        self.slot(instance_id)
            .map(|slot| lock(&slot).nodes.clone())
            .unwrap_or_default()
    }

    /// Returns true when `instance_id` has no tracked nodes, either because
    /// it never had any or because all were removed.
    #[must_use]
    pub fn is_empty(&self, instance_id: &str) -> bool {
        self.slot(instance_id)
            .is_none_or(|slot| lock(&slot).nodes.is_empty())
    }

    /// Returns the instance that owns `node`, if any.
    #[must_use]
    pub fn instance_of(&self, node: &str) -> Option<String> {
        lock(&self.owners).get(node).cloned()
    }

    /// Returns true when `instance_id` has been retired, in this process or
    /// before the registry was reopened.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Store`] when the tombstone lookup fails.
    pub fn is_retired(&self, instance_id: &str) -> Result<bool, RegistryError> {
        if let Some(slot) = self.slot(instance_id) {
            let guard = lock(&slot);
            if guard.retired || guard.persisted {
                return Ok(guard.retired);
            }
        }
        self.store
            .is_retired(instance_id)
            .map_err(RegistryError::from)
    }

    /// Returns a copy of every live instance and its nodes. Each instance is
    /// read atomically; the map as a whole is not a point-in-time view.
    #[must_use]
    pub fn snapshot(&self) -> InstanceRecords {
        let slots: Vec<(String, SharedSlot)> = read(&self.slots)
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();
        slots
            .into_iter()
            .filter_map(|(id, slot)| {
                let guard = lock(&slot);
                guard.is_live().then(|| (id, guard.nodes.clone()))
            })
            .collect::<BTreeMap<_, _>>()
    }

    /// Fails when the slot is retired. A slot unknown to this process is
    /// checked against the store's tombstones and evicted when it matches.
    fn reject_retired(
        &self,
        instance_id: &str,
        slot: &SharedSlot,
        guard: &mut InstanceSlot,
    ) -> Result<(), RegistryError> {
        if !guard.retired && !guard.persisted && self.store.is_retired(instance_id)? {
            guard.retired = true;
            self.evict(instance_id, slot);
        }
        if guard.retired {
            return Err(RegistryError::InstanceRetired {
                instance_id: instance_id.to_owned(),
            });
        }
        Ok(())
    }

    fn claim(&self, instance_id: &str, node: &str) -> Result<(), RegistryError> {
        let mut owners = lock(&self.owners);
        match owners.get(node) {
            Some(owner) if owner != instance_id => Err(RegistryError::DuplicateNode {
                node: node.to_owned(),
                owner: owner.clone(),
                requested: instance_id.to_owned(),
            }),
            _ => {
                owners.insert(node.to_owned(), instance_id.to_owned());
                Ok(())
            }
        }
    }

    fn slot(&self, instance_id: &str) -> Option<SharedSlot> {
        read(&self.slots).get(instance_id).cloned()
    }

    fn slot_or_insert(&self, instance_id: &str) -> SharedSlot {
        if let Some(slot) = self.slot(instance_id) {
            return slot;
        }
        let mut slots = self
            .slots
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(instance_id.to_owned()).or_default())
    }
}

impl<S> NodeInstanceRegistry<S> {
    fn evict(&self, instance_id: &str, slot: &SharedSlot) {
        let mut slots = self
            .slots
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if slots
            .get(instance_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            slots.remove(instance_id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(rwlock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests;
