//! Transfer and waiter tables owned by the coordinator actor.
//!
//! Nothing here is synchronized; the actor is the only owner.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::cache::{CacheKey, derive_key};
use crate::engine::{TransferHandle, TransferId, progress_fraction};
use crate::operation::OperationId;
use crate::request::ResourceId;

/// One in-flight transfer shared by every waiter of its resource
#[derive(Debug, Clone)]
pub(crate) struct ActiveTransfer {
    pub handle: TransferHandle,
    pub received: u64,
    pub expected: u64,
}

impl ActiveTransfer {
    pub fn new(handle: TransferHandle) -> Self {
        Self {
            handle,
            received: 0,
            expected: 0,
        }
    }

    pub fn fraction(&self) -> Option<f32> {
        progress_fraction(self.received, self.expected)
    }
}

/// Removed waiter together with the number of waiters left on its resource
pub(crate) struct Unregistered<W> {
    pub resource: ResourceId,
    pub waiter: W,
    pub remaining: usize,
}

#[derive(Debug)]
pub(crate) struct Registry<W> {
    transfers: HashMap<ResourceId, ActiveTransfer>,
    waiters: HashMap<ResourceId, Vec<OperationId>>,
    operations: HashMap<OperationId, (ResourceId, W)>,
    parked: VecDeque<OperationId>,
    reconciled: bool,
}

impl<W: Clone> Registry<W> {
    pub fn new() -> Self {
        Self {
            transfers: HashMap::new(),
            waiters: HashMap::new(),
            operations: HashMap::new(),
            parked: VecDeque::new(),
            reconciled: false,
        }
    }

    pub fn is_reconciled(&self) -> bool {
        self.reconciled
    }

    pub fn mark_reconciled(&mut self) {
        self.reconciled = true;
    }

    /// Add a waiter entry. Returns false if the id is already registered.
    pub fn register(&mut self, id: OperationId, resource: ResourceId, waiter: W) -> bool {
        match self.operations.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert((resource.clone(), waiter));
                self.waiters.entry(resource).or_default().push(id);
                true
            }
        }
    }

    /// Remove a single waiter entry, wherever it is
    pub fn unregister(&mut self, id: OperationId) -> Option<Unregistered<W>> {
        let (resource, waiter) = self.operations.remove(&id)?;
        self.parked.retain(|parked| *parked != id);

        let remaining = match self.waiters.get_mut(&resource) {
            Some(ids) => {
                ids.retain(|waiting| *waiting != id);
                ids.len()
            }
            None => 0,
        };
        if remaining == 0 {
            self.waiters.remove(&resource);
        }

        Some(Unregistered {
            resource,
            waiter,
            remaining,
        })
    }

    pub fn operation(&self, id: OperationId) -> Option<&W> {
        self.operations.get(&id).map(|(_, waiter)| waiter)
    }

    /// Waiters of a resource in registration order
    pub fn waiters_of(&self, resource: &ResourceId) -> Vec<W> {
        self.waiters
            .get(resource)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.operation(*id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn waiter_count(&self, resource: &ResourceId) -> usize {
        self.waiters.get(resource).map_or(0, Vec::len)
    }

    /// Remove every waiter of a resource, returning them in registration order
    pub fn take_waiters(&mut self, resource: &ResourceId) -> Vec<W> {
        let Some(ids) = self.waiters.remove(resource) else {
            return Vec::new();
        };
        self.parked.retain(|parked| !ids.contains(parked));
        ids.into_iter()
            .filter_map(|id| self.operations.remove(&id).map(|(_, waiter)| waiter))
            .collect()
    }

    pub fn transfer(&self, resource: &ResourceId) -> Option<&ActiveTransfer> {
        self.transfers.get(resource)
    }

    pub fn transfer_mut(&mut self, resource: &ResourceId) -> Option<&mut ActiveTransfer> {
        self.transfers.get_mut(resource)
    }

    /// Record a transfer. The previous one for the same resource, if any, is
    /// returned.
    pub fn insert_transfer(&mut self, transfer: ActiveTransfer) -> Option<ActiveTransfer> {
        self.transfers
            .insert(transfer.handle.resource.clone(), transfer)
    }

    pub fn remove_transfer(&mut self, resource: &ResourceId) -> Option<ActiveTransfer> {
        self.transfers.remove(resource)
    }

    /// Whether `transfer` is the active transfer of `resource`
    pub fn matches(&self, resource: &ResourceId, transfer: TransferId) -> bool {
        self.transfers
            .get(resource)
            .is_some_and(|active| active.handle.id == transfer)
    }

    pub fn transfers(&self) -> impl Iterator<Item = &ActiveTransfer> {
        self.transfers.values()
    }

    pub fn active_count(&self) -> usize {
        self.transfers.len()
    }

    pub fn park(&mut self, id: OperationId) {
        self.parked.push_back(id);
    }

    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }

    /// Drain parked operations in the order they were parked
    pub fn release_parked(&mut self) -> Vec<OperationId> {
        self.parked.drain(..).collect()
    }

    /// Cache keys of resources with an active transfer
    pub fn referenced_keys(&self) -> HashSet<CacheKey> {
        self.transfers.keys().map(derive_key).collect()
    }

    /// Empty every table, returning the transfers and waiters that were held
    pub fn drain(&mut self) -> (Vec<ActiveTransfer>, Vec<W>) {
        let transfers = self.transfers.drain().map(|(_, t)| t).collect();
        let mut ids: Vec<_> = self.operations.keys().copied().collect();
        ids.sort();
        let waiters = ids
            .into_iter()
            .filter_map(|id| self.operations.remove(&id).map(|(_, waiter)| waiter))
            .collect();
        self.waiters.clear();
        self.parked.clear();
        (transfers, waiters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn resource(url: &str) -> ResourceId {
        ResourceId::from_url(&Url::parse(url).unwrap())
    }

    fn transfer(id: u64, resource: &ResourceId) -> ActiveTransfer {
        ActiveTransfer::new(TransferHandle {
            id: TransferId(id),
            resource: resource.clone(),
        })
    }

    #[test]
    fn test_register_and_unregister() {
        let mut registry: Registry<&str> = Registry::new();
        let a = resource("https://example.com/a");

        assert!(registry.register(OperationId(1), a.clone(), "first"));
        assert!(registry.register(OperationId(2), a.clone(), "second"));
        assert!(!registry.register(OperationId(1), a.clone(), "again"));
        assert_eq!(registry.waiters_of(&a), vec!["first", "second"]);

        let removed = registry.unregister(OperationId(1)).unwrap();
        assert_eq!(removed.waiter, "first");
        assert_eq!(removed.remaining, 1);

        let removed = registry.unregister(OperationId(2)).unwrap();
        assert_eq!(removed.remaining, 0);
        assert_eq!(registry.waiter_count(&a), 0);
        assert!(registry.unregister(OperationId(2)).is_none());
    }

    #[test]
    fn test_take_waiters_keeps_other_resources() {
        let mut registry: Registry<u32> = Registry::new();
        let a = resource("https://example.com/a");
        let b = resource("https://example.com/b");

        registry.register(OperationId(1), a.clone(), 1);
        registry.register(OperationId(2), b.clone(), 2);
        registry.register(OperationId(3), a.clone(), 3);

        assert_eq!(registry.take_waiters(&a), vec![1, 3]);
        assert!(registry.operation(OperationId(1)).is_none());
        assert_eq!(registry.waiters_of(&b), vec![2]);
    }

    #[test]
    fn test_transfer_matching() {
        let mut registry: Registry<u32> = Registry::new();
        let a = resource("https://example.com/a");

        assert!(registry.insert_transfer(transfer(7, &a)).is_none());
        assert!(registry.matches(&a, TransferId(7)));
        assert!(!registry.matches(&a, TransferId(8)));
        assert_eq!(registry.active_count(), 1);

        let replaced = registry.insert_transfer(transfer(8, &a)).unwrap();
        assert_eq!(replaced.handle.id, TransferId(7));
        assert_eq!(registry.active_count(), 1);

        registry.remove_transfer(&a);
        assert!(!registry.matches(&a, TransferId(8)));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_parked_release_is_fifo() {
        let mut registry: Registry<u32> = Registry::new();
        let a = resource("https://example.com/a");
        for id in 1..=3 {
            registry.register(OperationId(id), a.clone(), id as u32);
            registry.park(OperationId(id));
        }

        registry.unregister(OperationId(2));
        assert_eq!(registry.parked_count(), 2);
        assert_eq!(
            registry.release_parked(),
            vec![OperationId(1), OperationId(3)]
        );
        assert_eq!(registry.parked_count(), 0);
    }

    #[test]
    fn test_referenced_keys_follow_transfers() {
        let mut registry: Registry<u32> = Registry::new();
        let a = resource("https://example.com/a");
        registry.insert_transfer(transfer(1, &a));

        let keys = registry.referenced_keys();
        assert_eq!(keys.len(), 1);
        assert!(keys.contains(&derive_key(&a)));
    }

    #[test]
    fn test_fraction_needs_expected_size() {
        let a = resource("https://example.com/a");
        let mut active = transfer(1, &a);
        active.received = 10;
        assert_eq!(active.fraction(), None);
        active.expected = 40;
        assert_eq!(active.fraction(), Some(0.25));
    }

    #[test]
    fn test_drain_empties_everything() {
        let mut registry: Registry<u32> = Registry::new();
        let a = resource("https://example.com/a");
        registry.insert_transfer(transfer(1, &a));
        registry.register(OperationId(2), a.clone(), 2);
        registry.register(OperationId(1), a.clone(), 1);

        let (transfers, waiters) = registry.drain();
        assert_eq!(transfers.len(), 1);
        assert_eq!(waiters, vec![1, 2]);
        assert_eq!(registry.active_count(), 0);
        assert_eq!(registry.waiter_count(&a), 0);
    }
}
