//! Read-only view over the block-services cache.
//!
//! The cache itself is maintained by an external component that watches the
//! registry; the shard engine only ever consumes an immutable snapshot of
//! it: once inside a prepare or apply step, the set of services, their
//! flags, failure domains and secret keys do not change under our feet.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use lodefs_proto::crypto::ExpandedKey;
use lodefs_proto::ids::{BlockServiceId, FailureDomain, LocationId, StorageClass};
use lodefs_proto::msgs::AddrsInfo;

/// Everything the shard needs to know about one block service.
#[derive(Clone)]
pub struct BlockServiceInfo {
    pub id: BlockServiceId,
    pub addrs: AddrsInfo,
    /// `BLOCK_SERVICE_*` flag bits.
    pub flags: u8,
    pub location_id: LocationId,
    pub storage_class: StorageClass,
    pub failure_domain: FailureDomain,
    /// Expanded per-service secret, for certificates and proofs.
    pub secret_key: ExpandedKey,
}

/// An immutable snapshot of the cache.
#[derive(Clone, Default)]
pub struct BlockServicesSnapshot {
    services: HashMap<u64, BlockServiceInfo>,
    /// Services eligible for new writes, i.e. current and writable.
    current: Vec<BlockServiceId>,
}

impl BlockServicesSnapshot {
    /// Builds a snapshot; `current` lists the services eligible for new
    /// block placement.
    pub fn new(services: Vec<BlockServiceInfo>, current: Vec<BlockServiceId>) -> Self {
        BlockServicesSnapshot {
            services: services.into_iter().map(|s| (s.id.0, s)).collect(),
            current,
        }
    }

    /// Looks up a service by id.
    pub fn get(&self, id: BlockServiceId) -> Option<&BlockServiceInfo> {
        self.services.get(&id.0)
    }

    /// Looks up a service that state references; a miss means the cache and
    /// the store disagree, which the engine treats as fatal.
    pub fn expect(&self, id: BlockServiceId) -> &BlockServiceInfo {
        self.services
            .get(&id.0)
            .unwrap_or_else(|| panic!("block service {} missing from cache", id))
    }

    /// The services eligible for new writes.
    pub fn current(&self) -> impl Iterator<Item = &BlockServiceInfo> {
        self.current.iter().filter_map(|id| self.services.get(&id.0))
    }
}

/// Shared handle over the latest cache snapshot.
pub struct BlockServicesCache {
    inner: RwLock<Arc<BlockServicesSnapshot>>,
}

impl BlockServicesCache {
    /// An empty cache; no spans can be placed until it is updated.
    pub fn new() -> BlockServicesCache {
        BlockServicesCache {
            inner: RwLock::new(Arc::new(BlockServicesSnapshot::default())),
        }
    }

    /// Replaces the published snapshot.
    pub fn update(&self, snapshot: BlockServicesSnapshot) {
        *self.inner.write().unwrap() = Arc::new(snapshot);
    }

    /// The latest snapshot.
    pub fn get(&self) -> Arc<BlockServicesSnapshot> {
        self.inner.read().unwrap().clone()
    }
}

impl Default for BlockServicesCache {
    fn default() -> Self {
        BlockServicesCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(id: u64, domain: u8) -> BlockServiceInfo {
        BlockServiceInfo {
            id: BlockServiceId(id),
            addrs: AddrsInfo::empty(),
            flags: 0,
            location_id: 0,
            storage_class: StorageClass::Flash,
            failure_domain: FailureDomain([domain; 16]),
            secret_key: ExpandedKey::expand(&[id as u8; 16]),
        }
    }

    #[test]
    fn test_lookup_and_current() {
        let cache = BlockServicesCache::new();
        cache.update(BlockServicesSnapshot::new(
            vec![service(1, 1), service(2, 2), service(3, 3)],
            vec![BlockServiceId(1), BlockServiceId(3)],
        ));
        let snap = cache.get();
        assert!(snap.get(BlockServiceId(2)).is_some());
        assert!(snap.get(BlockServiceId(9)).is_none());
        let current: Vec<u64> = snap.current().map(|s| s.id.0).collect();
        assert_eq!(current, vec![1, 3]);
    }

    #[test]
    fn test_snapshot_is_stable_across_update() {
        let cache = BlockServicesCache::new();
        cache.update(BlockServicesSnapshot::new(vec![service(1, 1)], vec![]));
        let snap = cache.get();
        cache.update(BlockServicesSnapshot::new(vec![], vec![]));
        // the handle taken before the update still sees the old view
        assert!(snap.get(BlockServiceId(1)).is_some());
        assert!(cache.get().get(BlockServiceId(1)).is_none());
    }
}
