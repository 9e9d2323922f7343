//! Snapshot capture and paging.
//!
//! An inventory request captures a consistent [`DatabaseView`] of the
//! in-scope collections together with its boundary tick and parks it in a
//! [`SnapshotRegistry`] under a fresh id. Dump requests then page documents
//! out of the parked view, so a slow replica sees exactly the captured data
//! no matter how the source changes meanwhile. Views not touched for the
//! configured time-to-live are purged.

use crate::error::{SourceError, SourceResult};
use logship_core::{CollectionId, CollectionView, Database, DatabaseView};
use logship_protocol::{
    CollectionInventory, DumpRequest, DumpResponse, FilterConfig, InventoryResponse, SnapshotId,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

struct Parked {
    view: Arc<DatabaseView>,
    expires: Instant,
}

/// Captured views, keyed by snapshot id.
pub struct SnapshotRegistry {
    ttl: Duration,
    snapshots: RwLock<HashMap<SnapshotId, Parked>>,
}

impl SnapshotRegistry {
    /// Creates a registry whose entries live for `ttl` after their last use.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Parks a view and returns its id.
    pub fn register(&self, view: DatabaseView) -> SnapshotId {
        let id = SnapshotId::new(Uuid::new_v4().to_string());
        let mut snapshots = self.snapshots.write();
        Self::purge_locked(&mut snapshots);
        snapshots.insert(
            id.clone(),
            Parked {
                view: Arc::new(view),
                expires: Instant::now() + self.ttl,
            },
        );
        id
    }

    /// Returns a parked view and extends its lifetime.
    pub fn get(&self, id: &SnapshotId) -> SourceResult<Arc<DatabaseView>> {
        let mut snapshots = self.snapshots.write();
        Self::purge_locked(&mut snapshots);
        let parked = snapshots
            .get_mut(id)
            .ok_or_else(|| SourceError::SnapshotNotFound(id.clone()))?;
        parked.expires = Instant::now() + self.ttl;
        Ok(Arc::clone(&parked.view))
    }

    /// Frees a view. Returns false if it did not exist.
    pub fn release(&self, id: &SnapshotId) -> bool {
        self.snapshots.write().remove(id).is_some()
    }

    /// Number of parked views, expired ones included.
    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    /// Returns true if no view is parked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge_locked(snapshots: &mut HashMap<SnapshotId, Parked>) {
        let now = Instant::now();
        let before = snapshots.len();
        snapshots.retain(|_, parked| parked.expires > now);
        let purged = before - snapshots.len();
        if purged > 0 {
            tracing::debug!(purged, "purged expired snapshots");
        }
    }
}

/// Serves inventory, dump and release requests for one database.
pub struct SnapshotProvider {
    db: Arc<Database>,
    registry: SnapshotRegistry,
    default_batch: u64,
}

impl SnapshotProvider {
    /// Creates a provider.
    pub fn new(db: Arc<Database>, ttl: Duration, default_batch: u64) -> Self {
        Self {
            db,
            registry: SnapshotRegistry::new(ttl),
            default_batch: default_batch.max(1),
        }
    }

    /// Captures the collections selected by `filter`.
    pub fn inventory(&self, filter: &FilterConfig) -> InventoryResponse {
        let view = self.db.capture(|info| filter.includes(info));
        let last_log_tick = view.last_tick.clone();
        let collections: Vec<CollectionInventory> = view
            .collections
            .iter()
            .map(|c| CollectionInventory {
                info: c.info.clone(),
                indexes: c.indexes.clone(),
                count: c.documents.len() as u64,
            })
            .collect();
        let snapshot_id = self.registry.register(view);
        tracing::info!(
            snapshot = %snapshot_id,
            tick = %last_log_tick,
            collections = collections.len(),
            "captured snapshot"
        );
        InventoryResponse {
            snapshot_id,
            last_log_tick,
            collections,
        }
    }

    /// Returns one page of a captured collection.
    pub fn dump(&self, request: &DumpRequest) -> SourceResult<DumpResponse> {
        let view = self.registry.get(&request.snapshot_id)?;
        let collection = find(&view, request.collection).ok_or_else(|| SourceError::NotInSnapshot {
            snapshot: request.snapshot_id.clone(),
            collection: request.collection.as_u64(),
        })?;

        let batch = if request.batch_size == 0 {
            self.default_batch
        } else {
            request.batch_size
        };
        let total = collection.documents.len();
        let start = usize::try_from(request.offset).unwrap_or(usize::MAX).min(total);
        let end = start.saturating_add(usize::try_from(batch).unwrap_or(usize::MAX)).min(total);

        Ok(DumpResponse {
            documents: collection.documents[start..end].to_vec(),
            next_offset: end as u64,
            has_more: end < total,
        })
    }

    /// Frees a snapshot. Returns false if it did not exist.
    pub fn release(&self, id: &SnapshotId) -> bool {
        let released = self.registry.release(id);
        if released {
            tracing::info!(snapshot = %id, "released snapshot");
        }
        released
    }

    /// The registry holding parked views.
    pub fn registry(&self) -> &SnapshotRegistry {
        &self.registry
    }
}

fn find(view: &DatabaseView, id: CollectionId) -> Option<&CollectionView> {
    view.collections.iter().find(|c| c.info.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use logship_core::CollectionProperties;
    use serde_json::json;

    fn provider_with_docs(n: usize) -> (Arc<Database>, SnapshotProvider) {
        let db = Arc::new(Database::open_in_memory());
        db.create_collection("docs", CollectionProperties::default()).unwrap();
        db.create_collection("_system", CollectionProperties::default()).unwrap();
        for i in 0..n {
            db.insert("docs", json!({"_key": format!("k{i}"), "i": i})).unwrap();
        }
        let provider = SnapshotProvider::new(Arc::clone(&db), Duration::from_secs(60), 10);
        (db, provider)
    }

    #[test]
    fn inventory_respects_filter() {
        let (db, provider) = provider_with_docs(3);
        let all = provider.inventory(&FilterConfig::default());
        assert_eq!(all.collections.len(), 2);
        assert_eq!(all.last_log_tick, db.last_tick());

        let user_only = provider.inventory(&FilterConfig::default().with_system(false));
        assert_eq!(user_only.collections.len(), 1);
        assert_eq!(user_only.collections[0].info.name, "docs");
        assert_eq!(user_only.collections[0].count, 3);
        assert_eq!(provider.registry().len(), 2);
    }

    #[test]
    fn dump_pages_in_insertion_order() {
        let (_db, provider) = provider_with_docs(25);
        let inventory = provider.inventory(&FilterConfig::include(["docs"]));
        let id = inventory.collections[0].info.id;

        let mut keys = Vec::new();
        let mut offset = 0;
        loop {
            let page = provider
                .dump(&DumpRequest::new(inventory.snapshot_id.clone(), id, offset, 0))
                .unwrap();
            assert!(page.documents.len() <= 10);
            keys.extend(page.documents.into_iter().map(|d| d.key));
            offset = page.next_offset;
            if !page.has_more {
                break;
            }
        }
        let expected: Vec<String> = (0..25).map(|i| format!("k{i}")).collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn view_is_isolated_from_later_writes() {
        let (db, provider) = provider_with_docs(2);
        let inventory = provider.inventory(&FilterConfig::include(["docs"]));
        db.insert("docs", json!({"_key": "late"})).unwrap();
        db.remove("docs", "k0").unwrap();

        let page = provider
            .dump(&DumpRequest::new(
                inventory.snapshot_id.clone(),
                inventory.collections[0].info.id,
                0,
                100,
            ))
            .unwrap();
        let keys: Vec<_> = page.documents.iter().map(|d| d.key.as_str()).collect();
        assert_eq!(keys, vec!["k0", "k1"]);
        assert!(db.last_tick() > inventory.last_log_tick);
    }

    #[test]
    fn release_and_unknown_snapshots() {
        let (_db, provider) = provider_with_docs(1);
        let inventory = provider.inventory(&FilterConfig::default());
        assert!(provider.release(&inventory.snapshot_id));
        assert!(!provider.release(&inventory.snapshot_id));

        let result = provider.dump(&DumpRequest::new(
            inventory.snapshot_id,
            CollectionId::new(1),
            0,
            1,
        ));
        assert!(matches!(result, Err(SourceError::SnapshotNotFound(_))));
    }

    #[test]
    fn unknown_collection_in_snapshot() {
        let (_db, provider) = provider_with_docs(1);
        let inventory = provider.inventory(&FilterConfig::include(["docs"]));
        let result = provider.dump(&DumpRequest::new(
            inventory.snapshot_id,
            CollectionId::new(999),
            0,
            1,
        ));
        assert!(matches!(result, Err(SourceError::NotInSnapshot { .. })));
    }

    #[test]
    fn expired_snapshots_are_purged() {
        let registry = SnapshotRegistry::new(Duration::from_millis(0));
        let db = Database::open_in_memory();
        let id = registry.register(db.capture(|_| true));
        std::thread::sleep(Duration::from_millis(5));
        assert!(registry.get(&id).is_err());
        assert!(registry.is_empty());
    }
}
