//! Initial synchronization from a snapshot.

use crate::client::ReplicationClient;
use crate::config::ApplierConfig;
use crate::error::{ApplierError, ApplierResult};
use crate::target::ApplyTarget;
use crate::transport::Connector;
use logship_core::{CollectionId, CollectionInfo, ServerId, Tick};
use logship_protocol::{CollectionInventory, FilterConfig, InventoryResponse};

/// A collection transferred by an initial sync.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncedCollection {
    /// Identity and properties, as on the source.
    pub info: CollectionInfo,
    /// Documents transferred.
    pub documents: u64,
}

/// Outcome of an initial sync.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotResult {
    /// Boundary tick of the snapshot; the applier starts after it.
    pub last_log_tick: Tick,
    /// Identity of the source.
    pub server_id: Option<ServerId>,
    /// Transferred collections, in id order.
    pub collections: Vec<SyncedCollection>,
}

/// Copies a consistent snapshot of the source into the replica.
///
/// Every in-scope collection is recreated on the replica under its source
/// id, replacing any collection with the same name or id, and filled page by
/// page. The snapshot is released whether or not the transfer succeeds; on
/// failure the collections created so far are dropped again.
pub struct InitialSyncer<'a> {
    client: &'a ReplicationClient,
    target: &'a dyn ApplyTarget,
    batch_size: u64,
}

impl<'a> InitialSyncer<'a> {
    /// Creates a syncer. Pages use the source's default size.
    pub fn new(client: &'a ReplicationClient, target: &'a dyn ApplyTarget) -> Self {
        Self {
            client,
            target,
            batch_size: 0,
        }
    }

    /// Sets the number of documents fetched per page.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Transfers the collections selected by `filter`.
    pub fn run(&self, filter: &FilterConfig) -> ApplierResult<SnapshotResult> {
        let inventory = self.client.inventory(filter)?;
        tracing::info!(
            snapshot = %inventory.snapshot_id,
            tick = %inventory.last_log_tick,
            collections = inventory.collections.len(),
            "starting initial sync"
        );

        let mut created = Vec::new();
        let transferred = self.transfer(&inventory, filter, &mut created);

        if let Err(err) = self.client.release(&inventory.snapshot_id) {
            tracing::warn!(snapshot = %inventory.snapshot_id, error = %err, "failed to release snapshot");
        }

        match transferred {
            Ok(collections) => {
                tracing::info!(
                    tick = %inventory.last_log_tick,
                    collections = collections.len(),
                    "initial sync finished"
                );
                Ok(SnapshotResult {
                    last_log_tick: inventory.last_log_tick,
                    server_id: self.client.server_id(),
                    collections,
                })
            }
            Err(err) => {
                self.rollback(&created);
                tracing::error!(error = %err, "initial sync failed");
                Err(err)
            }
        }
    }

    fn transfer(
        &self,
        inventory: &InventoryResponse,
        filter: &FilterConfig,
        created: &mut Vec<CollectionId>,
    ) -> ApplierResult<Vec<SyncedCollection>> {
        let mut synced = Vec::with_capacity(inventory.collections.len());
        for collection in &inventory.collections {
            if !filter.includes(&collection.info) {
                tracing::debug!(collection = %collection.info.name, "skipping out-of-scope collection");
                continue;
            }
            self.target
                .restore_collection(&collection.info, &collection.indexes)?;
            created.push(collection.info.id);
            let documents = self.transfer_documents(inventory, collection)?;
            tracing::debug!(
                collection = %collection.info.name,
                id = %collection.info.id,
                documents,
                "synced collection"
            );
            synced.push(SyncedCollection {
                info: collection.info.clone(),
                documents,
            });
        }
        Ok(synced)
    }

    fn transfer_documents(
        &self,
        inventory: &InventoryResponse,
        collection: &CollectionInventory,
    ) -> ApplierResult<u64> {
        let id = collection.info.id;
        let mut offset = 0;
        let mut transferred = 0u64;
        loop {
            let page = self
                .client
                .dump(&inventory.snapshot_id, id, offset, self.batch_size)?;
            if page.next_offset < offset || (page.has_more && page.next_offset == offset) {
                return Err(ApplierError::InvalidResponse(format!(
                    "dump of collection {id} did not advance past offset {offset}"
                )));
            }
            transferred += page.documents.len() as u64;
            self.target.restore_documents(id, page.documents)?;
            offset = page.next_offset;
            if !page.has_more {
                break;
            }
        }
        if transferred != collection.count {
            return Err(ApplierError::InvalidResponse(format!(
                "collection {} announced {} documents but {transferred} arrived",
                collection.info.name, collection.count
            )));
        }
        Ok(transferred)
    }

    fn rollback(&self, created: &[CollectionId]) {
        for &id in created {
            if let Err(err) = self.target.drop_collection(id) {
                tracing::warn!(collection = %id, error = %err, "failed to drop partially synced collection");
            }
        }
    }
}

/// Runs an initial sync against the source named in `config`.
pub fn sync(
    connector: &dyn Connector,
    target: &dyn ApplyTarget,
    config: &ApplierConfig,
) -> ApplierResult<SnapshotResult> {
    config.validate()?;
    let client = ReplicationClient::connect(connector, config)?;
    client.login()?;
    InitialSyncer::new(&client, target).run(&config.filter())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{FrameHandler, LoopbackConnector, MockTransport, ReplicationTransport};
    use logship_core::{CollectionProperties, Database, ErrorCode, IndexDefinition};
    use logship_protocol::{DumpResponse, LoginResponse, Response, SnapshotId};
    use logship_source::{ReplicationServer, SourceConfig};
    use serde_json::json;
    use std::sync::Arc;

    fn source_with(docs: usize) -> (Arc<ReplicationServer>, LoopbackConnector) {
        let db = Arc::new(Database::open_in_memory());
        db.create_collection("docs", CollectionProperties::default()).unwrap();
        db.create_collection("_sys", CollectionProperties::default()).unwrap();
        db.ensure_index("docs", IndexDefinition::skiplist(["n"])).unwrap();
        for i in 0..docs {
            db.insert("docs", json!({"_key": format!("d{i}"), "n": i})).unwrap();
        }
        let server = Arc::new(ReplicationServer::new(db, SourceConfig::default().with_dump_batch_size(7)));
        server.add_user("root", "pw");
        let connector = LoopbackConnector::new();
        connector.register("loop://src", Arc::clone(&server) as Arc<dyn FrameHandler>);
        (server, connector)
    }

    #[test]
    fn copies_collections_indexes_and_documents() {
        let (server, connector) = source_with(30);
        let replica = Database::open_in_memory();
        let config = ApplierConfig::new("loop://src", "root", "pw");

        let result = sync(&connector, &replica, &config).unwrap();
        assert_eq!(result.last_log_tick, server.logger_state().last_log_tick);
        assert_eq!(result.collections.len(), 2);
        assert_eq!(result.server_id, Some(server.database().server_id()));

        let source = server.database();
        assert_eq!(replica.count("docs").unwrap(), 30);
        assert_eq!(replica.collection("docs").unwrap().id, source.collection("docs").unwrap().id);
        assert_eq!(replica.indexes("docs").unwrap(), source.indexes("docs").unwrap());
        assert_eq!(server.open_snapshots(), 0);
    }

    #[test]
    fn respects_filter() {
        let (_server, connector) = source_with(3);
        let replica = Database::open_in_memory();
        let config = ApplierConfig::new("loop://src", "root", "pw")
            .with_filter(FilterConfig::default().with_system(false));

        let result = sync(&connector, &replica, &config).unwrap();
        assert_eq!(result.collections.len(), 1);
        assert!(replica.collection("_sys").is_none());
    }

    #[test]
    fn replaces_existing_replica_collection() {
        let (_server, connector) = source_with(2);
        let replica = Database::open_in_memory();
        replica.create_collection("docs", CollectionProperties::default()).unwrap();
        replica.insert("docs", json!({"_key": "stale"})).unwrap();

        sync(&connector, &replica, &ApplierConfig::new("loop://src", "root", "pw")).unwrap();
        assert!(replica.document("docs", "stale").unwrap().is_none());
        assert_eq!(replica.count("docs").unwrap(), 2);
    }

    #[test]
    fn bad_credentials_fail_with_401() {
        let (_server, connector) = source_with(1);
        let replica = Database::open_in_memory();
        let err = sync(&connector, &replica, &ApplierConfig::new("loop://src", "root", "nope")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UNAUTHORIZED);
        assert!(replica.collections().is_empty());
    }

    #[test]
    fn failed_transfer_rolls_back_and_releases() {
        let source = Database::open_in_memory();
        let info = source.create_collection("c", CollectionProperties::default()).unwrap();

        let mock = Arc::new(MockTransport::new());
        mock.push_response(Response::Login(LoginResponse {
            token: "t".into(),
            server_id: source.server_id(),
            state: source.log().state(),
        }));
        mock.push_response(Response::Inventory(InventoryResponse {
            snapshot_id: SnapshotId::new("s1"),
            last_log_tick: source.last_tick(),
            collections: vec![CollectionInventory {
                info,
                indexes: source.indexes("c").unwrap(),
                count: 5,
            }],
        }));
        mock.push_response(Response::Dump(DumpResponse {
            documents: Vec::new(),
            next_offset: 0,
            has_more: false,
        }));
        mock.push_response(Response::Released);

        let client = ReplicationClient::new("mock://", "u", "p", Arc::clone(&mock) as Arc<dyn ReplicationTransport>);
        let replica = Database::open_in_memory();
        let err = InitialSyncer::new(&client, &replica)
            .run(&FilterConfig::default())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::REPLICATION_INVALID_RESPONSE);
        assert!(replica.collection("c").is_none());

        let last = mock.requests().pop().unwrap();
        assert_eq!(last.body.name(), "release");
    }
}
