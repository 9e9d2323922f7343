//! Test fixtures: a wired source/replica pair and the compare harness.
//!
//! A [`ReplicationPair`] holds a source database behind a
//! [`ReplicationServer`], an empty replica database and an [`Applier`]
//! connected to the source through a loopback connector. The
//! [`ReplicationPair::compare`] harness runs a workload, syncs, starts the
//! applier and waits until the replica has caught up.

use crate::faults::FlakyConnector;
use logship_applier::{
    Applier, ApplierConfig, ApplierState, Connector, FrameHandler, LoopbackConnector,
    MemoryStateStore, SnapshotResult, StateStore,
};
use logship_core::{
    ChecksumOptions, ChecksumVerifier, CollectionChecksum, Database, Tick,
};
use logship_source::{ReplicationServer, SourceConfig};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Endpoint the source is registered under.
pub const SOURCE_ENDPOINT: &str = "loop://source";
/// Replication user on the source.
pub const REPLICATOR_USER: &str = "replicator";
/// Password of [`REPLICATOR_USER`].
pub const REPLICATOR_PASSWORD: &str = "replicator-secret";
/// How long waits in tests may take before they fail.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Initializes a tracing subscriber for tests.
///
/// The filter is read from `RUST_LOG` and defaults to `warn`. Calling this
/// more than once is harmless.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Polls `probe` until it returns `Some` or `timeout` elapses.
pub fn wait_for<T>(timeout: Duration, mut probe: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = probe() {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// Waits until the applier has applied `tick`, stopped or failed.
///
/// Returns the state that ended the wait.
///
/// # Panics
///
/// Panics if none of that happens within `timeout`.
pub fn wait_for_catch_up(applier: &Applier, tick: &Tick, timeout: Duration) -> ApplierState {
    wait_for(timeout, || {
        let state = applier.state();
        let done = !state.is_running()
            || state.last_error.is_some()
            || &state.last_applied_tick >= tick;
        done.then_some(state)
    })
    .unwrap_or_else(|| panic!("applier did not reach tick {tick}: {:?}", applier.state()))
}

/// Outcome of [`ReplicationPair::compare`].
#[derive(Debug, Clone)]
pub struct Comparison {
    /// Result of the initial sync.
    pub snapshot: SnapshotResult,
    /// Applier state once the replica caught up or the applier stopped.
    pub state: ApplierState,
    /// Last tick of the source log after the workload.
    pub source_tick: Tick,
}

/// A source, a replica and an applier between them.
pub struct ReplicationPair {
    /// The source endpoint.
    pub source: Arc<ReplicationServer>,
    /// The replica database.
    pub replica: Arc<Database>,
    /// Routes the source endpoint to the source.
    pub loopback: Arc<LoopbackConnector>,
    /// Fault injection between applier and source.
    pub network: Arc<FlakyConnector>,
    /// Where the applier saves its state.
    pub store: Arc<dyn StateStore>,
    /// The applier feeding the replica.
    pub applier: Applier,
}

impl ReplicationPair {
    /// Creates a pair with default source settings.
    pub fn new() -> Self {
        Self::with_source_config(SourceConfig::default())
    }

    /// Creates a pair with the given source settings.
    pub fn with_source_config(config: SourceConfig) -> Self {
        Self::build(config, Arc::new(MemoryStateStore::new()))
    }

    /// Creates a pair whose applier keeps its state in `store`.
    pub fn with_store(store: Arc<dyn StateStore>) -> Self {
        Self::build(SourceConfig::default(), store)
    }

    fn build(config: SourceConfig, store: Arc<dyn StateStore>) -> Self {
        let source = Arc::new(ReplicationServer::new(
            Arc::new(Database::open_in_memory()),
            config,
        ));
        source.add_user(REPLICATOR_USER, REPLICATOR_PASSWORD);

        let loopback = Arc::new(LoopbackConnector::new());
        loopback.register(SOURCE_ENDPOINT, Arc::clone(&source) as Arc<dyn FrameHandler>);
        let network = Arc::new(FlakyConnector::new(Arc::clone(&loopback) as Arc<dyn Connector>));

        let replica = Arc::new(Database::open_in_memory());
        let applier = Applier::new(
            Arc::clone(&network) as Arc<dyn Connector>,
            Arc::clone(&replica) as Arc<dyn logship_applier::ApplyTarget>,
            Arc::clone(&store),
        )
        .expect("failed to create applier");

        Self {
            source,
            replica,
            loopback,
            network,
            store,
            applier,
        }
    }

    /// The source database.
    pub fn source_db(&self) -> &Arc<Database> {
        self.source.database()
    }

    /// A configuration for the source with short waits.
    pub fn config(&self) -> ApplierConfig {
        ApplierConfig::new(SOURCE_ENDPOINT, REPLICATOR_USER, REPLICATOR_PASSWORD)
            .with_idle_wait(Duration::from_millis(1), Duration::from_millis(20))
            .with_connect_retries(10, Duration::from_millis(5))
    }

    /// Runs `setup` on the source, syncs, starts the applier from the
    /// snapshot tick, runs `workload` and waits until the replica applied
    /// everything the source logged.
    ///
    /// # Panics
    ///
    /// Panics if sync, configuration or start fail, or on timeout.
    pub fn compare<S, W>(&self, setup: S, workload: W, config: ApplierConfig) -> Comparison
    where
        S: FnOnce(&Database),
        W: FnOnce(&Database),
    {
        setup(self.source_db());

        self.applier.stop().expect("failed to stop applier");
        let snapshot = self.applier.sync(&config).expect("initial sync failed");
        self.applier
            .properties(config)
            .expect("failed to configure applier");
        self.applier
            .start(snapshot.last_log_tick.clone())
            .expect("failed to start applier");

        workload(self.source_db());

        let source_tick = self.source_db().last_tick();
        let state = wait_for_catch_up(&self.applier, &source_tick, DEFAULT_TIMEOUT);
        Comparison {
            snapshot,
            state,
            source_tick,
        }
    }

    /// Waits until the replica has applied everything the source logged.
    pub fn catch_up(&self) -> ApplierState {
        let tick = self.source_db().last_tick();
        wait_for_catch_up(&self.applier, &tick, DEFAULT_TIMEOUT)
    }

    /// Checksum of a collection on both sides; `None` where it is missing.
    pub fn checksums(
        &self,
        collection: &str,
    ) -> (Option<CollectionChecksum>, Option<CollectionChecksum>) {
        let verifier = ChecksumVerifier::new(ChecksumOptions::with_data());
        (
            verifier.checksum(self.source_db(), collection).ok(),
            verifier.checksum(&self.replica, collection).ok(),
        )
    }

    /// Asserts that a collection has the same documents on both sides.
    ///
    /// # Panics
    ///
    /// Panics if the collection is missing on either side or differs.
    pub fn assert_same(&self, collection: &str) {
        let (source, replica) = self.checksums(collection);
        let source = source.unwrap_or_else(|| panic!("collection {collection} missing on source"));
        let replica =
            replica.unwrap_or_else(|| panic!("collection {collection} missing on replica"));
        assert_eq!(source, replica, "collection {collection} differs");
    }

    /// Asserts that a collection has the same properties and indexes on
    /// both sides, including ids.
    ///
    /// # Panics
    ///
    /// Panics on any difference.
    pub fn assert_same_definition(&self, collection: &str) {
        let source = self.source_db().collection(collection);
        let replica = self.replica.collection(collection);
        assert_eq!(source, replica, "collection {collection} definition differs");
        assert_eq!(
            self.source_db().indexes(collection).ok(),
            self.replica.indexes(collection).ok(),
            "indexes of {collection} differ"
        );
    }
}

impl Default for ReplicationPair {
    fn default() -> Self {
        Self::new()
    }
}

/// Source workloads shared by tests and benchmarks.
pub mod scenarios {
    use logship_core::{CollectionProperties, Database};
    use serde_json::json;

    /// Creates `name` and inserts `count` documents keyed `test0..`.
    pub fn documents(db: &Database, name: &str, count: usize) {
        if db.collection(name).is_none() {
            db.create_collection(name, CollectionProperties::default())
                .expect("failed to create collection");
        }
        for i in 0..count {
            db.insert(name, json!({"_key": format!("test{i}"), "value": i}))
                .expect("failed to insert");
        }
    }

    /// Creates a vertex collection with `vertices` documents and an edge
    /// collection linking consecutive vertices.
    pub fn graph(db: &Database, vertices: &str, edges: &str, count: usize) {
        documents(db, vertices, count);
        db.create_collection(edges, CollectionProperties::edge())
            .expect("failed to create edge collection");
        for i in 1..count {
            db.insert(
                edges,
                json!({
                    "_key": format!("e{i}"),
                    "_from": format!("{vertices}/test{}", i - 1),
                    "_to": format!("{vertices}/test{i}"),
                    "weight": i,
                }),
            )
            .expect("failed to insert edge");
        }
    }

    /// Inserts `count` documents into `name` in one transaction.
    pub fn transaction(db: &Database, name: &str, count: usize) {
        db.transaction(|txn| {
            for i in 0..count {
                txn.insert(name, json!({"_key": format!("tx{i}"), "value": i}))?;
            }
            Ok(())
        })
        .expect("transaction failed");
    }
}
