//! The continuous applier.
//!
//! ```text
//! ┌──────────┐ follow(cursor) ┌───────────┐ entries ┌───────────┐ units ┌────────────┐
//! │  source  │ ◀────────────── │  worker   │ ──────▶ │ assembler │ ────▶ │ ApplyTarget│
//! └──────────┘ ──────────────▶ │  thread   │         └───────────┘       └────────────┘
//!                  chunk       └─────┬─────┘
//!                                    │ publish ticks, counters
//!                                    ▼
//!                             RwLock<ApplierState>  ◀── state() from any thread
//! ```
//!
//! One worker thread per applier fetches chunks after its cursor, filters
//! them, assembles transactions and applies the results. The published ticks
//! change together under one write lock at the end of each chunk, so
//! observers never see a torn state. `stop()` is checked between chunks and
//! interrupts idle and retry waits.

use crate::assembler::{Assembled, TransactionAssembler};
use crate::client::ReplicationClient;
use crate::config::{ApplierConfig, IdleBackoff, RetryConfig};
use crate::error::{ApplierError, ApplierResult};
use crate::persistence::{PersistedState, StateStore};
use crate::state::{ApplierPhase, ApplierState, LastError};
use crate::sync::{self, SnapshotResult};
use crate::target::{apply_entries, ApplyTarget};
use crate::transport::Connector;
use logship_core::{CollectionId, LogEntry, LogOperation, Tick};
use logship_protocol::{Chunk, FilterConfig};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct Shared {
    connector: Arc<dyn Connector>,
    target: Arc<dyn ApplyTarget>,
    store: Arc<dyn StateStore>,
    config: RwLock<Option<ApplierConfig>>,
    state: RwLock<ApplierState>,
    stop_requested: AtomicBool,
    wakeup_lock: Mutex<()>,
    wakeup: Condvar,
}

impl Shared {
    fn stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        let _guard = self.wakeup_lock.lock();
        self.wakeup.notify_all();
    }

    /// Sleeps for `duration` unless a stop is requested first. Returns false
    /// if the worker should exit.
    fn pause(&self, duration: Duration) -> bool {
        let mut guard = self.wakeup_lock.lock();
        if self.stopping() {
            return false;
        }
        self.wakeup.wait_for(&mut guard, duration);
        !self.stopping()
    }

    fn persist(&self) -> ApplierResult<()> {
        let persisted = {
            let state = self.state.read();
            PersistedState {
                last_applied_tick: state.last_applied_tick.clone(),
                last_processed_tick: state.last_processed_tick.clone(),
                server_id: state.server_id,
                configuration: self.config.read().clone(),
            }
        };
        self.store.save(&persisted)
    }

    fn fail(&self, err: &ApplierError) {
        {
            let mut state = self.state.write();
            state.phase = ApplierPhase::Errored;
            state.last_error = Some(LastError::from(err));
            state.set_progress(format!("stopped by error {}", err.code()));
        }
        tracing::error!(code = %err.code(), error = %err, "applier stopped with error");
        if let Err(persist_err) = self.persist() {
            tracing::warn!(error = %persist_err, "failed to save applier state");
        }
    }
}

/// Replays a source's log into a replica, continuously.
///
/// The applier is configured once with [`properties`](Self::properties) and
/// then started from a tick, usually the boundary tick returned by an
/// initial [`sync`](Self::sync). It runs on its own thread until
/// [`stop`](Self::stop) is called or a fatal error moves it to
/// [`ApplierPhase::Errored`].
///
/// # Example
///
/// ```
/// use logship_applier::{Applier, ApplierConfig, LoopbackConnector, MemoryStateStore};
/// use logship_core::Database;
/// use logship_source::{ReplicationServer, SourceConfig};
/// use std::sync::Arc;
///
/// let source = Arc::new(ReplicationServer::new(
///     Arc::new(Database::open_in_memory()),
///     SourceConfig::default(),
/// ));
/// source.add_user("replicator", "secret");
///
/// let connector = Arc::new(LoopbackConnector::new());
/// connector.register("loop://primary", source);
///
/// let replica = Arc::new(Database::open_in_memory());
/// let applier = Applier::new(connector, replica, Arc::new(MemoryStateStore::new())).unwrap();
/// applier
///     .properties(ApplierConfig::new("loop://primary", "replicator", "secret"))
///     .unwrap();
///
/// let snapshot = applier.sync(&applier.configuration().unwrap()).unwrap();
/// applier.start(snapshot.last_log_tick).unwrap();
/// assert!(applier.state().is_running());
/// applier.stop().unwrap();
/// ```
pub struct Applier {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Applier {
    /// Creates a stopped applier, restoring configuration and the last
    /// applied tick from `store`.
    pub fn new(
        connector: Arc<dyn Connector>,
        target: Arc<dyn ApplyTarget>,
        store: Arc<dyn StateStore>,
    ) -> ApplierResult<Self> {
        let persisted = store.load()?.unwrap_or_default();
        let mut state = ApplierState::default();
        state.reset_ticks(&persisted.last_applied_tick);
        state.advance(
            persisted.last_processed_tick.clone(),
            persisted.last_applied_tick.clone(),
            persisted.last_processed_tick.clone(),
        );
        state.server_id = persisted.server_id;

        Ok(Self {
            shared: Arc::new(Shared {
                connector,
                target,
                store,
                config: RwLock::new(persisted.configuration),
                state: RwLock::new(state),
                stop_requested: AtomicBool::new(false),
                wakeup_lock: Mutex::new(()),
                wakeup: Condvar::new(),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Checks and stores a configuration.
    ///
    /// The source must accept the credentials. Rejected while running.
    pub fn properties(&self, config: ApplierConfig) -> ApplierResult<()> {
        let _worker = self.worker.lock();
        if self.shared.state.read().is_running() {
            return Err(ApplierError::Running);
        }
        config.validate()?;
        let client = ReplicationClient::connect(self.shared.connector.as_ref(), &config)?;
        client.login()?;

        *self.shared.config.write() = Some(config);
        self.shared.persist()?;
        tracing::debug!(endpoint = %client.endpoint(), "applier configured");
        Ok(())
    }

    /// The stored configuration.
    pub fn configuration(&self) -> Option<ApplierConfig> {
        self.shared.config.read().clone()
    }

    /// Copies a snapshot of the source into the replica.
    ///
    /// Rejected while running.
    pub fn sync(&self, config: &ApplierConfig) -> ApplierResult<SnapshotResult> {
        let _worker = self.worker.lock();
        if self.shared.state.read().is_running() {
            return Err(ApplierError::Running);
        }
        sync::sync(self.shared.connector.as_ref(), self.shared.target.as_ref(), config)
    }

    /// Starts applying entries after `from_tick`.
    ///
    /// Valid only while stopped; clears the last error. Logging in happens
    /// before this returns, so bad credentials fail here.
    pub fn start(&self, from_tick: Tick) -> ApplierResult<()> {
        self.start_at(from_tick, None)
    }

    /// Starts the worker after `from_tick`. Entries up to `replayed` were
    /// handled by an earlier run; they rebuild open transactions but are not
    /// applied again.
    fn start_at(&self, from_tick: Tick, replayed: Option<Tick>) -> ApplierResult<()> {
        let mut worker = self.worker.lock();
        match self.shared.state.read().phase {
            ApplierPhase::Stopped => {}
            ApplierPhase::Running => return Err(ApplierError::Running),
            phase => {
                return Err(ApplierError::InvalidState {
                    operation: "start",
                    state: phase.as_str(),
                })
            }
        }
        let config = self.shared.config.read().clone().ok_or_else(|| {
            ApplierError::InvalidConfiguration("no configuration has been set".into())
        })?;
        config.validate()?;

        let client = ReplicationClient::connect(self.shared.connector.as_ref(), &config)?;
        let login = client.login()?;

        if let Some(finished) = worker.take() {
            join(finished);
        }
        self.shared.stop_requested.store(false, Ordering::SeqCst);
        {
            let mut state = self.shared.state.write();
            if let Some(previous) = state.server_id.filter(|id| *id != login.server_id) {
                tracing::warn!(%previous, current = %login.server_id, "source identity changed");
            }
            state.phase = ApplierPhase::Running;
            state.last_error = None;
            state.reset_ticks(&from_tick);
            if let Some(replayed) = &replayed {
                state.advance(replayed.clone(), from_tick.clone(), replayed.clone());
            }
            state.server_id = Some(login.server_id);
            state.open_transactions = 0;
            state.total_requests += 1;
            state.set_progress(format!("starting from tick {from_tick}"));
        }
        tracing::info!(endpoint = %config.endpoint, from = %from_tick, "applier started");

        let shared = Arc::clone(&self.shared);
        let task = Worker::new(shared, client, config, from_tick, replayed);
        let handle = thread::Builder::new()
            .name("logship-applier".into())
            .spawn(move || task.run())
            .map_err(|e| {
                self.shared.state.write().phase = ApplierPhase::Stopped;
                ApplierError::Internal(format!("failed to spawn applier thread: {e}"))
            })?;
        *worker = Some(handle);
        Ok(())
    }

    /// Starts from the last applied tick that was saved.
    ///
    /// Transactions that were open when the applier stopped are read again
    /// from their begin markers. Entries the earlier run already applied,
    /// up to the saved processed tick, are skipped.
    pub fn resume(&self) -> ApplierResult<()> {
        let persisted = self.shared.store.load()?.unwrap_or_default();
        let replayed = (persisted.last_processed_tick > persisted.last_applied_tick)
            .then_some(persisted.last_processed_tick);
        if let Some(tick) = &replayed {
            tracing::debug!(
                from = %persisted.last_applied_tick,
                until = %tick,
                "re-reading entries of open transactions"
            );
        }
        self.start_at(persisted.last_applied_tick, replayed)
    }

    /// Stops the applier and waits for the worker to finish its chunk.
    ///
    /// Valid while running or errored; stopping a stopped applier does
    /// nothing. The last error stays visible until the next start.
    pub fn stop(&self) -> ApplierResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_none() && !self.shared.state.read().is_running() {
            let mut state = self.shared.state.write();
            state.phase = ApplierPhase::Stopped;
            return Ok(());
        }
        self.shared.request_stop();
        if let Some(handle) = worker.take() {
            join(handle);
        }
        {
            let mut state = self.shared.state.write();
            state.phase = ApplierPhase::Stopped;
            state.open_transactions = 0;
            state.set_progress("stopped");
        }
        self.shared.persist()?;
        tracing::info!("applier stopped");
        Ok(())
    }

    /// Deletes the saved state and configuration. Valid only while stopped.
    pub fn forget(&self) -> ApplierResult<()> {
        let _worker = self.worker.lock();
        match self.shared.state.read().phase {
            ApplierPhase::Stopped => {}
            ApplierPhase::Running => return Err(ApplierError::Running),
            phase => {
                return Err(ApplierError::InvalidState {
                    operation: "forget",
                    state: phase.as_str(),
                })
            }
        }
        self.shared.store.remove()?;
        *self.shared.config.write() = None;
        *self.shared.state.write() = ApplierState::default();
        tracing::info!("applier state forgotten");
        Ok(())
    }

    /// A copy of the current state.
    pub fn state(&self) -> ApplierState {
        self.shared.state.read().clone()
    }
}

impl Drop for Applier {
    fn drop(&mut self) {
        self.shared.request_stop();
        if let Some(handle) = self.worker.get_mut().take() {
            join(handle);
        }
    }
}

fn join(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        tracing::error!("applier thread panicked");
    }
}

struct Worker {
    shared: Arc<Shared>,
    client: ReplicationClient,
    config: ApplierConfig,
    filter: FilterConfig,
    assembler: TransactionAssembler,
    ignored: HashSet<CollectionId>,
    idle: IdleBackoff,
    retry: RetryConfig,
    cursor: Tick,
    applied: Tick,
    replayed: Option<Tick>,
}

impl Worker {
    fn new(
        shared: Arc<Shared>,
        client: ReplicationClient,
        config: ApplierConfig,
        from: Tick,
        replayed: Option<Tick>,
    ) -> Self {
        Self {
            shared,
            client,
            filter: config.filter(),
            assembler: TransactionAssembler::new(config.max_open_transaction_entries),
            ignored: HashSet::new(),
            idle: config.idle_backoff(),
            retry: config.retry(),
            cursor: from.clone(),
            applied: from,
            replayed,
            config,
        }
    }

    fn run(mut self) {
        match self.run_loop() {
            Ok(()) => tracing::debug!(tick = %self.cursor, "applier loop finished"),
            Err(err) => {
                self.publish(None, 0, 0);
                self.shared.fail(&err);
            }
        }
    }

    fn run_loop(&mut self) -> ApplierResult<()> {
        while !self.shared.stopping() {
            let Some(chunk) = self.fetch()? else {
                break;
            };
            chunk.validate(&self.cursor)?;
            if !chunk.from_present {
                if self.config.require_from_present {
                    return Err(ApplierError::StartTickNotPresent {
                        tick: self.cursor.clone(),
                    });
                }
                tracing::warn!(tick = %self.cursor, "entries after the start tick were pruned on the source");
            }

            if chunk.is_empty() {
                self.publish(Some(chunk.available_tick), 0, 0);
                let wait = self.idle.next_wait();
                if !self.shared.pause(wait) {
                    break;
                }
                continue;
            }

            self.idle.reset();
            self.process(chunk)?;
        }
        Ok(())
    }

    fn fetch(&mut self) -> ApplierResult<Option<Chunk>> {
        let mut attempt = 0u32;
        loop {
            self.shared.state.write().total_requests += 1;
            match self.client.follow(&self.cursor, self.config.chunk_size) {
                Ok(chunk) => {
                    tracing::debug!(
                        from = %self.cursor,
                        entries = chunk.entries.len(),
                        available = %chunk.available_tick,
                        "fetched chunk"
                    );
                    return Ok(Some(chunk));
                }
                Err(err) if err.is_retryable() => {
                    attempt += 1;
                    self.shared.state.write().total_failed_connects += 1;
                    if attempt > self.retry.max_attempts {
                        return Err(ApplierError::NoResponse {
                            attempts: attempt,
                            message: err.to_string(),
                        });
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "fetch failed, retrying"
                    );
                    if !self.shared.pause(delay) {
                        return Ok(None);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn process(&mut self, chunk: Chunk) -> ApplierResult<()> {
        let received = chunk.entries.len() as u64;
        let mut skipped = 0u64;
        let before = self.cursor.clone();
        let result = self.process_entries(chunk.entries, &mut skipped);
        self.publish(Some(chunk.available_tick), received, skipped);
        result?;
        if self.cursor != before {
            self.shared.persist()?;
        }
        Ok(())
    }

    fn process_entries(&mut self, entries: Vec<LogEntry>, skipped: &mut u64) -> ApplierResult<()> {
        for entry in entries {
            let tick = entry.tick.clone();
            if self.skip(&entry) {
                *skipped += 1;
            } else {
                self.handle(entry)?;
            }
            self.cursor = tick.clone();
            if self.replayed.as_ref().is_some_and(|t| &tick >= t) {
                self.replayed = None;
            }
            if self.assembler.open_count() == 0 {
                self.applied = tick;
            }
        }
        Ok(())
    }

    /// Returns true if the collection filter excludes the entry.
    fn skip(&mut self, entry: &LogEntry) -> bool {
        let Some(collection) = &entry.collection else {
            return false;
        };
        if self.ignored.contains(&collection.id) {
            return true;
        }
        if self.filter.includes_ref(collection) {
            return false;
        }
        if let LogOperation::RenameCollection { new_name } = &entry.operation {
            if self.filter.in_scope(new_name, collection.is_system()) {
                tracing::warn!(
                    collection = %collection.name,
                    new_name = %new_name,
                    "collection renamed into scope; a resync is needed to replicate it"
                );
                self.ignored.insert(collection.id);
            }
        }
        true
    }

    fn handle(&mut self, entry: LogEntry) -> ApplierResult<()> {
        let replayed = self.replayed.as_ref().is_some_and(|t| &entry.tick <= t);
        let tick = entry.tick.clone();
        match self.assembler.push(entry)? {
            Assembled::Standalone(_) | Assembled::Committed { .. } if replayed => {
                tracing::trace!(%tick, "skipping entry applied before the restart");
                Ok(())
            }
            Assembled::Standalone(entry) => self.apply(std::slice::from_ref(&entry)),
            Assembled::Committed {
                transaction,
                entries,
            } => {
                tracing::trace!(%transaction, entries = entries.len(), "applying transaction");
                self.apply(&entries)
            }
            Assembled::Aborted {
                transaction,
                discarded,
            } => {
                tracing::debug!(%transaction, discarded, "discarded aborted transaction");
                Ok(())
            }
            Assembled::Buffered | Assembled::Ignored => Ok(()),
        }
    }

    fn apply(&self, entries: &[LogEntry]) -> ApplierResult<()> {
        apply_entries(self.shared.target.as_ref(), &self.filter, entries)
    }

    fn publish(&self, available: Option<Tick>, received: u64, skipped: u64) {
        let mut state = self.shared.state.write();
        let available = available.unwrap_or_else(|| state.last_available_tick.clone());
        let processed = match &self.replayed {
            Some(replayed) => self.cursor.clone().max_of(replayed.clone()),
            None => self.cursor.clone(),
        };
        state.advance(processed, self.applied.clone(), available);
        state.total_events += received;
        state.skipped_events += skipped;
        state.open_transactions = self.assembler.open_count();
        if received > 0 {
            state.set_progress(format!(
                "processed {received} entries up to tick {}",
                self.cursor
            ));
        }
    }
}
