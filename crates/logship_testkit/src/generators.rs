//! Property-based test generators using proptest.
//!
//! Provides strategies for document keys, bodies and whole source
//! workloads, plus [`apply_workload`] to run a workload against a source
//! database.

use logship_core::{Database, Tick};
use proptest::prelude::*;
use serde_json::{json, Value};

/// Strategy for document keys from a small pool, so operations collide.
pub fn key_strategy() -> impl Strategy<Value = String> {
    (0u8..24).prop_map(|n| format!("k{n}"))
}

/// Strategy for valid collection names.
pub fn collection_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z][a-zA-Z0-9_]{0,31}").expect("Invalid regex")
}

/// Strategy for canonical ticks.
pub fn tick_strategy() -> impl Strategy<Value = Tick> {
    prop_oneof![
        any::<u64>().prop_map(Tick::from),
        prop::string::string_regex("[1-9][0-9]{19,40}")
            .expect("Invalid regex")
            .prop_map(|s| Tick::parse(&s).expect("generated tick is canonical")),
    ]
}

/// Strategy for document bodies without system attributes.
pub fn body_strategy() -> impl Strategy<Value = Value> {
    (
        any::<i32>(),
        prop::option::of("[a-z]{0,12}"),
        prop::collection::vec(any::<bool>(), 0..4),
    )
        .prop_map(|(n, label, flags)| match label {
            Some(label) => json!({"n": n, "label": label, "flags": flags}),
            None => json!({"n": n, "flags": flags}),
        })
}

/// One write on the source.
#[derive(Debug, Clone)]
pub enum WriteOperation {
    /// Insert a document; fails if the key exists.
    Insert {
        /// Document key
        key: String,
        /// Document body
        body: Value,
    },
    /// Merge attributes into a document; fails if it is missing.
    Update {
        /// Document key
        key: String,
        /// Attributes to merge
        patch: Value,
    },
    /// Remove a document; fails if it is missing.
    Remove {
        /// Document key
        key: String,
    },
}

/// A unit of source work.
#[derive(Debug, Clone)]
pub enum WorkloadStep {
    /// A standalone write.
    Single(WriteOperation),
    /// Writes in one transaction, committed unless one of them fails.
    Transaction(Vec<WriteOperation>),
    /// Writes in one transaction that is then aborted.
    Aborted(Vec<WriteOperation>),
}

/// Strategy for a single write.
pub fn write_strategy() -> impl Strategy<Value = WriteOperation> {
    prop_oneof![
        3 => (key_strategy(), body_strategy())
            .prop_map(|(key, body)| WriteOperation::Insert { key, body }),
        2 => (key_strategy(), body_strategy())
            .prop_map(|(key, patch)| WriteOperation::Update { key, patch }),
        1 => key_strategy().prop_map(|key| WriteOperation::Remove { key }),
    ]
}

/// Strategy for one workload step.
pub fn step_strategy() -> impl Strategy<Value = WorkloadStep> {
    prop_oneof![
        4 => write_strategy().prop_map(WorkloadStep::Single),
        2 => prop::collection::vec(write_strategy(), 1..8).prop_map(WorkloadStep::Transaction),
        1 => prop::collection::vec(write_strategy(), 1..8).prop_map(WorkloadStep::Aborted),
    ]
}

/// Strategy for a workload of `min_steps..max_steps` steps.
pub fn workload_strategy(
    min_steps: usize,
    max_steps: usize,
) -> impl Strategy<Value = Vec<WorkloadStep>> {
    prop::collection::vec(step_strategy(), min_steps..max_steps)
}

/// Runs `steps` against `collection` on `db`.
///
/// Writes that fail (duplicate insert, missing document) are skipped; in a
/// transaction such a failure aborts the whole transaction. Returns the
/// number of steps that took effect.
pub fn apply_workload(db: &Database, collection: &str, steps: &[WorkloadStep]) -> usize {
    let mut effective = 0;
    for step in steps {
        let applied = match step {
            WorkloadStep::Single(op) => write(db, collection, op).is_ok(),
            WorkloadStep::Transaction(ops) => db
                .transaction(|txn| {
                    for op in ops {
                        match op {
                            WriteOperation::Insert { key, body } => {
                                txn.insert(collection, with_key(key, body))?;
                            }
                            WriteOperation::Update { key, patch } => {
                                txn.update(collection, key, patch.clone())?;
                            }
                            WriteOperation::Remove { key } => {
                                txn.remove(collection, key)?;
                            }
                        }
                    }
                    Ok(())
                })
                .is_ok(),
            WorkloadStep::Aborted(ops) => {
                let _ = db.transaction(|txn| {
                    for op in ops {
                        if let WriteOperation::Insert { key, body } = op {
                            // keys already present make the insert fail; either way it aborts
                            let _ = txn.insert(collection, with_key(key, body));
                        }
                    }
                    Err::<(), _>(logship_core::CoreError::transaction_aborted("aborted by workload"))
                });
                false
            }
        };
        if applied {
            effective += 1;
        }
    }
    effective
}

fn write(db: &Database, collection: &str, op: &WriteOperation) -> logship_core::CoreResult<()> {
    match op {
        WriteOperation::Insert { key, body } => db.insert(collection, with_key(key, body)).map(drop),
        WriteOperation::Update { key, patch } => db.update(collection, key, patch.clone()).map(drop),
        WriteOperation::Remove { key } => db.remove(collection, key).map(drop),
    }
}

fn with_key(key: &str, body: &Value) -> Value {
    let mut body = body.clone();
    if let Value::Object(map) = &mut body {
        map.insert("_key".to_string(), Value::String(key.to_string()));
    }
    body
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 64,
            max_shrink_iters: 500,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 16,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
