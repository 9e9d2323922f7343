//! Benchmark utilities.

use logship_core::{CollectionProperties, Database, Tick};
use rand::Rng;
use serde_json::json;
use std::sync::Arc;

/// Generate a random decimal tick with `digits` digits.
pub fn random_tick(digits: usize) -> Tick {
    let mut rng = rand::thread_rng();
    let mut s = String::with_capacity(digits);
    s.push(char::from(b'1' + rng.gen_range(0..9u8)));
    for _ in 1..digits {
        s.push(char::from(b'0' + rng.gen_range(0..10u8)));
    }
    Tick::parse(&s).expect("generated tick is canonical")
}

/// A source database with one collection of `count` documents whose bodies
/// carry `payload` bytes of filler.
pub fn source_with_documents(name: &str, count: usize, payload: usize) -> Arc<Database> {
    let db = Arc::new(Database::open_in_memory());
    db.create_collection(name, CollectionProperties::default())
        .expect("failed to create collection");
    let filler = "x".repeat(payload);
    for i in 0..count {
        db.insert(name, json!({"_key": format!("doc{i}"), "n": i, "filler": filler}))
            .expect("failed to insert");
    }
    db
}

/// Like [`source_with_documents`], but the inserts run in transactions of
/// `per_transaction` documents.
pub fn source_with_transactions(name: &str, count: usize, per_transaction: usize) -> Arc<Database> {
    let db = Arc::new(Database::open_in_memory());
    db.create_collection(name, CollectionProperties::default())
        .expect("failed to create collection");
    let mut next = 0;
    while next < count {
        let end = (next + per_transaction).min(count);
        db.transaction(|txn| {
            for i in next..end {
                txn.insert(name, json!({"_key": format!("doc{i}"), "n": i}))?;
            }
            Ok(())
        })
        .expect("transaction failed");
        next = end;
    }
    db
}
