//! # logship testkit
//!
//! Test utilities for logship.
//!
//! This crate provides:
//! - A wired source/replica pair with the compare harness
//! - Shared source workloads
//! - Network fault injection
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use logship_testkit::prelude::*;
//!
//! #[test]
//! fn replicates_documents() {
//!     let pair = ReplicationPair::new();
//!     pair.compare(
//!         |db| scenarios::documents(db, "UnitTestsReplication", 5),
//!         |_| {},
//!         pair.config(),
//!     );
//!     pair.assert_same("UnitTestsReplication");
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faults;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faults::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use faults::*;
pub use fixtures::*;
pub use generators::*;
