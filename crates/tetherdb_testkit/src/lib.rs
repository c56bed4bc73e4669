//! # TetherDB Testkit
//!
//! Test utilities for TetherDB.
//!
//! This crate provides:
//! - Store fixtures over a sample `Person`/`Dog`/`Note` schema
//! - Property-based generators for detached object graphs
//! - Event-loop pumping and callback recording helpers
//! - Structural rendering of object graphs for comparisons
//! - Cross-module scenario tests and stress helpers
//!
//! ## Usage
//!
//! ```rust
//! use tetherdb_testkit::prelude::*;
//!
//! let store = TestStore::memory();
//! let handle = store.open();
//! handle
//!     .execute_transaction(|h| h.copy_to_store(&person(1, "Ada")).map(drop))
//!     .unwrap();
//! assert_eq!(handle.count("Person").unwrap(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod pump;
pub mod shape;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::pump::*;
    pub use crate::shape::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use pump::*;
pub use shape::*;
pub use stress::*;
