//! # TetherDB Core
//!
//! Transaction and object-lifecycle layer of the TetherDB embedded object
//! store.
//!
//! This crate provides:
//! - Thread-confined, reference-counted store handles
//! - Synchronous transactions with rollback on error or panic
//! - Asynchronous transactions on a worker pool, with completion callbacks
//!   delivered to the submitting thread's notification channel
//! - Copy-in and copy-out of detached object graphs with identity
//!   preservation and cycle handling
//! - Schema validation, migrations and whole-store maintenance
//!
//! ## Example
//!
//! ```rust
//! use tetherdb_core::{
//!     Handle, Object, ObjectSchema, PropertyType, StaticSchemaMediator, StoreConfiguration,
//! };
//!
//! let person = ObjectSchema::builder("Person")
//!     .property("id", PropertyType::Integer)
//!     .property("name", PropertyType::Text)
//!     .primary_key("id")
//!     .build()?;
//! let config = StoreConfiguration::builder()
//!     .in_memory("crate-docs")
//!     .mediator(StaticSchemaMediator::new(vec![person])?)
//!     .build()?;
//!
//! let handle = Handle::open(&config)?;
//! handle.execute_transaction(|h| {
//!     h.copy_to_store(&Object::new("Person").with("id", 1).with("name", "Ada"))
//!         .map(drop)
//! })?;
//! assert_eq!(handle.count("Person")?, 1);
//! # Ok::<(), tetherdb_core::CoreError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
pub mod engine;
mod error;
mod handle;
mod maintenance;
mod materialize;
mod migration;
pub mod notify;
mod object;
mod schema;
mod transaction;
mod types;
mod value;

pub use config::{
    default_configuration, remove_default_configuration, set_default_configuration, InitialData,
    LocationKey, StoreConfiguration, StoreConfigurationBuilder, StoreLocation, DEFAULT_FILE_NAME,
};
pub use error::{CoreError, CoreResult, ErrorKind};
pub use handle::{Handle, HandleRegistry};
pub use maintenance::{
    compact_store, delete_store, inspect_store, migrate_store, StoreSummary, TableSummary,
};
pub use materialize::{GraphMaterializer, UNBOUNDED_DEPTH};
pub use migration::{FnMigration, Migration, MigrationContext};
pub use notify::{EventLoop, NotificationChannel};
pub use object::{Field, ManagedObject, Object, ObjectData, ObjectId, ObjectKind};
pub use schema::{
    table_name_for, ColumnInfo, ColumnIndices, ObjectSchema, ObjectSchemaBuilder, Property,
    PropertyType, SchemaMediator, StaticSchemaMediator, TABLE_PREFIX,
};
pub use transaction::{
    AsyncTransaction, AsyncTransactionPipeline, CancellableTask, TaskState, TransactionRunner,
    TransactionState,
};
pub use types::{PrimaryKey, RowId, SessionId, Version};
pub use value::Value;
