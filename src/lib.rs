//! Embedded Record Store Library
//!
//! recordb persists entities as sets of numbered fields addressed by a primary key, with
//! secondary indexes for equality lookups. It is meant to be driven by one caller at a
//! time inside a single process.
//!
//! # Modules
//!
//! - `engine`: Entry point. Opens collections and runs offline maintenance.
//! - `collection`: Read/write session over one entity.
//! - `primary_key_file` / `data_file`: The two files holding an entity's records.
//! - `index`: Secondary indexes, their maintenance and their cold/warm initialization.
//! - `tree`: The red-black tree behind every index, and its wire codec.
//! - `defrag` / `statistics`: Compaction and dead-space accounting.
//!
//! # On-disk layout
//!
//! Every entity `E` owns `E.pk` (primary-key records), `E.dat` (field blocks), `E.meta`
//! (its schema as JSON) and one `E.<index>.idx` per persisted index.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use recordb::{
//!     config::StoreConfig,
//!     engine::StorageEngine,
//!     file_system::MemoryFileSystem,
//!     index::IndexDefinition,
//!     schema::{EntitySchema, Record},
//!     value::{FieldType, Value},
//! };
//!
//! fn main() -> recordb::Result<()> {
//!     let engine = StorageEngine::with_file_system(
//!         StoreConfig::new("/store"),
//!         Arc::new(MemoryFileSystem::new()),
//!     )?;
//!
//!     let schema = EntitySchema::builder("Person")
//!         .key(0, "id", FieldType::I64)
//!         .field(1, "age", FieldType::I32)
//!         .field(2, "name", FieldType::String)
//!         .build()?;
//!
//!     let mut people = engine.collection(schema)?;
//!     people.insert(Record::new(1).with(1, 30).with(2, "Ann"))?;
//!     people.create_index(IndexDefinition::new("by_age", 1).include(2))?;
//!
//!     let lookup = people.get_equals("by_age", &Value::I32(30))?.unwrap();
//!     assert_eq!(lookup.items[0].included_fields, vec![Value::from("Ann")]);
//!
//!     people.close()
//! }
//! ```

pub mod collection;
pub mod config;
pub mod data_file;
pub mod defrag;
pub mod encoding;
/// Entry point to the record store
pub mod engine;
pub mod error;
pub mod file_system;
pub mod helper;
pub mod index;
pub mod primary_key_file;
pub mod schema;
pub mod statistics;
pub mod tree;
pub mod value;

pub use error::{Error, Result};
