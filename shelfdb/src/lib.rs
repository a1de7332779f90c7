pub mod config;
pub mod error;
pub mod query;
pub mod schema;
pub mod sequence;
pub mod storage;
pub mod store;
pub mod table;
pub mod util;
pub mod validation;

pub use config::StoreConfig;
pub use error::{InvalidMessages, Result, ShelfError};
pub use query::{Filter, Finder, Op, Query};
pub use schema::{EventKind, FieldDefinition, FieldType, Record, Schema, SchemaBuilder, ValueDomain};
pub use sequence::{MemorySequence, SequenceProvider};
pub use storage::Connection;
pub use store::Store;
pub use table::{IndexIssue, ReconcileReport, Table};
pub use validation::ValidationMode;
