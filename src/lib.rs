// Core functionality
pub mod core {
    pub mod config;
    pub mod error;
}

// Index storage
pub mod storage {
    pub mod index;
    pub mod query;
    pub mod schema;
}

// Indexing pipeline
pub mod indexing {
    pub mod discovery;
    pub mod hasher;
    pub mod progress;
    pub mod staleness;
    pub mod updater;
    pub mod watch;
}

// Record serialization
pub mod codec {
    pub mod json;
    pub mod record;
}

// Public façade
pub mod bank {
    pub mod facade;
    pub mod lazy;
    pub mod source;
}

// Re-export commonly used types
pub use bank::facade::Bank;
pub use bank::lazy::{LazyRecords, Slot};
pub use bank::source::{RecordSource, SourceRegistry};
pub use codec::json::{JsonCodec, JsonRecord};
pub use codec::record::{DecodedRecord, RecordCodec, Summary};
pub use crate::core::config::BankConfig;
pub use crate::core::error::{Error, Result};
pub use indexing::hasher::{hash_directory, hash_file, HashManifest};
pub use indexing::progress::{ConsoleBar, Progress, ProgressBar};
pub use indexing::updater::{IndexWarning, SchemaStatus, UpdateOptions, UpdateReport};
pub use indexing::watch::BankWatcher;
pub use storage::index::{IndexRow, IndexStore};
pub use storage::query::{Query, QueryValue};
pub use storage::schema::{Attributes, FieldKind, Schema, SchemaVersion, Value};
