use super::query::{CompiledQuery, Filterable, Predicate};
use super::schema::{Attributes, Value};
use crate::core::error::{Error, Result};
use redb::{Database, ReadableTable, Table, TableDefinition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Key: identity, value: JSON serialized IndexRow
const ROWS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("rows");

/// Key: relative source path, value: JSON serialized FileRecord
const FILES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("files");

/// Key: metadata name, value: plain string
const META_TABLE: TableDefinition<&str, &str> = TableDefinition::new("meta");

const META_SCHEMA_VERSION_KEY: &str = "schema_version";
const META_LAST_UPDATED_KEY: &str = "last_updated";

/// One indexed record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRow {
    /// Globally unique record identity
    pub identity: String,
    /// Summary attributes, conformed to the bank's schema
    pub attributes: Attributes,
    /// Path of the containing file, relative to the bank root
    pub source_path: String,
    /// Modification time of the file when the row was written
    pub file_mtime: f64,
    /// Content hash of the file, when it was computed
    pub file_hash: Option<String>,
}

impl IndexRow {
    /// Look up an attribute, presenting missing ones as `Null`
    pub fn get(&self, field: &str) -> &Value {
        self.attributes.get(field).unwrap_or(&Value::Null)
    }

    fn to_json(&self) -> Result<String> {
        to_json(self, "index row")
    }
}

impl Filterable for IndexRow {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn attribute(&self, field: &str) -> Option<&Value> {
        self.attributes.get(field)
    }

    fn file_mtime(&self) -> f64 {
        self.file_mtime
    }
}

/// Last indexed state of one file on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub mtime: f64,
    pub size: u64,
    pub hash: Option<String>,
    /// Identities decoded from this file, possibly none
    pub identities: Vec<String>,
}

/// Persisted index-wide state
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMetadata {
    pub schema_version: String,
    /// Seconds since the Unix epoch of the last successful update
    pub last_updated: f64,
}

impl IndexMetadata {
    pub fn now(schema_version: &str) -> Self {
        Self {
            schema_version: schema_version.to_string(),
            last_updated: unix_now(),
        }
    }
}

/// Rows to delete, by identity or by containing file
#[derive(Debug, Clone)]
pub enum Selection {
    Identities(Vec<String>),
    SourcePaths(Vec<String>),
}

/// A set of changes committed in one transaction
#[derive(Debug, Clone, Default)]
pub struct IndexBatch {
    /// File records to write; rows previously attributed to the file but
    /// absent from `rows` are deleted
    pub files: Vec<(String, FileRecord)>,
    /// Rows to insert or replace by identity
    pub rows: Vec<IndexRow>,
    /// Files gone from disk; their rows and records are deleted
    pub removed_paths: Vec<String>,
    pub metadata: Option<IndexMetadata>,
    /// Only write `metadata` when the batch changed at least one row
    pub metadata_if_changed: bool,
    /// Empty the index before applying the rest of the batch
    pub clear: bool,
}

impl IndexBatch {
    pub fn is_empty(&self) -> bool {
        !self.clear
            && self.files.is_empty()
            && self.rows.is_empty()
            && self.removed_paths.is_empty()
            && (self.metadata.is_none() || self.metadata_if_changed)
    }
}

/// Row counts changed by a committed write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

impl BatchOutcome {
    pub fn changed(&self) -> bool {
        self.added + self.updated + self.removed > 0
    }
}

/// Persistent, queryable summary index backed by redb.
///
/// The database file is opened lazily on first access; until the first
/// write, an absent artifact reads as an empty index. Every mutation runs in one write
/// transaction, so scans never see half of a batch.
pub struct IndexStore {
    path: PathBuf,
    db: RwLock<Option<Database>>,
}

impl IndexStore {
    /// Bind to the index at `path` without touching the disk
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            db: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the artifact has been created
    pub fn exists(&self) -> bool {
        self.db
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
            || self.path.is_file()
    }

    /// Number of rows in the index
    pub fn row_count(&self) -> Result<usize> {
        self.read(|db| {
            let read_txn = db.begin_read().map_err(db_err("Failed to begin read transaction"))?;
            let table = read_txn
                .open_table(ROWS_TABLE)
                .map_err(db_err("Failed to open table"))?;
            let len = table.len().map_err(db_err("Failed to count rows"))?;
            Ok(len as usize)
        })
        .map(Option::unwrap_or_default)
    }

    /// Time of the last successful update, if any
    pub fn last_updated(&self) -> Result<Option<f64>> {
        Ok(self.metadata()?.map(|m| m.last_updated))
    }

    pub fn metadata(&self) -> Result<Option<IndexMetadata>> {
        self.read(|db| {
            let read_txn = db.begin_read().map_err(db_err("Failed to begin read transaction"))?;
            let table = read_txn
                .open_table(META_TABLE)
                .map_err(db_err("Failed to open table"))?;
            let version = read_str(&table, META_SCHEMA_VERSION_KEY)?;
            let updated = read_str(&table, META_LAST_UPDATED_KEY)?;
            Ok(match (version, updated) {
                (Some(schema_version), Some(updated)) => Some(IndexMetadata {
                    schema_version,
                    last_updated: updated.parse().map_err(|e| {
                        Error::Database(format!("Corrupt last_updated value '{}': {}", updated, e))
                    })?,
                }),
                _ => None,
            })
        })
        .map(Option::flatten)
    }

    /// All file records keyed by relative path
    pub fn file_records(&self) -> Result<BTreeMap<String, FileRecord>> {
        self.read(|db| {
            let read_txn = db.begin_read().map_err(db_err("Failed to begin read transaction"))?;
            let table = read_txn
                .open_table(FILES_TABLE)
                .map_err(db_err("Failed to open table"))?;
            let mut records = BTreeMap::new();
            for item in table.iter().map_err(db_err("Failed to iterate table"))? {
                let (key, value) = item.map_err(db_err("Failed to read table item"))?;
                let record: FileRecord = from_json(value.value(), "file record")?;
                records.insert(key.value().to_string(), record);
            }
            Ok(records)
        })
        .map(Option::unwrap_or_default)
    }

    /// Rows matching the query, in identity order, truncated to the query limit
    pub fn scan(&self, query: &CompiledQuery) -> Result<Vec<IndexRow>> {
        let limit = query.limit.unwrap_or(usize::MAX);
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.read(|db| {
            let read_txn = db.begin_read().map_err(db_err("Failed to begin read transaction"))?;
            let table = read_txn
                .open_table(ROWS_TABLE)
                .map_err(db_err("Failed to open table"))?;
            let mut results = Vec::new();

            // Identity lookups avoid a full scan; BTreeSet order equals key order.
            let ids = query.predicates.iter().find_map(|p| match p {
                Predicate::Identity(ids) => Some(ids),
                _ => None,
            });
            if let Some(ids) = ids {
                for id in ids {
                    if let Some(row) = read_json::<IndexRow, _>(&table, id, "index row")? {
                        if query.matches(&row) {
                            results.push(row);
                            if results.len() >= limit {
                                break;
                            }
                        }
                    }
                }
                return Ok(results);
            }

            for item in table.iter().map_err(db_err("Failed to iterate table"))? {
                let (_key, value) = item.map_err(db_err("Failed to read table item"))?;
                let row: IndexRow = from_json(value.value(), "index row")?;
                if query.matches(&row) {
                    results.push(row);
                    if results.len() >= limit {
                        break;
                    }
                }
            }
            Ok(results)
        })
        .map(Option::unwrap_or_default)
    }

    /// Insert rows, replacing any existing row with the same identity
    pub fn insert_or_replace(&self, rows: Vec<IndexRow>) -> Result<BatchOutcome> {
        self.apply(IndexBatch {
            rows,
            ..IndexBatch::default()
        })
    }

    /// Delete rows by identity or by source path. Returns the number of rows removed.
    pub fn delete(&self, selection: Selection) -> Result<usize> {
        match selection {
            Selection::SourcePaths(paths) => Ok(self
                .apply(IndexBatch {
                    removed_paths: paths,
                    ..IndexBatch::default()
                })?
                .removed),
            Selection::Identities(ids) => self.write(|db| {
                let write_txn = db
                    .begin_write()
                    .map_err(db_err("Failed to begin write transaction"))?;
                let mut removed = 0;
                {
                    let mut rows = write_txn
                        .open_table(ROWS_TABLE)
                        .map_err(db_err("Failed to open table"))?;
                    let mut files = write_txn
                        .open_table(FILES_TABLE)
                        .map_err(db_err("Failed to open table"))?;
                    for id in &ids {
                        let Some(row) = read_json::<IndexRow, _>(&rows, id, "index row")? else {
                            continue;
                        };
                        rows.remove(id.as_str())
                            .map_err(db_err("Failed to remove index row"))?;
                        forget_identity(&mut files, &row.source_path, id)?;
                        removed += 1;
                    }
                }
                write_txn.commit().map_err(db_err("Failed to commit transaction"))?;
                Ok(removed)
            }),
        }
    }

    /// Commit a batch of changes atomically
    pub fn apply(&self, batch: IndexBatch) -> Result<BatchOutcome> {
        if batch.is_empty() {
            return Ok(BatchOutcome::default());
        }
        self.write(|db| {
            let write_txn = db.begin_write().map_err(db_err("Failed to begin write transaction"))?;
            let mut outcome = BatchOutcome::default();
            if batch.clear {
                for table in [ROWS_TABLE, FILES_TABLE, META_TABLE] {
                    write_txn
                        .delete_table(table)
                        .map_err(db_err("Failed to clear table"))?;
                }
                write_txn
                    .open_table(META_TABLE)
                    .map_err(db_err("Failed to open table"))?;
            }
            {
                let mut rows = write_txn
                    .open_table(ROWS_TABLE)
                    .map_err(db_err("Failed to open table"))?;
                let mut files = write_txn
                    .open_table(FILES_TABLE)
                    .map_err(db_err("Failed to open table"))?;

                // Identities each touched path keeps after this batch.
                let mut kept: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
                for path in &batch.removed_paths {
                    kept.entry(path.as_str()).or_default();
                }
                for (path, _) in &batch.files {
                    kept.entry(path.as_str()).or_default();
                }
                for row in &batch.rows {
                    if let Some(ids) = kept.get_mut(row.source_path.as_str()) {
                        ids.insert(row.identity.as_str());
                    }
                }

                // Drop rows that vanished from touched files.
                let stale = stale_identities(&rows, &files, &kept)?;
                for id in &stale {
                    if rows
                        .remove(id.as_str())
                        .map_err(db_err("Failed to remove index row"))?
                        .is_some()
                    {
                        outcome.removed += 1;
                    }
                }
                for path in &batch.removed_paths {
                    files
                        .remove(path.as_str())
                        .map_err(db_err("Failed to remove file record"))?;
                }

                for row in &batch.rows {
                    let previous = read_json::<IndexRow, _>(&rows, &row.identity, "index row")?;
                    match previous {
                        Some(prev) => {
                            if prev.source_path != row.source_path
                                && !kept.contains_key(prev.source_path.as_str())
                            {
                                forget_identity(&mut files, &prev.source_path, &row.identity)?;
                            }
                            outcome.updated += 1;
                        }
                        None => outcome.added += 1,
                    }
                    rows.insert(row.identity.as_str(), row.to_json()?.as_str())
                        .map_err(db_err("Failed to insert index row"))?;
                }

                for (path, record) in &batch.files {
                    let json = to_json(record, "file record")?;
                    files
                        .insert(path.as_str(), json.as_str())
                        .map_err(db_err("Failed to insert file record"))?;
                }

                let write_meta = !batch.metadata_if_changed || outcome.changed();
                if let Some(meta) = batch.metadata.as_ref().filter(|_| write_meta) {
                    let mut table = write_txn
                        .open_table(META_TABLE)
                        .map_err(db_err("Failed to open table"))?;
                    table
                        .insert(META_SCHEMA_VERSION_KEY, meta.schema_version.as_str())
                        .map_err(db_err("Failed to store schema version"))?;
                    table
                        .insert(META_LAST_UPDATED_KEY, meta.last_updated.to_string().as_str())
                        .map_err(db_err("Failed to store last_updated"))?;
                }
            }
            write_txn.commit().map_err(db_err("Failed to commit transaction"))?;
            Ok(outcome)
        })
    }

    fn read<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<Option<T>> {
        {
            let guard = self.db.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(db) = guard.as_ref() {
                return f(db).map(Some);
            }
        }
        if !self.path.is_file() {
            return Ok(None);
        }
        let mut guard = self.db.write().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(open_database(&self.path)?);
        }
        guard.as_ref().map(f).transpose()
    }

    fn write<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        {
            let guard = self.db.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(db) = guard.as_ref() {
                return f(db);
            }
        }
        let mut guard = self.db.write().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(if self.path.is_file() {
                open_database(&self.path)?
            } else {
                create_database(&self.path)?
            });
        }
        match guard.as_ref() {
            Some(db) => f(db),
            None => Err(Error::Database("Index database unavailable".to_string())),
        }
    }
}

/// Identities to delete because their file is gone or no longer yields them
fn stale_identities(
    rows: &Table<&'static str, &'static str>,
    files: &Table<&'static str, &'static str>,
    kept: &BTreeMap<&str, BTreeSet<&str>>,
) -> Result<Vec<String>> {
    let mut stale = Vec::new();
    let mut unrecorded = BTreeSet::new();

    for (path, keep) in kept {
        match read_json::<FileRecord, _>(files, path, "file record")? {
            Some(record) => {
                for id in record.identities {
                    if keep.contains(id.as_str()) {
                        continue;
                    }
                    let owned = read_json::<IndexRow, _>(rows, &id, "index row")?
                        .is_some_and(|row| row.source_path == *path);
                    if owned {
                        stale.push(id);
                    }
                }
            }
            None => {
                unrecorded.insert(*path);
            }
        }
    }

    // Rows written without a file record can only be found by scanning.
    if !unrecorded.is_empty() {
        for item in rows.iter().map_err(db_err("Failed to iterate table"))? {
            let (_key, value) = item.map_err(db_err("Failed to read table item"))?;
            let row: IndexRow = from_json(value.value(), "index row")?;
            let path = row.source_path.as_str();
            if unrecorded.contains(path)
                && !kept.get(path).is_some_and(|keep| keep.contains(row.identity.as_str()))
            {
                stale.push(row.identity);
            }
        }
    }
    Ok(stale)
}

fn forget_identity(
    files: &mut Table<&'static str, &'static str>,
    path: &str,
    id: &str,
) -> Result<()> {
    if let Some(mut record) = read_json::<FileRecord, _>(files, path, "file record")? {
        record.identities.retain(|known| known != id);
        let json = to_json(&record, "file record")?;
        files
            .insert(path, json.as_str())
            .map_err(db_err("Failed to update file record"))?;
    }
    Ok(())
}

fn open_database(path: &Path) -> Result<Database> {
    Database::open(path).map_err(|e| {
        let msg = e.to_string();
        if msg.to_lowercase().contains("lock") || msg.to_lowercase().contains("already open") {
            Error::Database(format!(
                "Index database {} is locked. Another writer may be running.",
                path.display()
            ))
        } else {
            Error::Database(format!("Failed to open index database: {}", e))
        }
    })
}

fn create_database(path: &Path) -> Result<Database> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::create(path)
        .map_err(|e| Error::Database(format!("Failed to create index database: {}", e)))?;

    // Create all tables up front so read transactions can open them.
    let write_txn = db.begin_write().map_err(db_err("Failed to begin write transaction"))?;
    {
        write_txn.open_table(ROWS_TABLE).map_err(db_err("Failed to open table"))?;
        write_txn.open_table(FILES_TABLE).map_err(db_err("Failed to open table"))?;
        write_txn.open_table(META_TABLE).map_err(db_err("Failed to open table"))?;
    }
    write_txn.commit().map_err(db_err("Failed to commit transaction"))?;
    tracing::debug!("Created index database at {}", path.display());
    Ok(db)
}

fn read_str<T>(table: &T, key: &str) -> Result<Option<String>>
where
    T: ReadableTable<&'static str, &'static str>,
{
    let guard = table.get(key).map_err(db_err("Failed to read metadata"))?;
    Ok(guard.map(|g| g.value().to_string()))
}

fn read_json<D, T>(table: &T, key: &str, what: &str) -> Result<Option<D>>
where
    D: DeserializeOwned,
    T: ReadableTable<&'static str, &'static str>,
{
    let guard = table
        .get(key)
        .map_err(|e| Error::Database(format!("Failed to get {}: {}", what, e)))?;
    match guard {
        Some(guard) => {
            let json_str = guard.value().to_string();
            drop(guard);
            from_json(&json_str, what).map(Some)
        }
        None => Ok(None),
    }
}

fn to_json<S: Serialize>(value: &S, what: &str) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| Error::Database(format!("Failed to serialize {}: {}", what, e)))
}

fn from_json<D: DeserializeOwned>(json: &str, what: &str) -> Result<D> {
    serde_json::from_str(json)
        .map_err(|e| Error::Database(format!("Failed to deserialize {}: {}", what, e)))
}

fn db_err<E: std::fmt::Display>(context: &'static str) -> impl FnOnce(E) -> Error {
    move |e| Error::Database(format!("{}: {}", context, e))
}

/// Current time as seconds since the Unix epoch
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
