use crate::codec::record::RecordCodec;
use crate::core::config::BankConfig;
use crate::core::error::{Error, Result};
use crate::indexing::discovery::{discover_files, FileState};
use crate::indexing::hasher::{
    hash_directory, hash_file, load_manifest, save_manifest, write_atomic, HashManifest,
};
use crate::indexing::progress::Progress;
use crate::indexing::staleness::is_modified;
use crate::indexing::updater::{IndexUpdater, SchemaStatus, UpdateOptions, UpdateReport};
use crate::storage::index::{IndexRow, IndexStore};
use crate::storage::query::Query;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::UNIX_EPOCH;

/// A directory of record files paired with a queryable summary index.
///
/// Construction never touches the disk. Index mutations (`update_index`,
/// `put`, rebuilds) are serialized per bank; reads run concurrently against
/// the last committed snapshot.
pub struct Bank<C: RecordCodec> {
    config: BankConfig,
    codec: C,
    store: IndexStore,
    write_lock: Mutex<()>,
}

impl<C: RecordCodec> Bank<C> {
    /// Bank over `path` with the default configuration
    pub fn new(path: impl Into<PathBuf>, codec: C) -> Result<Self> {
        Ok(Self::with_config(BankConfig::new(path)?, codec))
    }

    pub fn with_config(config: BankConfig, codec: C) -> Self {
        let store = IndexStore::new(config.index_path());
        Self {
            config,
            codec,
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.bank_path
    }

    pub fn config(&self) -> &BankConfig {
        &self.config
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn index_path(&self) -> &Path {
        self.store.path()
    }

    fn updater(&self) -> IndexUpdater<'_, C> {
        IndexUpdater::new(&self.config, &self.store, &self.codec)
    }

    /// Index rows matching the query, in identity order
    pub fn read_index(&self, query: &Query) -> Result<Vec<IndexRow>> {
        let compiled = query.compile(self.codec.schema())?;
        self.store.scan(&compiled)
    }

    /// Records matching the query, in the order the index returns them.
    ///
    /// Each containing file is decoded once, however many of its records match.
    pub fn get(&self, query: &Query) -> Result<Vec<C::Record>> {
        let rows = self.read_index(query)?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let paths: BTreeSet<&str> = rows.iter().map(|row| row.source_path.as_str()).collect();
        let missing: Vec<PathBuf> = paths
            .iter()
            .map(|p| self.config.bank_path.join(p))
            .filter(|p| !p.is_file())
            .collect();
        if !missing.is_empty() {
            return Err(Error::MissingFile { paths: missing });
        }

        let paths: Vec<&str> = paths.into_iter().collect();
        let decode = |relative: &&str| {
            let path = self.config.bank_path.join(relative);
            (relative.to_string(), self.codec.decode(&path))
        };
        let decoded: Vec<_> = if self.config.parallel_decode {
            paths.par_iter().map(decode).collect()
        } else {
            paths.iter().map(decode).collect()
        };

        let mut by_path: HashMap<String, HashMap<String, C::Record>> = HashMap::new();
        for (relative, result) in decoded {
            let records = result?
                .into_iter()
                .map(|decoded| (decoded.identity, decoded.record))
                .collect();
            by_path.insert(relative, records);
        }

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            match by_path
                .get_mut(&row.source_path)
                .and_then(|found| found.remove(&row.identity))
            {
                Some(record) => records.push(record),
                None => tracing::warn!(
                    "Identity {} is no longer in {}; the index is stale",
                    row.identity,
                    row.source_path
                ),
            }
        }
        Ok(records)
    }

    /// Write records to their files and index just those files.
    ///
    /// A record whose identity is already indexed replaces itself in its
    /// current file; other records sharing that file are kept. New identities
    /// go to the codec's deterministic path. The bank directory is created if
    /// needed.
    pub fn put(&self, records: Vec<C::Record>) -> Result<UpdateReport> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if records.is_empty() {
            return Ok(UpdateReport::default());
        }
        std::fs::create_dir_all(&self.config.bank_path)?;

        // The last record given for an identity wins, wherever it would be stored.
        let mut unique: Vec<(String, C::Record)> = Vec::with_capacity(records.len());
        let mut positions: HashMap<String, usize> = HashMap::new();
        for record in records {
            let identity = self.codec.summarize(&record).identity;
            match positions.get(&identity) {
                Some(&index) => unique[index].1 = record,
                None => {
                    positions.insert(identity.clone(), unique.len());
                    unique.push((identity, record));
                }
            }
        }

        let identities: Vec<&str> = unique.iter().map(|(id, _)| id.as_str()).collect();
        let current: HashMap<String, String> = self
            .read_index(&Query::new().with("identities", identities))?
            .into_iter()
            .map(|row| (row.identity, row.source_path))
            .collect();

        let mut targets: BTreeMap<String, Vec<(String, C::Record)>> = BTreeMap::new();
        for (identity, record) in unique {
            let path = match current.get(&identity) {
                Some(path) => path.clone(),
                None => self.codec.relative_path(&record),
            };
            targets.entry(path).or_default().push((identity, record));
        }

        let mut touched = Vec::with_capacity(targets.len());
        for (relative, pending) in targets {
            let path = self.config.bank_path.join(&relative);
            let merged = self.merge_into(&path, pending)?;
            let bytes = self.codec.encode(&merged)?;
            write_atomic(&path, &bytes)?;
            tracing::debug!("Wrote {} record(s) to {}", merged.len(), path.display());
            touched.push(relative);
        }

        self.updater().update_paths(&touched, Progress::Disabled)
    }

    fn merge_into(
        &self,
        path: &Path,
        pending: Vec<(String, C::Record)>,
    ) -> Result<Vec<C::Record>> {
        if !path.is_file() {
            return Ok(pending.into_iter().map(|(_, record)| record).collect());
        }
        let mut replacements: HashMap<String, C::Record> = HashMap::new();
        let mut appended = Vec::new();
        for (identity, record) in pending {
            appended.push(identity.clone());
            replacements.insert(identity, record);
        }

        let mut merged = Vec::new();
        for existing in self.codec.decode(path)? {
            match replacements.remove(&existing.identity) {
                Some(replacement) => merged.push(replacement),
                None => merged.push(existing.record),
            }
        }
        for identity in appended {
            if let Some(record) = replacements.remove(&identity) {
                merged.push(record);
            }
        }
        Ok(merged)
    }

    /// Incremental update with the default console progress bar
    pub fn update_index(&self) -> Result<UpdateReport> {
        self.update_index_with(UpdateOptions::default(), Progress::Default)
    }

    pub fn update_index_with(
        &self,
        options: UpdateOptions,
        progress: Progress<'_>,
    ) -> Result<UpdateReport> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.updater().update(options, progress)
    }

    /// Re-index only the given bank-relative paths
    pub fn update_paths(&self, paths: &[String]) -> Result<UpdateReport> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.updater().update_paths(paths, Progress::Disabled)
    }

    /// Drop the index and decode every file again
    pub fn rebuild_index(&self, progress: Progress<'_>) -> Result<UpdateReport> {
        self.update_index_with(
            UpdateOptions {
                force_full: true,
                ..UpdateOptions::default()
            },
            progress,
        )
    }

    /// Seconds since the Unix epoch of the last update that changed the index
    pub fn last_updated(&self) -> Result<Option<f64>> {
        self.store.last_updated()
    }

    /// Schema version recorded in the index
    pub fn index_version(&self) -> Result<Option<String>> {
        Ok(self.store.metadata()?.map(|meta| meta.schema_version))
    }

    pub fn row_count(&self) -> Result<usize> {
        self.store.row_count()
    }

    /// Hash every file in the bank and save the manifest
    pub fn write_hash_manifest(&self) -> Result<HashManifest> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let manifest = hash_directory(&self.config)?;
        save_manifest(&self.config.hash_path(), &manifest)?;
        tracing::info!(
            "Wrote hashes of {} files to {}",
            manifest.len(),
            self.config.hash_path().display()
        );
        Ok(manifest)
    }

    /// Compare the bank against the index and the saved hash manifest.
    ///
    /// A file whose content no longer matches its recorded hash, although it
    /// was not modified since the hash was taken, fails with `Integrity`.
    /// Indexed or hashed files that are gone fail with `MissingFile`.
    pub fn check_integrity(&self) -> Result<()> {
        let hash_path = self.config.hash_path();
        let manifest = load_manifest(&hash_path)?.unwrap_or_default();
        let hashed_at = file_mtime(&hash_path);
        let stored = self.store.file_records()?;
        let discovery = discover_files(&self.config, |_| true)?;

        // Expected hash of each file that has not been modified since it was taken
        let candidates: Vec<(&FileState, &String)> = discovery
            .files
            .iter()
            .filter_map(|file| match manifest.get(&file.relative_path) {
                Some(hash) => hashed_at
                    .map_or(true, |at| file.observed_mtime <= at)
                    .then_some((file, hash)),
                None => stored
                    .get(&file.relative_path)
                    .filter(|record| !is_modified(record, file))
                    .and_then(|record| record.hash.as_ref())
                    .map(|hash| (file, hash)),
            })
            .collect();

        let mut corrupted: Vec<PathBuf> = candidates
            .par_iter()
            .filter_map(|(file, expected)| match hash_file(&file.path) {
                Ok(actual) if &actual != *expected => Some(file.path.clone()),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!("Could not hash {}: {}", file.path.display(), e);
                    None
                }
            })
            .collect();
        if !corrupted.is_empty() {
            corrupted.sort();
            tracing::warn!(
                "{} file(s) changed without a modification time change",
                corrupted.len()
            );
            return Err(Error::Integrity { paths: corrupted });
        }

        let on_disk: BTreeSet<&str> = discovery
            .files
            .iter()
            .map(|f| f.relative_path.as_str())
            .collect();
        let missing: BTreeSet<&String> = stored
            .keys()
            .chain(manifest.keys())
            .filter(|relative| !on_disk.contains(relative.as_str()))
            .collect();
        if !missing.is_empty() {
            return Err(Error::MissingFile {
                paths: missing
                    .into_iter()
                    .map(|p| self.config.bank_path.join(p))
                    .collect(),
            });
        }
        Ok(())
    }

    /// Strict schema check: an index older than the codec's schema is an error
    pub fn check_schema(&self) -> Result<SchemaStatus> {
        match self.updater().schema_status()? {
            SchemaStatus::Older(found) => Err(Error::SchemaVersion {
                found,
                expected: self.codec.schema().version().to_string(),
            }),
            status => Ok(status),
        }
    }
}

fn file_mtime(path: &Path) -> Option<f64> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
}
