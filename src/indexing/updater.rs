use crate::codec::record::{DecodedRecord, RecordCodec};
use crate::core::config::BankConfig;
use crate::core::error::{Error, Result};
use crate::indexing::discovery::{discover_files, observe_file, FileState};
use crate::indexing::hasher::{hash_file, load_manifest, write_atomic};
use crate::indexing::progress::{Progress, ProgressTracker};
use crate::indexing::staleness::detect;
use crate::storage::index::{FileRecord, IndexBatch, IndexMetadata, IndexRow, IndexStore};
use crate::storage::schema::SchemaVersion;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// How an update should treat the existing index
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    /// Drop the index and decode every file
    pub force_full: bool,
    /// Hash unchanged files and report content changes that kept their mtime
    pub strong: bool,
}

/// A non-fatal condition met during an update
#[derive(Debug, Clone, PartialEq)]
pub enum IndexWarning {
    Decode { path: PathBuf, message: String },
    Unreadable { path: PathBuf, reason: String },
    NewerSchema { found: String, expected: String },
    Rebuilt { found: String, expected: String },
    DuplicateIdentity { identity: String, kept: String, dropped: String },
}

/// Outcome of one update run
#[derive(Debug, Clone, Default)]
pub struct UpdateReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    /// Files excluded because they could not be decoded or read
    pub skipped: usize,
    pub unreadable: Vec<PathBuf>,
    /// Files whose content hash changed while their mtime did not
    pub corrupted: Vec<PathBuf>,
    pub warnings: Vec<IndexWarning>,
    /// The index was dropped and rebuilt
    pub rebuilt: bool,
    pub elapsed: Duration,
}

impl UpdateReport {
    /// Whether any row was added, replaced or removed
    pub fn changed(&self) -> bool {
        self.added + self.updated + self.removed > 0
    }
}

/// How the on-disk index compares with the codec's schema
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaStatus {
    /// No index, or an index that was never committed
    Missing,
    Current,
    Older(String),
    Newer(String),
}

/// How a commit treats existing index contents and metadata
#[derive(Debug, Clone, Copy, PartialEq)]
enum CommitMode {
    /// Metadata is written only when rows changed
    Incremental,
    /// First commit of an index: metadata is always written
    WriteMetadata,
    /// Drop everything indexed and write the batch in its place
    Replace,
}

struct Decoded<R> {
    file: FileState,
    hash: Option<String>,
    result: Result<Vec<DecodedRecord<R>>>,
}

/// Brings the index in line with the files in the bank
pub struct IndexUpdater<'a, C: RecordCodec> {
    config: &'a BankConfig,
    store: &'a IndexStore,
    codec: &'a C,
}

impl<'a, C: RecordCodec> IndexUpdater<'a, C> {
    pub fn new(config: &'a BankConfig, store: &'a IndexStore, codec: &'a C) -> Self {
        Self {
            config,
            store,
            codec,
        }
    }

    /// Compare the stored schema version against the codec's
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let expected = self.codec.schema().version();
        let Some(meta) = self.store.metadata()? else {
            return Ok(SchemaStatus::Missing);
        };
        Ok(match SchemaVersion::parse(&meta.schema_version) {
            Some(found) if found == *expected => SchemaStatus::Current,
            Some(found) if found > *expected => SchemaStatus::Newer(meta.schema_version),
            _ => SchemaStatus::Older(meta.schema_version),
        })
    }

    /// Re-index every new, modified or removed file in the bank
    pub fn update(&self, options: UpdateOptions, progress: Progress<'_>) -> Result<UpdateReport> {
        let start = Instant::now();
        let mut report = UpdateReport::default();
        let expected = self.codec.schema().version().to_string();

        let status = self.schema_status()?;
        let mut rebuild = options.force_full;
        match &status {
            SchemaStatus::Older(found) => {
                tracing::warn!(
                    "Index schema {} is older than {}, rebuilding index",
                    found,
                    expected
                );
                report.warnings.push(IndexWarning::Rebuilt {
                    found: found.clone(),
                    expected: expected.clone(),
                });
                rebuild = true;
            }
            SchemaStatus::Newer(found) => {
                tracing::warn!(
                    "Index schema {} is newer than {}; unknown fields will be ignored",
                    found,
                    expected
                );
                report.warnings.push(IndexWarning::NewerSchema {
                    found: found.clone(),
                    expected: expected.clone(),
                });
            }
            SchemaStatus::Missing | SchemaStatus::Current => {}
        }

        // A rebuild clears the index in the transaction that writes the new rows.
        let discovery = discover_files(self.config, |p| self.codec.accepts(p))?;
        report.rebuilt = rebuild && self.store.exists();
        for unreadable in discovery.unreadable {
            report.warnings.push(IndexWarning::Unreadable {
                path: unreadable.path.clone(),
                reason: unreadable.reason,
            });
            report.unreadable.push(unreadable.path);
            report.skipped += 1;
        }

        let stored = if rebuild {
            BTreeMap::new()
        } else {
            self.store.file_records()?
        };
        let manifest = if options.strong {
            Some(load_manifest(&self.config.hash_path())?.unwrap_or_default())
        } else {
            None
        };
        let staleness = detect(
            &stored,
            discovery.files,
            &discovery.unlisted,
            manifest.as_ref(),
        );
        tracing::debug!(
            "Staleness: {} new, {} modified, {} removed, {} corrupted",
            staleness.new.len(),
            staleness.modified.len(),
            staleness.removed.len(),
            staleness.corrupted.len()
        );

        for file in &staleness.corrupted {
            report.corrupted.push(file.path.clone());
        }
        for unreadable in &staleness.unreadable {
            report.warnings.push(IndexWarning::Unreadable {
                path: unreadable.path.clone(),
                reason: unreadable.reason.clone(),
            });
            report.unreadable.push(unreadable.path.clone());
            report.skipped += 1;
        }

        let mut changed: Vec<FileState> = staleness.changed().cloned().collect();
        changed.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        let mode = if rebuild {
            CommitMode::Replace
        } else if status == SchemaStatus::Missing {
            CommitMode::WriteMetadata
        } else {
            CommitMode::Incremental
        };
        self.commit(
            changed,
            staleness.removed,
            options.strong,
            mode,
            progress,
            &mut report,
        )?;

        report.elapsed = start.elapsed();
        tracing::info!(
            "Index update of {}: {} added, {} updated, {} removed, {} skipped in {:?}",
            self.config.bank_path.display(),
            report.added,
            report.updated,
            report.removed,
            report.skipped,
            report.elapsed
        );
        Ok(report)
    }

    /// Re-index only the given bank-relative paths.
    ///
    /// Paths that no longer exist are removed from the index. Falls back to
    /// a full update when the index is missing or its schema is outdated.
    pub fn update_paths(&self, paths: &[String], progress: Progress<'_>) -> Result<UpdateReport> {
        match self.schema_status()? {
            SchemaStatus::Missing | SchemaStatus::Older(_) => {
                return self.update(UpdateOptions::default(), progress);
            }
            SchemaStatus::Current | SchemaStatus::Newer(_) => {}
        }

        let start = Instant::now();
        let mut report = UpdateReport::default();
        let mut changed = Vec::new();
        let mut removed = Vec::new();

        let mut paths: Vec<&String> = paths.iter().collect();
        paths.sort();
        paths.dedup();
        for relative in paths {
            match observe_file(&self.config.bank_path, relative) {
                Ok(Some(state)) => {
                    if self.config.is_excluded(&state.path) || !self.codec.accepts(&state.path) {
                        continue;
                    }
                    changed.push(state);
                }
                Ok(None) => removed.push(relative.clone()),
                Err(e) => {
                    let path = self.config.bank_path.join(relative);
                    tracing::warn!("Could not stat {}: {}", path.display(), e);
                    report.warnings.push(IndexWarning::Unreadable {
                        path: path.clone(),
                        reason: e.to_string(),
                    });
                    report.unreadable.push(path);
                    report.skipped += 1;
                }
            }
        }

        self.commit(
            changed,
            removed,
            false,
            CommitMode::Incremental,
            progress,
            &mut report,
        )?;
        report.elapsed = start.elapsed();
        tracing::debug!(
            "Targeted index update: {} added, {} updated, {} removed",
            report.added,
            report.updated,
            report.removed
        );
        Ok(report)
    }

    fn commit(
        &self,
        changed: Vec<FileState>,
        removed: Vec<String>,
        hash: bool,
        mode: CommitMode,
        progress: Progress<'_>,
        report: &mut UpdateReport,
    ) -> Result<()> {
        if changed.is_empty() && removed.is_empty() && mode == CommitMode::Incremental {
            return Ok(());
        }

        let decoded = self.decode_all(changed, hash, progress);
        let mut batch = IndexBatch {
            removed_paths: removed,
            metadata: Some(IndexMetadata::now(self.codec.schema().version().as_str())),
            metadata_if_changed: mode == CommitMode::Incremental,
            clear: mode == CommitMode::Replace,
            ..IndexBatch::default()
        };
        // identity -> (index into batch.files, index into batch.rows)
        let mut owners: HashMap<String, (usize, usize)> = HashMap::new();

        for Decoded { file, hash, result } in decoded {
            let records = match result {
                Ok(records) => records,
                Err(e) => {
                    let message = match &e {
                        Error::Decode { message, .. } => message.clone(),
                        other => other.to_string(),
                    };
                    tracing::warn!("Skipping {}: {}", file.path.display(), message);
                    report.warnings.push(IndexWarning::Decode {
                        path: file.path.clone(),
                        message,
                    });
                    report.skipped += 1;
                    // Record the file so it is retried only once it changes.
                    Vec::new()
                }
            };

            let file_index = batch.files.len();
            let mut identities = Vec::with_capacity(records.len());
            for record in records {
                let row = IndexRow {
                    identity: record.identity.clone(),
                    attributes: record.attributes,
                    source_path: file.relative_path.clone(),
                    file_mtime: file.observed_mtime,
                    file_hash: hash.clone(),
                };
                match owners.get(&record.identity).copied() {
                    Some((prev_file, row_index)) => {
                        let dropped = batch.rows[row_index].source_path.clone();
                        if dropped != file.relative_path {
                            tracing::warn!(
                                "Identity {} found in both {} and {}; keeping {}",
                                record.identity,
                                dropped,
                                file.relative_path,
                                file.relative_path
                            );
                            report.warnings.push(IndexWarning::DuplicateIdentity {
                                identity: record.identity.clone(),
                                kept: file.relative_path.clone(),
                                dropped,
                            });
                            batch.files[prev_file]
                                .1
                                .identities
                                .retain(|id| id != &record.identity);
                            identities.push(record.identity.clone());
                        }
                        batch.rows[row_index] = row;
                        owners.insert(record.identity, (file_index, row_index));
                    }
                    None => {
                        identities.push(record.identity.clone());
                        owners.insert(record.identity, (file_index, batch.rows.len()));
                        batch.rows.push(row);
                    }
                }
            }

            batch.files.push((
                file.relative_path,
                FileRecord {
                    mtime: file.observed_mtime,
                    size: file.observed_size,
                    hash,
                    identities,
                },
            ));
        }

        let outcome = self.store.apply(batch)?;
        report.added += outcome.added;
        report.updated += outcome.updated;
        report.removed += outcome.removed;

        if mode != CommitMode::Incremental || outcome.changed() {
            let version = self.codec.schema().version().as_str();
            if let Err(e) = write_atomic(&self.config.version_path(), version.as_bytes()) {
                tracing::warn!("Could not write schema version marker: {}", e);
            }
        }
        Ok(())
    }

    fn decode_all(
        &self,
        files: Vec<FileState>,
        hash: bool,
        progress: Progress<'_>,
    ) -> Vec<Decoded<C::Record>> {
        let label = format!(
            "updating or creating index at {}",
            self.config.index_path().display()
        );
        let interval = self.config.bar_update_interval.max(1);
        let mut tracker = ProgressTracker::new(
            progress,
            &label,
            files.len(),
            interval,
            self.config.min_files_for_bar,
        );

        let mut out = Vec::with_capacity(files.len());
        for chunk in files.chunks(interval) {
            let decoded: Vec<Decoded<C::Record>> = if self.config.parallel_decode {
                chunk.par_iter().map(|f| self.decode_one(f, hash)).collect()
            } else {
                chunk.iter().map(|f| self.decode_one(f, hash)).collect()
            };
            tracker.advance(chunk.len());
            out.extend(decoded);
        }
        tracker.finish();
        out
    }

    fn decode_one(&self, file: &FileState, hash: bool) -> Decoded<C::Record> {
        let hash = if hash {
            match hash_file(&file.path) {
                Ok(digest) => Some(digest),
                Err(e) => {
                    return Decoded {
                        file: file.clone(),
                        hash: None,
                        result: Err(Error::decode(&file.path, e)),
                    }
                }
            }
        } else {
            None
        };

        let schema = self.codec.schema();
        let result = self.codec.decode(&file.path).and_then(|records| {
            records
                .into_iter()
                .map(|mut record| {
                    let attributes = std::mem::take(&mut record.attributes);
                    record.attributes = schema.conform(&file.path, attributes)?;
                    Ok(record)
                })
                .collect::<Result<Vec<_>>>()
        });
        Decoded {
            file: file.clone(),
            hash,
            result,
        }
    }
}
