//! Decide which files need re-indexing.
//!
//! The fast path compares modification time and size against the stored
//! [`FileRecord`]. The strong path additionally hashes every file that looks
//! unchanged and compares against the hash manifest (or the hash stored with
//! the record), flagging mismatches as corruption.

use crate::indexing::discovery::{FileState, UnreadableFile};
use crate::indexing::hasher::{hash_file, HashManifest};
use crate::storage::index::FileRecord;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

/// Disjoint change sets, each sorted by relative path
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Staleness {
    pub new: Vec<FileState>,
    pub modified: Vec<FileState>,
    pub removed: Vec<String>,
    /// Content changed while mtime and size did not
    pub corrupted: Vec<FileState>,
    pub unreadable: Vec<UnreadableFile>,
}

impl Staleness {
    /// Files that must be decoded
    pub fn changed(&self) -> impl Iterator<Item = &FileState> {
        self.new.iter().chain(self.modified.iter())
    }

    pub fn is_clean(&self) -> bool {
        self.new.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

/// Compare observed files against the last indexed state.
///
/// Stored files at or below an `unlisted` path (one the walk could not
/// inspect) are never reported as removed. With `manifest` set, every file
/// not already known to be new or modified is hashed; files whose hash cannot
/// be computed are reported as unreadable.
pub fn detect(
    stored: &BTreeMap<String, FileRecord>,
    observed: Vec<FileState>,
    unlisted: &[String],
    manifest: Option<&HashManifest>,
) -> Staleness {
    let mut staleness = Staleness::default();
    let mut unchanged = Vec::new();
    let seen: BTreeSet<String> = observed.iter().map(|f| f.relative_path.clone()).collect();

    for file in observed {
        match stored.get(&file.relative_path) {
            None => staleness.new.push(file),
            Some(record) if is_modified(record, &file) => staleness.modified.push(file),
            Some(_) => unchanged.push(file),
        }
    }

    staleness.removed = stored
        .keys()
        .filter(|path| !seen.contains(*path))
        .filter(|path| !unlisted.iter().any(|hidden| is_within(path, hidden)))
        .cloned()
        .collect();

    if let Some(manifest) = manifest {
        let hashed: Vec<(FileState, std::result::Result<String, String>)> = unchanged
            .into_par_iter()
            .map(|file| {
                let hash = hash_file(&file.path).map_err(|e| e.to_string());
                (file, hash)
            })
            .collect();

        for (file, hash) in hashed {
            let expected = manifest
                .get(&file.relative_path)
                .or_else(|| stored.get(&file.relative_path).and_then(|r| r.hash.as_ref()));
            match (hash, expected) {
                (Ok(actual), Some(expected)) if &actual != expected => {
                    tracing::warn!(
                        "Content of {} changed without a modification time change",
                        file.relative_path
                    );
                    staleness.corrupted.push(file);
                }
                (Ok(_), _) => {}
                (Err(reason), _) => {
                    tracing::warn!("Could not hash {}: {}", file.path.display(), reason);
                    staleness.unreadable.push(UnreadableFile {
                        path: file.path,
                        reason,
                    });
                }
            }
        }
    }

    staleness
}

fn is_within(path: &str, dir: &str) -> bool {
    path.strip_prefix(dir)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// Newer mtime or a different size
pub fn is_modified(record: &FileRecord, file: &FileState) -> bool {
    file.observed_mtime > record.mtime || file.observed_size != record.size
}
