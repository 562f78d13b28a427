use crate::core::config::BankConfig;
use crate::core::error::{Error, Result};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Observed on-disk state of one candidate record file
#[derive(Debug, Clone, PartialEq)]
pub struct FileState {
    pub path: PathBuf,
    /// Path relative to the bank root, `/`-separated
    pub relative_path: String,
    pub observed_mtime: f64,
    pub observed_size: u64,
}

/// A file that was seen but could not be inspected
#[derive(Debug, Clone, PartialEq)]
pub struct UnreadableFile {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of walking a bank directory
#[derive(Debug, Default)]
pub struct Discovery {
    pub files: Vec<FileState>,
    pub unreadable: Vec<UnreadableFile>,
    /// Bank-relative paths that exist but could not be listed or inspected
    pub unlisted: Vec<String>,
}

/// Walk the bank, returning every file `accepts` admits, sorted by relative path.
///
/// Hidden files and the configured exclude set are skipped. Entries that
/// cannot be inspected are collected in `unreadable` rather than failing.
pub fn discover_files(config: &BankConfig, accepts: impl Fn(&Path) -> bool) -> Result<Discovery> {
    let root = &config.bank_path;
    if !root.exists() {
        return Err(Error::MissingDirectory(root.clone()));
    }
    if !root.is_dir() {
        return Err(Error::Config(format!(
            "Path is not a directory: {}",
            root.display()
        )));
    }

    let mut discovery = Discovery::default();
    let walker = WalkBuilder::new(root)
        .hidden(!config.include_hidden)
        .git_ignore(config.respect_gitignore)
        .git_exclude(config.respect_gitignore)
        .git_global(config.respect_gitignore)
        .ignore(config.respect_gitignore)
        .require_git(false)
        .parents(false)
        .build();

    for result in walker {
        let entry = match result {
            Ok(entry) => entry,
            Err(err) => {
                let path = error_path(&err).unwrap_or(root.as_path());
                tracing::warn!("Failed to access {}: {}", path.display(), err);
                if let Some(relative) = relative_key(root, path) {
                    discovery.unlisted.push(relative);
                }
                discovery.unreadable.push(UnreadableFile {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                });
                continue;
            }
        };

        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let path = entry.path();
        if config.is_excluded(path) || !accepts(path) {
            continue;
        }

        let Some(relative_path) = relative_key(root, path) else {
            discovery.unreadable.push(UnreadableFile {
                path: path.to_path_buf(),
                reason: "path is not valid UTF-8".to_string(),
            });
            continue;
        };

        match observe(path) {
            Ok((observed_mtime, observed_size)) => discovery.files.push(FileState {
                path: path.to_path_buf(),
                relative_path,
                observed_mtime,
                observed_size,
            }),
            Err(e) => {
                tracing::warn!("Could not stat {}: {}", path.display(), e);
                discovery.unlisted.push(relative_path);
                discovery.unreadable.push(UnreadableFile {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                });
            }
        }
    }

    discovery
        .files
        .sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(discovery)
}

/// Observe a single file below the root; `Ok(None)` if it does not exist
pub fn observe_file(root: &Path, relative_path: &str) -> Result<Option<FileState>> {
    let path = root.join(relative_path);
    if !path.is_file() {
        return Ok(None);
    }
    let (observed_mtime, observed_size) = observe(&path)?;
    Ok(Some(FileState {
        path,
        relative_path: relative_path.to_string(),
        observed_mtime,
        observed_size,
    }))
}

/// Relative `/`-separated key of `path` below `root`
pub fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// The entry a walk error is about, when it names one
fn error_path(err: &ignore::Error) -> Option<&Path> {
    match err {
        ignore::Error::WithPath { path, .. } => Some(path.as_path()),
        ignore::Error::Loop { child, .. } => Some(child.as_path()),
        ignore::Error::WithDepth { err, .. } | ignore::Error::WithLineNumber { err, .. } => {
            error_path(err)
        }
        _ => None,
    }
}

fn observe(path: &Path) -> Result<(f64, u64)> {
    let metadata = std::fs::metadata(path)?;
    let modified = metadata.modified()?;
    let mtime = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .map_err(|e| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to get modification time: {}", e),
            ))
        })?;
    Ok((mtime, metadata.len()))
}
