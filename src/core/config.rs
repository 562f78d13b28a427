use super::error::{Error, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

const DEFAULT_INDEX_FILE: &str = ".index.redb";
const DEFAULT_VERSION_FILE: &str = ".index_version.txt";
const DEFAULT_HASH_FILE: &str = ".index_hashes.json";
const README_FILE: &str = "readme.txt";

/// Configuration for a record bank
#[derive(Debug, Clone)]
pub struct BankConfig {
    /// Managed directory holding the record files
    pub bank_path: PathBuf,
    /// File name of the index artifact inside the bank
    pub index_file_name: String,
    /// File name of the schema-version marker
    pub version_file_name: String,
    /// File name of the integrity hash manifest
    pub hash_file_name: String,
    /// File names never treated as record files
    pub exclude: BTreeSet<String>,
    /// Number of processed files between progress updates
    pub bar_update_interval: usize,
    /// Below this many files to decode, no progress is reported
    pub min_files_for_bar: usize,
    /// Decode changed files on the rayon pool
    pub parallel_decode: bool,
    /// Honour .gitignore files found in the bank
    pub respect_gitignore: bool,
    /// Walk hidden files and directories
    pub include_hidden: bool,
}

impl BankConfig {
    /// Create a new configuration with defaults for the given bank directory
    pub fn new(bank_path: impl Into<PathBuf>) -> Result<Self> {
        let bank_path = bank_path.into();
        if bank_path.as_os_str().is_empty() {
            return Err(Error::Config("Bank path must not be empty".to_string()));
        }

        let mut config = Self {
            bank_path,
            index_file_name: DEFAULT_INDEX_FILE.to_string(),
            version_file_name: DEFAULT_VERSION_FILE.to_string(),
            hash_file_name: DEFAULT_HASH_FILE.to_string(),
            exclude: BTreeSet::new(),
            bar_update_interval: 50,
            min_files_for_bar: 100,
            parallel_decode: true,
            respect_gitignore: false,
            include_hidden: false,
        };
        config.refresh_excludes();
        Ok(config)
    }

    pub fn with_index_file_name(mut self, name: impl Into<String>) -> Self {
        self.index_file_name = name.into();
        self.refresh_excludes();
        self
    }

    pub fn with_version_file_name(mut self, name: impl Into<String>) -> Self {
        self.version_file_name = name.into();
        self.refresh_excludes();
        self
    }

    pub fn with_hash_file_name(mut self, name: impl Into<String>) -> Self {
        self.hash_file_name = name.into();
        self.refresh_excludes();
        self
    }

    /// Add a file name to the exclude set
    pub fn with_exclude(mut self, name: impl Into<String>) -> Self {
        self.exclude.insert(name.into());
        self
    }

    /// Set progress reporting interval and threshold.
    /// An interval of zero is treated as one.
    pub fn with_progress(mut self, update_interval: usize, min_files: usize) -> Self {
        self.bar_update_interval = update_interval.max(1);
        self.min_files_for_bar = min_files;
        self
    }

    pub fn with_parallel_decode(mut self, parallel: bool) -> Self {
        self.parallel_decode = parallel;
        self
    }

    pub fn with_gitignore(mut self, respect: bool) -> Self {
        self.respect_gitignore = respect;
        self
    }

    pub fn with_hidden(mut self, include: bool) -> Self {
        self.include_hidden = include;
        self
    }

    /// Path to the index artifact
    pub fn index_path(&self) -> PathBuf {
        self.bank_path.join(&self.index_file_name)
    }

    /// Path to the schema-version marker
    pub fn version_path(&self) -> PathBuf {
        self.bank_path.join(&self.version_file_name)
    }

    /// Path to the hash manifest
    pub fn hash_path(&self) -> PathBuf {
        self.bank_path.join(&self.hash_file_name)
    }

    /// Check whether a file name is bookkeeping or otherwise excluded
    pub fn is_excluded(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .map(|name| self.exclude.contains(name) || name.ends_with(".tmp"))
            .unwrap_or(false)
    }

    /// Check whether the managed directory exists
    pub fn is_initialized(&self) -> bool {
        self.bank_path.is_dir()
    }

    // Bookkeeping names are always excluded, whatever they are renamed to.
    fn refresh_excludes(&mut self) {
        self.exclude.insert(README_FILE.to_string());
        self.exclude.insert(self.index_file_name.clone());
        self.exclude.insert(self.version_file_name.clone());
        self.exclude.insert(self.hash_file_name.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BankConfig::new("/tmp/bank").unwrap();
        assert_eq!(config.index_path(), PathBuf::from("/tmp/bank/.index.redb"));
        assert_eq!(config.bar_update_interval, 50);
        assert_eq!(config.min_files_for_bar, 100);
        assert!(config.exclude.contains("readme.txt"));
        assert!(config.exclude.contains(".index_version.txt"));
        assert!(config.exclude.contains(".index_hashes.json"));
    }

    #[test]
    fn test_empty_path_rejected() {
        assert!(matches!(BankConfig::new(""), Err(Error::Config(_))));
    }

    #[test]
    fn test_renamed_bookkeeping_files_are_excluded() {
        let config = BankConfig::new("bank")
            .unwrap()
            .with_index_file_name("catalog.redb");
        assert!(config.is_excluded(Path::new("bank/catalog.redb")));
        assert!(config.is_excluded(Path::new("bank/readme.txt")));
        assert!(!config.is_excluded(Path::new("bank/event_1.json")));
    }

    #[test]
    fn test_progress_interval_floor() {
        let config = BankConfig::new("bank").unwrap().with_progress(0, 1);
        assert_eq!(config.bar_update_interval, 1);
        assert_eq!(config.min_files_for_bar, 1);
    }
}
