use crate::core::config::BankConfig;
use crate::core::error::{Error, Result};
use crate::indexing::discovery::discover_files;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

/// Relative path -> SHA256 hex digest, ordered by path so diffs of the
/// saved manifest are reproducible
pub type HashManifest = BTreeMap<String, String>;

/// Calculate SHA256 hash of file contents
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash every record file in the bank.
///
/// Files that cannot be read are logged and left out of the manifest.
pub fn hash_directory(config: &BankConfig) -> Result<HashManifest> {
    let discovery = discover_files(config, |_| true)?;
    let hashes: Vec<(String, Result<String>)> = discovery
        .files
        .par_iter()
        .map(|file| (file.relative_path.clone(), hash_file(&file.path)))
        .collect();

    let mut manifest = HashManifest::new();
    for (relative, hash) in hashes {
        match hash {
            Ok(hash) => {
                manifest.insert(relative, hash);
            }
            Err(e) => tracing::warn!("Could not hash {}: {}", relative, e),
        }
    }
    Ok(manifest)
}

/// Load a saved manifest; `None` if the file does not exist
pub fn load_manifest(path: &Path) -> Result<Option<HashManifest>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| Error::Config(format!("Invalid hash manifest {}: {}", path.display(), e)))
}

/// Write a manifest as pretty JSON through a temp file and rename
pub fn save_manifest(path: &Path, manifest: &HashManifest) -> Result<()> {
    let json = serde_json::to_string_pretty(manifest)
        .map_err(|e| Error::Encode(format!("Failed to serialize hash manifest: {}", e)))?;
    write_atomic(path, json.as_bytes())
}

/// Replace `path` with `bytes` without exposing a partially written file
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, bytes)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_hash_file() {
        let temp_dir = TempDir::new().unwrap();
        let test_file = temp_dir.path().join("test.txt");

        fs::write(&test_file, "Hello, world!").unwrap();
        let hash1 = hash_file(&test_file).unwrap();
        assert_eq!(hash1.len(), 64);
        assert_eq!(hash1, hash_file(&test_file).unwrap());

        fs::write(&test_file, "Different content").unwrap();
        assert_ne!(hash1, hash_file(&test_file).unwrap());
    }

    #[test]
    fn test_hash_file_larger_than_buffer() {
        let temp_dir = TempDir::new().unwrap();
        let test_file = temp_dir.path().join("large.txt");
        fs::write(&test_file, "x".repeat(10000)).unwrap();
        assert_eq!(hash_file(&test_file).unwrap().len(), 64);
    }

    #[test]
    fn test_hash_directory_skips_bookkeeping() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("2020")).unwrap();
        fs::write(root.join("2020/a.json"), "[]").unwrap();
        fs::write(root.join("b.json"), "[]").unwrap();
        fs::write(root.join("readme.txt"), "about").unwrap();
        fs::write(root.join(".hidden"), "x").unwrap();

        let config = BankConfig::new(root).unwrap();
        let manifest = hash_directory(&config).unwrap();
        let keys: Vec<_> = manifest.keys().cloned().collect();
        assert_eq!(keys, vec!["2020/a.json".to_string(), "b.json".to_string()]);
    }

    #[test]
    fn test_manifest_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(".index_hashes.json");
        assert!(load_manifest(&path).unwrap().is_none());

        let mut manifest = HashManifest::new();
        manifest.insert("z.json".into(), "1".into());
        manifest.insert("a.json".into(), "2".into());
        save_manifest(&path, &manifest).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.find("a.json").unwrap() < text.find("z.json").unwrap());
        assert_eq!(load_manifest(&path).unwrap(), Some(manifest));
        assert!(!path.with_extension("tmp").exists());
    }
}
