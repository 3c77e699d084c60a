//! # Label Definition Store
//!
//! Every regular file below the label root defines one label key. The key is the file's path
//! relative to the root and each line of the file is a trigger token: a node label value that
//! makes a node eligible for the key.
//!
//! The store is never patched. Each rebuild rescans the whole tree and swaps the result in under
//! the write lock, so readers always see a complete, non-empty definition set.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Label key to trigger tokens, as read from disk
pub type LabelDefinitions = HashMap<String, Vec<String>>;

/// Shared, atomically rebuilt label definitions
#[derive(Debug)]
pub struct DefinitionStore {
    root: PathBuf,
    definitions: RwLock<LabelDefinitions>,
}

impl DefinitionStore {
    /// Scan `root` and build the initial store
    pub fn load(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let definitions = scan(&root)?;
        info!(
            dir = %root.display(),
            labels = definitions.len(),
            "Loaded label definitions"
        );

        Ok(Self {
            root,
            definitions: RwLock::new(definitions),
        })
    }

    /// Root directory the definitions are read from
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rescan the root and replace the definitions.
    ///
    /// On failure the previous definitions stay installed and the error is returned to the
    /// caller. Returns the number of label keys now defined. Readers wait on the write lock for
    /// the whole scan, which runs on the blocking pool.
    pub async fn rebuild(&self) -> Result<usize> {
        let mut definitions = self.definitions.write().await;
        let root = self.root.clone();
        let rebuilt = tokio::task::spawn_blocking(move || scan(&root))
            .await
            .map_err(|source| Error::Task {
                name: "definition scan".to_string(),
                source,
            })??;
        let count = rebuilt.len();
        *definitions = rebuilt;
        debug!(dir = %self.root.display(), labels = count, "Rebuilt label definitions");
        Ok(count)
    }

    /// Shared read access to the current definitions
    pub async fn read(&self) -> RwLockReadGuard<'_, LabelDefinitions> {
        self.definitions.read().await
    }
}

/// Walk `root` and read every regular file into a label definition
pub fn scan(root: &Path) -> Result<LabelDefinitions> {
    let mut definitions = LabelDefinitions::new();

    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|source| Error::Scan {
            path: root.to_path_buf(),
            source,
        })?;

        // Symlinked files count as definitions (ConfigMap volumes are mounted that way).
        let file_type = entry.file_type();
        if !(file_type.is_file() || (file_type.is_symlink() && entry.path().is_file())) {
            continue;
        }

        let key = label_key(root, entry.path());
        definitions.insert(key, read_trigger_tokens(entry.path()));
    }

    if definitions.is_empty() {
        return Err(Error::EmptyDefinitionSet(root.to_path_buf()));
    }

    Ok(definitions)
}

/// Label key for a definition file: its path relative to the root, `/`-separated
fn label_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// One token per line. Invalid UTF-8 is replaced rather than rejected, so only that line is
/// affected. An unreadable file yields a single empty token rather than failing the whole scan.
fn read_trigger_tokens(path: &Path) -> Vec<String> {
    match fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes)
            .split('\n')
            .map(str::to_string)
            .collect(),
        Err(e) => {
            warn!(file = %path.display(), error = %e, "Could not read label definition file");
            vec![String::new()]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn label_dir(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (path, content) in files {
            let full = dir.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        dir
    }

    #[test]
    fn test_scan_reads_tokens_per_line() {
        let dir = label_dir(&[("gpu", "has-gpu\nnvidia\n")]);

        let definitions = scan(dir.path()).unwrap();

        assert_eq!(definitions.len(), 1);
        // The trailing newline produces an empty token; it is kept as read.
        assert_eq!(
            definitions["gpu"],
            vec!["has-gpu".to_string(), "nvidia".to_string(), String::new()]
        );
    }

    #[test]
    fn test_nested_files_flatten_to_relative_keys() {
        let dir = label_dir(&[
            ("example.com/accelerated", "has-gpu"),
            ("example.com/storage/fast", "nvme"),
            ("plain", "x"),
        ]);

        let definitions = scan(dir.path()).unwrap();

        assert_eq!(definitions.len(), 3);
        assert!(definitions.contains_key("example.com/accelerated"));
        assert!(definitions.contains_key("example.com/storage/fast"));
        assert!(definitions.contains_key("plain"));
    }

    #[test]
    fn test_directories_alone_are_an_empty_set() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();

        let err = scan(dir.path()).unwrap_err();

        assert!(matches!(err, Error::EmptyDefinitionSet(_)));
    }

    #[test]
    fn test_missing_root_is_a_scan_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("does-not-exist");

        let err = scan(&missing).unwrap_err();

        assert!(matches!(err, Error::Scan { .. }));
    }

    #[test]
    fn test_non_utf8_line_keeps_other_tokens() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("gpu"), b"has-gpu\n# caf\xE9\n").unwrap();

        let definitions = scan(dir.path()).unwrap();

        let tokens = &definitions["gpu"];
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0], "has-gpu");
        assert_eq!(tokens[1], "# caf\u{FFFD}");
        assert_eq!(tokens[2], "");
    }

    #[test]
    fn test_unreadable_file_yields_single_empty_token() {
        let dir = TempDir::new().unwrap();

        // Reading a directory as a file fails with EISDIR.
        assert_eq!(read_trigger_tokens(dir.path()), vec![String::new()]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_scan_continues_past_unreadable_entry() {
        let dir = label_dir(&[("gpu", "has-gpu")]);
        // A regular file that fails with EIO when read from offset zero.
        std::os::unix::fs::symlink("/proc/self/mem", dir.path().join("unreadable")).unwrap();

        let definitions = scan(dir.path()).unwrap();

        assert_eq!(definitions.len(), 2);
        assert_eq!(definitions["gpu"], vec!["has-gpu".to_string()]);
        assert_eq!(definitions["unreadable"], vec![String::new()]);
    }

    #[tokio::test]
    async fn test_rebuild_replaces_definitions() {
        let dir = label_dir(&[("gpu", "has-gpu")]);
        let store = DefinitionStore::load(dir.path()).unwrap();

        fs::remove_file(dir.path().join("gpu")).unwrap();
        fs::write(dir.path().join("ssd"), "nvme").unwrap();
        let count = store.rebuild().await.unwrap();

        assert_eq!(count, 1);
        let definitions = store.read().await;
        assert!(!definitions.contains_key("gpu"));
        assert_eq!(definitions["ssd"], vec!["nvme".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_rebuild_keeps_previous_definitions() {
        let dir = label_dir(&[("gpu", "has-gpu")]);
        let store = DefinitionStore::load(dir.path()).unwrap();

        fs::remove_file(dir.path().join("gpu")).unwrap();
        let err = store.rebuild().await.unwrap_err();

        assert!(matches!(err, Error::EmptyDefinitionSet(_)));
        assert!(store.read().await.contains_key("gpu"));
    }
}
