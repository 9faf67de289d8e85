//! The storage engine: the filesystem-shaped surface (`create_directory`,
//! `get_file`, `read_dir`, ...) backed by an LRU cache of per-directory
//! container state.

use crate::container::{self, Container};
use crate::directory_cache::{ContainerWalker, DirectoryCacheEntry};
use flocons_core::types::FileMode;
use flocons_core::{Config, FileInfo, StorageError};
use lru::LruCache;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const DIRECTORY_CACHE_SIZE: usize = 1000;

fn default_max_container_size() -> i64 {
    64 * 1024 * 1024
}

pub struct StorageEngine {
    root: PathBuf,
    node_name: String,
    shard: String,
    max_container_size: i64,
    directory_cache: Mutex<LruCache<String, Arc<DirectoryCacheEntry>>>,
}

impl StorageEngine {
    /// Build a new engine rooted at `config.storage.path`, statting the
    /// root and round-tripping a throwaway file to confirm write
    /// permission before accepting any requests.
    pub fn new(config: &Config) -> Result<Self, StorageError> {
        if config.storage.path.is_empty() {
            return Err(StorageError::internal("no configured storage path"));
        }
        if config.node.name.is_empty() {
            return Err(StorageError::internal("no configured node name"));
        }

        let root = PathBuf::from(&config.storage.path);
        let meta = fs::metadata(&root)?;
        if !meta.is_dir() {
            return Err(StorageError::IsNotDir(root.display().to_string()));
        }

        let test_path = root.join("flocons-test");
        fs::write(&test_path, b"")
            .map_err(|_| StorageError::Permission(root.display().to_string()))?;
        fs::remove_file(&test_path)
            .map_err(|_| StorageError::Permission(root.display().to_string()))?;

        let max_container_size = parse_max_size(&config.storage.max_size).unwrap_or_else(default_max_container_size);

        Ok(StorageEngine {
            root,
            node_name: config.node.name.clone(),
            shard: config.node.shard.clone(),
            max_container_size,
            directory_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(DIRECTORY_CACHE_SIZE).expect("nonzero cache size"),
            )),
        })
    }

    /// Resolve a client-supplied path against the storage root, rejecting
    /// traversal attempts.
    pub fn make_absolute(&self, p: &str) -> Result<PathBuf, StorageError> {
        flocons_core::path::safe_path(&self.root, p.trim_start_matches('/'))
    }

    pub fn create_directory(&self, p: &str, mode: FileMode) -> Result<FileInfo, StorageError> {
        let full_path = self.make_absolute(p)?;
        let mode = FileMode::from_bits(mode.permission_bits() | 0o700, true);
        tracing::debug!(path = %full_path.display(), mode = ?mode, "create directory");
        fs::create_dir(&full_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&full_path, fs::Permissions::from_mode(mode.permission_bits()))?;
        }
        stat_to_file_info(&full_path)
    }

    pub fn create_directory_and_parents(&self, p: &str, mode: FileMode) -> Result<FileInfo, StorageError> {
        let full_path = self.make_absolute(p)?;
        tracing::debug!(path = %full_path.display(), "create directory and parents");
        fs::create_dir_all(&full_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let bits = mode.permission_bits() | 0o700;
            fs::set_permissions(&full_path, fs::Permissions::from_mode(bits))?;
        }
        stat_to_file_info(&full_path)
    }

    pub fn get_directory(&self, p: &str) -> Result<FileInfo, StorageError> {
        let full_path = self.make_absolute(p)?;
        let fi = stat_to_file_info(&full_path)?;
        if !fi.is_dir() {
            return Err(StorageError::IsNotDir(p.to_string()));
        }
        Ok(fi)
    }

    pub fn create_regular_file(&self, p: &str, mode: FileMode, data: &[u8]) -> Result<FileInfo, StorageError> {
        let directory = parent_of(p);
        self.get_directory(&directory)?;

        let cache_entry = self.directory_cache_entry(&directory);
        let write_container = self.ensure_write_container(&directory, &cache_entry)?;
        let name = base_name(p);
        write_container.create_regular_file(&self.node_name, &name, mode, data)
    }

    pub fn get_regular_file(&self, p: &str) -> Result<FileInfo, StorageError> {
        let directory = parent_of(p);
        let full_directory = self.make_absolute(&directory)?;
        let file_name = base_name(p);

        let meta = fs::metadata(&full_directory)?;
        if !meta.is_dir() {
            return Err(StorageError::IsNotDir(directory));
        }

        let cache_entry = self.directory_cache_entry(&directory);
        let mut walker = ContainerWalker::new(&full_directory, &cache_entry, &self.node_name);
        loop {
            let container = walker.next()?;
            let container = match container {
                Some(c) => c,
                None => return Err(StorageError::not_found(p)),
            };
            if let Ok(fi) = container.get_regular_file(&file_name) {
                return Ok(fi);
            }
        }
    }

    pub fn get_file(&self, p: &str) -> Result<FileInfo, StorageError> {
        match self.get_directory(p) {
            Ok(fi) => Ok(fi),
            Err(dir_err) => match self.get_regular_file(p) {
                Ok(fi) => Ok(fi),
                Err(file_err) => {
                    if matches!(dir_err, StorageError::Permission(_)) {
                        Err(dir_err)
                    } else {
                        Err(file_err)
                    }
                }
            },
        }
    }

    pub fn read_dir(&self, directory: &str) -> Result<Vec<FileInfo>, StorageError> {
        let full_path = self.make_absolute(directory)?;
        let meta = fs::metadata(&full_path)?;
        if !meta.is_dir() {
            return Err(StorageError::IsNotDir(full_path.display().to_string()));
        }

        let mut dirs = Vec::new();
        for entry in fs::read_dir(&full_path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(stat_to_file_info(&entry.path())?);
            }
        }
        dirs.sort_by(|a, b| a.name().cmp(b.name()));

        let cache_entry = self.directory_cache_entry(directory);
        let mut walker = ContainerWalker::new(&full_path, &cache_entry, &self.node_name);
        let mut files = Vec::new();
        while let Some(container) = walker.next()? {
            if let Ok(fs) = container.list_files() {
                files.extend(fs);
            }
        }
        files.sort_by(|a, b| a.name().cmp(b.name()));

        dirs.extend(files);
        Ok(dirs)
    }

    pub fn reset_cache(&self) {
        self.directory_cache.lock().expect("directory cache mutex poisoned").clear();
    }

    pub fn close(&self) {
        self.reset_cache();
    }

    /// Close every cached container and remove the root tree entirely.
    /// Irreversible; used by tests and by a node's full-wipe recovery path.
    pub fn destroy(&self) -> Result<(), StorageError> {
        self.reset_cache();
        fs::remove_dir_all(&self.root)?;
        Ok(())
    }

    fn directory_cache_entry(&self, directory: &str) -> Arc<DirectoryCacheEntry> {
        let mut cache = self.directory_cache.lock().expect("directory cache mutex poisoned");
        if let Some(entry) = cache.get(directory) {
            return Arc::clone(entry);
        }
        let entry = Arc::new(DirectoryCacheEntry::new());
        if let Some((_, evicted)) = cache.push(directory.to_string(), Arc::clone(&entry)) {
            evicted.on_evict();
        }
        entry
    }

    /// Ensure the directory has a writeable container, rotating to a new
    /// one if the current one is full, or adopting/creating one by
    /// walking the directory if none is open yet.
    fn ensure_write_container(
        &self,
        directory: &str,
        cache_entry: &Arc<DirectoryCacheEntry>,
    ) -> Result<Arc<Container>, StorageError> {
        let mut write_guard = cache_entry.write_mutex.lock().expect("write mutex poisoned");

        if let Some(current) = write_guard.as_ref() {
            if !current.is_writeable(&self.node_name, self.max_container_size) {
                tracing::info!(container = %current.name, "container is full, closing");
                current.close();
                *write_guard = None;
            }
        }

        if write_guard.is_none() {
            let full_path = self.make_absolute(directory)?;
            let mut max_number: u64 = 0;
            let mut candidate: Option<Arc<Container>> = None;

            let mut walker = ContainerWalker::new(&full_path, cache_entry, &self.node_name);
            while let Some(container) = walker.next()? {
                if container.node == self.node_name && container.number > max_number {
                    max_number = container.number;
                }
                if container.is_writeable(&self.node_name, self.max_container_size) {
                    let better = match &candidate {
                        Some(c) => c.number < container.number,
                        None => true,
                    };
                    if better {
                        candidate = Some(container);
                    }
                }
            }

            let write_container = match candidate {
                Some(c) => c,
                None => {
                    let name = container::container_name(&self.shard, &self.node_name, max_number + 1);
                    tracing::info!(directory, container = %name, "no writeable container found, creating new one");
                    let new_container = Container::open(&full_path, &name, &self.node_name, None)
                        .map_err(|e| StorageError::internal(format!("could not create new container: {e}")))?;
                    let new_container = Arc::new(new_container);
                    cache_entry
                        .containers_mutex
                        .lock()
                        .expect("containers mutex poisoned")
                        .insert(name, Arc::clone(&new_container));
                    new_container
                }
            };
            *write_guard = Some(write_container);
        }

        Ok(Arc::clone(write_guard.as_ref().expect("just ensured")))
    }
}

fn parent_of(p: &str) -> String {
    match Path::new(p).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_string_lossy().into_owned(),
        _ => String::new(),
    }
}

fn base_name(p: &str) -> String {
    Path::new(p)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn stat_to_file_info(path: &Path) -> Result<FileInfo, StorageError> {
    let meta = fs::metadata(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    #[cfg(unix)]
    let mode_bits = {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o777
    };
    #[cfg(not(unix))]
    let mode_bits: u32 = if meta.is_dir() { 0o755 } else { 0o644 };

    Ok(FileInfo::new(
        name,
        FileMode::from_bits(mode_bits, meta.is_dir()),
        meta.len() as i64,
        meta.modified().unwrap_or(std::time::UNIX_EPOCH),
        Default::default(),
    ))
}

/// Parse a human-readable size like "64MB" or a plain byte count; falls
/// back to `None` (caller applies the default) on anything unparseable.
fn parse_max_size(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let lower = raw.to_ascii_lowercase();
    let (digits, multiplier) = if let Some(stripped) = lower.strip_suffix("gb") {
        (stripped, 1024 * 1024 * 1024)
    } else if let Some(stripped) = lower.strip_suffix("mb") {
        (stripped, 1024 * 1024)
    } else if let Some(stripped) = lower.strip_suffix("kb") {
        (stripped, 1024)
    } else {
        (lower.as_str(), 1)
    };
    digits.trim().parse::<i64>().ok().map(|n| n * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flocons_core::config::{Config, NodeSection, StorageSection};

    fn test_config(root: &Path) -> Config {
        Config {
            namespace: "flocons".into(),
            zookeeper: vec!["127.0.0.1:2181".into()],
            node: NodeSection {
                name: "node-a".into(),
                port: 62116,
                external_address: "http://node-a:62116".into(),
                shard: "shard-1".into(),
            },
            storage: StorageSection {
                path: root.to_string_lossy().into_owned(),
                max_size: "1MB".into(),
            },
            sync: Default::default(),
        }
    }

    #[test]
    fn create_and_read_back_a_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StorageEngine::new(&test_config(dir.path())).unwrap();

        engine.create_directory_and_parents("docs", FileMode::from_bits(0o755, true)).unwrap();
        let fi = engine
            .create_regular_file("docs/readme.txt", FileMode::from_bits(0o644, false), b"hello world")
            .unwrap();
        assert_eq!(fi.size(), 11);

        let fetched = engine.get_regular_file("docs/readme.txt").unwrap();
        assert_eq!(fetched.data().unwrap(), b"hello world");
    }

    #[test]
    fn read_dir_lists_subdirectories_and_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StorageEngine::new(&test_config(dir.path())).unwrap();

        engine.create_directory_and_parents("a", FileMode::from_bits(0o755, true)).unwrap();
        engine.create_regular_file("a/z.txt", FileMode::from_bits(0o644, false), b"1").unwrap();
        engine.create_regular_file("a/b.txt", FileMode::from_bits(0o644, false), b"2").unwrap();
        engine.create_directory("a/sub", FileMode::from_bits(0o755, true)).unwrap();

        let entries = engine.read_dir("a").unwrap();
        let names: Vec<_> = entries.iter().map(|f| f.name().to_string()).collect();
        assert!(names.contains(&"sub".to_string()));
        let idx_b = names.iter().position(|n| n == "b.txt").unwrap();
        let idx_z = names.iter().position(|n| n == "z.txt").unwrap();
        assert!(idx_b < idx_z);
    }

    #[test]
    fn container_rotates_once_max_size_is_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.storage.max_size = "32".into();
        let engine = StorageEngine::new(&config).unwrap();

        engine.create_directory_and_parents("a", FileMode::from_bits(0o755, true)).unwrap();
        let payload = vec![b'x'; 40];
        let first = engine.create_regular_file("a/big1.bin", FileMode::from_bits(0o644, false), &payload).unwrap();
        let second = engine.create_regular_file("a/big2.bin", FileMode::from_bits(0o644, false), &payload).unwrap();
        assert_ne!(first.container(), second.container());
    }

    #[test]
    fn get_file_on_missing_path_returns_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StorageEngine::new(&test_config(dir.path())).unwrap();
        let err = engine.get_file("nope.txt").unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn read_dir_sorts_subdirectories_lexicographically_before_files() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StorageEngine::new(&test_config(dir.path())).unwrap();

        engine.create_directory_and_parents("a", FileMode::from_bits(0o755, true)).unwrap();
        engine.create_directory("a/zebra", FileMode::from_bits(0o755, true)).unwrap();
        engine.create_directory("a/apple", FileMode::from_bits(0o755, true)).unwrap();
        engine.create_directory("a/mango", FileMode::from_bits(0o755, true)).unwrap();
        engine.create_regular_file("a/z.txt", FileMode::from_bits(0o644, false), b"1").unwrap();
        engine.create_regular_file("a/b.txt", FileMode::from_bits(0o644, false), b"2").unwrap();

        let entries = engine.read_dir("a").unwrap();
        let names: Vec<_> = entries.iter().map(|f| f.name().to_string()).collect();
        assert_eq!(names, vec!["apple", "mango", "zebra", "b.txt", "z.txt"]);
    }

    #[test]
    fn destroy_removes_root_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let engine = StorageEngine::new(&test_config(&root)).unwrap();

        engine.create_directory_and_parents("a", FileMode::from_bits(0o755, true)).unwrap();
        engine.create_regular_file("a/f.txt", FileMode::from_bits(0o644, false), b"data").unwrap();

        engine.destroy().unwrap();
        assert!(!root.exists());
    }
}
