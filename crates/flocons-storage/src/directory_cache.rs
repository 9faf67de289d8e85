//! Per-directory cache entry: the set of containers discovered so far in
//! one directory, plus the container currently open for writes.
//!
//! Two mutexes guard this structure, always acquired in the order
//! `write_mutex` then `containers_mutex` (never the reverse): the writer
//! needs exclusive access to decide/rotate the write container, and while
//! holding it may also need to register a brand new container under
//! `containers_mutex`. The container-discovery walker only ever takes
//! `containers_mutex`, so it never blocks a write that isn't also
//! touching the container map.

use crate::container::{self, Container};
use crate::index::{self, ContainerIndex};
use flocons_core::StorageError;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct DirectoryCacheEntry {
    pub(crate) containers_mutex: Mutex<HashMap<String, Arc<Container>>>,
    pub(crate) write_mutex: Mutex<Option<Arc<Container>>>,
}

impl DirectoryCacheEntry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by the cache's eviction callback: close the write
    /// container's file handle so the OS file descriptor isn't leaked
    /// when the entry falls out of the LRU.
    pub fn on_evict(&self) {
        let _containers = self.containers_mutex.lock().expect("containers mutex poisoned");
        let write = self.write_mutex.lock().expect("write mutex poisoned");
        if let Some(container) = write.as_ref() {
            container.close();
        }
    }
}

/// Walks a directory's containers: first the ones already known to this
/// cache entry, then any new container or index files discovered on disk
/// since the entry was last populated. Mutates `containers_mutex` only
/// while extending the map with newly discovered containers.
pub struct ContainerWalker<'a> {
    full_path: std::path::PathBuf,
    entry: &'a DirectoryCacheEntry,
    current_node: &'a str,
    known_keys: Vec<String>,
    index_in_known: usize,
    dir_listing: Option<Vec<std::fs::DirEntry>>,
    index_in_listing: usize,
}

impl<'a> ContainerWalker<'a> {
    pub fn new(full_path: &Path, entry: &'a DirectoryCacheEntry, current_node: &'a str) -> Self {
        let known_keys = entry
            .containers_mutex
            .lock()
            .expect("containers mutex poisoned")
            .keys()
            .cloned()
            .collect();
        ContainerWalker {
            full_path: full_path.to_path_buf(),
            entry,
            current_node,
            known_keys,
            index_in_known: 0,
            dir_listing: None,
            index_in_listing: 0,
        }
    }

    /// Returns the next container, discovering and registering new ones
    /// as needed, or `None` once the directory has been fully walked.
    pub fn next(&mut self) -> Result<Option<Arc<Container>>, StorageError> {
        if self.index_in_known < self.known_keys.len() {
            let key = &self.known_keys[self.index_in_known];
            self.index_in_known += 1;
            let containers = self.entry.containers_mutex.lock().expect("containers mutex poisoned");
            return Ok(containers.get(key).cloned());
        }

        if self.dir_listing.is_none() {
            let mut listing = Vec::new();
            for entry in fs::read_dir(&self.full_path)? {
                listing.push(entry?);
            }
            self.dir_listing = Some(listing);
        }

        let mut containers = self.entry.containers_mutex.lock().expect("containers mutex poisoned");
        let listing = self.dir_listing.as_ref().expect("just populated");

        while self.index_in_listing < listing.len() {
            let dir_entry = &listing[self.index_in_listing];
            self.index_in_listing += 1;

            let file_type = dir_entry.file_type()?;
            if file_type.is_dir() {
                continue;
            }
            let name = dir_entry.file_name().to_string_lossy().into_owned();

            if container::is_container(&name) {
                if containers.contains_key(&name) {
                    continue;
                }
                match Container::open(&self.full_path, &name, self.current_node, None) {
                    Ok(c) => {
                        let c = Arc::new(c);
                        containers.insert(name, c.clone());
                        return Ok(Some(c));
                    }
                    Err(e) => {
                        tracing::error!(container = %name, error = %e, "failed to open discovered container");
                        continue;
                    }
                }
            } else if index::is_container_index(&name) {
                let already_owned = containers
                    .values()
                    .any(|c| c.index.as_ref().map(|i| i.name == name).unwrap_or(false));
                if already_owned {
                    continue;
                }
                // A lonely index: its container file may not exist locally
                // (a foreign node's data, not yet replicated here) - this
                // is exactly the cross-node discovery signal. The index
                // filename carries its own shard segment, so the matching
                // container name can be synthesized even for a foreign
                // node's index; `Container::open`'s truth table resolves
                // the "container absent, index present" case into a
                // synthetic, redirect-only entry.
                match ContainerIndex::open(&self.full_path, &name, self.current_node) {
                    Ok(idx) => {
                        let container_name =
                            container::container_name(&idx.shard, idx.node.as_str(), idx.number);
                        if containers.contains_key(&container_name) {
                            continue;
                        }
                        match Container::open(&self.full_path, &container_name, self.current_node, Some(Arc::new(idx))) {
                            Ok(c) => {
                                let c = Arc::new(c);
                                containers.insert(container_name, c.clone());
                                return Ok(Some(c));
                            }
                            Err(e) => {
                                tracing::error!(index = %name, error = %e, "failed to open container for lonely index");
                                continue;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(index = %name, error = %e, "failed to open lonely index");
                        continue;
                    }
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walker_discovers_containers_written_directly_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let idx_name = index::index_name("shard-1", "node-a", 1);
        let idx = ContainerIndex::open(dir.path(), &idx_name, "node-a").unwrap();
        let name = container::container_name("shard-1", "node-a", 1);
        let c = Container::open(dir.path(), &name, "node-a", Some(Arc::new(idx))).unwrap();
        c.create_regular_file(
            "node-a",
            "a.txt",
            flocons_core::FileMode::from_bits(0o644, false),
            b"x",
        )
        .unwrap();
        c.close();

        let entry = DirectoryCacheEntry::new();
        let mut walker = ContainerWalker::new(dir.path(), &entry, "node-a");
        let found = walker.next().unwrap();
        assert!(found.is_some());
        assert!(walker.next().unwrap().is_none());
    }
}
