//! Container index: the CSV sidecar that lists the regular files packed
//! into one container, without needing to scan the tar itself.

use flocons_core::types::{DataSource, FileMode};
use flocons_core::{FileInfo, StorageError};
use regex::Regex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::sync::Mutex;
use std::time::{Duration, UNIX_EPOCH};

fn index_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^index_([^_]+)_([^_]+)_v([0-9]+)_([0-9]+)\.csv$").expect("valid regex")
    })
}

pub fn is_container_index(name: &str) -> bool {
    index_regex().is_match(name)
}

pub fn index_name(shard: &str, node: &str, number: u64) -> String {
    format!("index_{shard}_{node}_v1_{number}.csv")
}

/// A parsed container index filename.
pub struct IndexNameParts {
    pub shard: String,
    pub node: String,
    pub version: u32,
    pub number: u64,
}

pub fn parse_index_name(name: &str) -> Option<IndexNameParts> {
    let caps = index_regex().captures(name)?;
    Some(IndexNameParts {
        shard: caps[1].to_string(),
        node: caps[2].to_string(),
        version: caps[3].parse().ok()?,
        number: caps[4].parse().ok()?,
    })
}

/// The CSV sidecar for one container: `name,address,mode,size,mtime` per
/// row, appended to in order as files are written, and re-read from the
/// last known offset whenever a lookup misses (so writes from other
/// processes on the same node, or a restart, are picked up).
pub struct ContainerIndex {
    pub name: String,
    pub shard: String,
    pub node: String,
    pub version: u32,
    pub number: u64,
    path: PathBuf,
    entries: Mutex<HashMap<String, FileInfo>>,
    last_size: AtomicI64,
    write_fd: Mutex<Option<File>>,
}

impl ContainerIndex {
    /// Open (or, if this index belongs to the current node, create) the
    /// index file at `directory/name`.
    pub fn open(directory: &Path, name: &str, current_node: &str) -> Result<Self, StorageError> {
        let parts = parse_index_name(name)
            .ok_or_else(|| StorageError::internal(format!("invalid container index name {name}")))?;
        let full_path = directory.join(name);

        match fs::metadata(&full_path) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && parts.node == current_node => {
                File::create(&full_path)?;
            }
            Err(e) => return Err(e.into()),
        }

        let index = ContainerIndex {
            name: name.to_string(),
            shard: parts.shard,
            node: parts.node,
            version: parts.version,
            number: parts.number,
            path: full_path,
            entries: Mutex::new(HashMap::new()),
            last_size: AtomicI64::new(0),
            write_fd: Mutex::new(None),
        };
        index.update_entries()?;
        Ok(index)
    }

    /// Create (or reopen) the index belonging to `(shard, node, number)`
    /// directly, without a prior directory listing.
    pub fn open_or_create(
        directory: &Path,
        shard: &str,
        node: &str,
        number: u64,
        current_node: &str,
    ) -> Result<Self, StorageError> {
        Self::open(directory, &index_name(shard, node, number), current_node)
    }

    /// Locate an existing index for `(node, number)` by globbing the
    /// directory for `index_<node>_v*_<number>.csv`.
    pub fn find(directory: &Path, node: &str, number: u64, current_node: &str) -> Result<Self, StorageError> {
        let mut found = None;
        for entry in fs::read_dir(directory)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(parts) = parse_index_name(&name) {
                if parts.node == node && parts.number == number {
                    found = Some(name);
                    break;
                }
            }
        }
        match found {
            Some(name) => Self::open(directory, &name, current_node),
            None => Err(StorageError::not_found(format!(
                "index for node {node} number {number}"
            ))),
        }
    }

    pub fn get(&self, name: &str) -> Result<FileInfo, StorageError> {
        {
            let entries = self.entries.lock().expect("index entries mutex poisoned");
            if let Some(fi) = entries.get(name) {
                return Ok(fi.clone());
            }
        }
        self.update_entries()?;
        let entries = self.entries.lock().expect("index entries mutex poisoned");
        entries
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::not_found(name))
    }

    /// Append a row describing a just-written regular file.
    pub fn add(&self, fi: &FileInfo) -> Result<(), StorageError> {
        let mut write_fd = self.write_fd.lock().expect("index write_fd mutex poisoned");

        if write_fd.is_none() {
            let mut f = OpenOptions::new().read(true).write(true).create(true).open(&self.path)?;
            f.seek(SeekFrom::End(0))?;
            *write_fd = Some(f);
        }
        let f = write_fd.as_mut().expect("just initialized");

        let mtime = fi
            .mod_time()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();

        let mut row = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
        row.write_record(&[
            fi.name().to_string(),
            fi.address().to_string(),
            format!("{:o}", fi.mode().permission_bits()),
            fi.size().to_string(),
            mtime.to_string(),
        ])?;
        let bytes = row.into_inner().expect("in-memory csv writer never fails to flush");

        f.write_all(&bytes)?;
        f.flush()?;
        let new_size = f.stream_position()? as i64;
        self.last_size.store(new_size, Ordering::SeqCst);

        self.entries
            .lock()
            .expect("index entries mutex poisoned")
            .insert(fi.name().to_string(), fi.clone());
        f.sync_all()?;
        Ok(())
    }

    pub fn list_files(&self) -> Result<Vec<FileInfo>, StorageError> {
        if let Err(e) = self.update_entries() {
            tracing::warn!(index = %self.name, error = %e, "failed to refresh index before listing");
        }
        Ok(self
            .entries
            .lock()
            .expect("index entries mutex poisoned")
            .values()
            .cloned()
            .collect())
    }

    /// Re-read any rows appended since the last scan, starting exactly at
    /// the byte offset we stopped at last time.
    fn update_entries(&self) -> Result<(), StorageError> {
        let metadata = fs::metadata(&self.path)?;
        let size = metadata.len() as i64;
        let last_size = self.last_size.load(Ordering::SeqCst);
        if size <= last_size {
            return Ok(());
        }

        let mut f = File::open(&self.path)?;
        f.seek(SeekFrom::Start(last_size as u64))?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(false)
            .from_reader(f);

        let mut entries = self.entries.lock().expect("index entries mutex poisoned");
        for result in reader.records() {
            let record = match result {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(index = %self.name, error = %e, "skipping malformed index row");
                    continue;
                }
            };
            if record.len() != 5 {
                tracing::warn!(index = %self.name, "skipping index row with wrong field count");
                continue;
            }
            let name = record[0].to_string();
            let address: i64 = match record[1].parse() {
                Ok(v) => v,
                Err(_) => continue,
            };
            let mode_bits: u32 = match u32::from_str_radix(&record[2], 8) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let size: i64 = match record[3].parse() {
                Ok(v) => v,
                Err(_) => continue,
            };
            let mtime: u64 = match record[4].parse() {
                Ok(v) => v,
                Err(_) => continue,
            };

            let fi = FileInfo::new(
                name.clone(),
                FileMode::from_bits(mode_bits, false),
                size,
                UNIX_EPOCH + Duration::from_secs(mtime),
                DataSource {
                    node: self.node.clone(),
                    address,
                    ..Default::default()
                },
            );
            entries.insert(name, fi);
        }

        self.last_size.store(size, Ordering::SeqCst);
        Ok(())
    }

    pub fn close(&self) {
        let mut write_fd = self.write_fd.lock().expect("index write_fd mutex poisoned");
        *write_fd = None;
    }
}

/// Rough estimate of how large the paired container must already be,
/// based on how many bytes the index claims across all its entries. Used
/// when a container file is missing locally but its index is present
/// (the "foreign index" case): we size the remote-backed placeholder off
/// the index alone.
impl ContainerIndex {
    pub fn estimated_container_size(&self) -> i64 {
        let entries = self.entries.lock().expect("index entries mutex poisoned");
        entries.values().map(|fi| fi.address() + fi.size()).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    #[test]
    fn name_round_trips() {
        let name = index_name("shard-1", "node-a", 3);
        assert_eq!(name, "index_shard-1_node-a_v1_3.csv");
        assert!(is_container_index(&name));
        let parts = parse_index_name(&name).unwrap();
        assert_eq!(parts.shard, "shard-1");
        assert_eq!(parts.node, "node-a");
        assert_eq!(parts.number, 3);
    }

    #[test]
    fn rejects_non_matching_names() {
        assert!(!is_container_index("files_shard-1_node-a_v1_1.tar"));
        assert!(parse_index_name("index_bad.csv").is_none());
    }

    #[test]
    fn add_then_get_round_trips_and_tail_scan_picks_up_external_writes() {
        let dir = tempfile::tempdir().unwrap();
        let name = index_name("shard-1", "node-a", 1);
        let index = ContainerIndex::open(dir.path(), &name, "node-a").unwrap();

        let fi = FileInfo::new(
            "hello.txt",
            FileMode::from_bits(0o644, false),
            5,
            SystemTime::now(),
            DataSource {
                node: "node-a".into(),
                address: 0,
                ..Default::default()
            },
        );
        index.add(&fi).unwrap();

        let fetched = index.get("hello.txt").unwrap();
        assert_eq!(fetched.name(), "hello.txt");
        assert_eq!(fetched.size(), 5);

        // A fresh handle on the same file should pick up the row via its
        // own initial scan, proving the on-disk format round-trips.
        let index2 = ContainerIndex::open(dir.path(), &name, "node-a").unwrap();
        let fetched2 = index2.get("hello.txt").unwrap();
        assert_eq!(fetched2.address(), 0);
    }

    #[test]
    fn get_on_missing_entry_triggers_rescan_then_fails() {
        let dir = tempfile::tempdir().unwrap();
        let name = index_name("shard-1", "node-a", 1);
        let index = ContainerIndex::open(dir.path(), &name, "node-a").unwrap();
        let err = index.get("missing.txt").unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }
}
