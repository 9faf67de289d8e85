//! Packed regular-file container: an append-only tar file that is never
//! finalized (no closing zero blocks), so it keeps being a valid append
//! target across restarts and across nodes reading it remotely.
//!
//! Headers and payloads are written by hand with `tar::Header` used only
//! as a byte-level codec - never through `tar::Builder`, whose `finish()`
//! would write the terminating blocks this format depends on never
//! existing.

use crate::index::ContainerIndex;
use flocons_core::types::{DataFn, DataSource, FileMode};
use flocons_core::{FileInfo, StorageError};
use regex::Regex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

const BLOCK_SIZE: u64 = 512;

fn container_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^files_([^_]+)_([^_]+)_v([0-9]+)_([0-9]+)\.tar$").expect("valid regex")
    })
}

pub fn is_container(name: &str) -> bool {
    container_regex().is_match(name)
}

pub fn container_name(shard: &str, node: &str, number: u64) -> String {
    format!("files_{shard}_{node}_v1_{number}.tar")
}

pub struct ContainerNameParts {
    pub shard: String,
    pub node: String,
    pub version: u32,
    pub number: u64,
}

pub fn parse_container_name(name: &str) -> Option<ContainerNameParts> {
    let caps = container_regex().captures(name)?;
    Some(ContainerNameParts {
        shard: caps[1].to_string(),
        node: caps[2].to_string(),
        version: caps[3].parse().ok()?,
        number: caps[4].parse().ok()?,
    })
}

fn round_up_block(n: u64) -> u64 {
    let rem = n % BLOCK_SIZE;
    if rem == 0 {
        n
    } else {
        n + (BLOCK_SIZE - rem)
    }
}

/// One packed-file container, with an optional CSV index for O(1)
/// lookups. When `index` is `None` the container answers queries by
/// scanning its own tar headers (used for foreign containers discovered
/// without a matching index file).
pub struct Container {
    pub name: String,
    pub node: String,
    pub shard: String,
    pub version: u32,
    pub number: u64,
    path: PathBuf,
    size: AtomicI64,
    write: Mutex<Option<WriteState>>,
    pub index: Option<Arc<ContainerIndex>>,
}

struct WriteState {
    fd: File,
}

impl Container {
    /// Open an existing container, or - only for containers belonging to
    /// the current node - create an empty one.
    pub fn open(
        directory: &Path,
        name: &str,
        current_node: &str,
        index: Option<Arc<ContainerIndex>>,
    ) -> Result<Self, StorageError> {
        let parts = parse_container_name(name)
            .ok_or_else(|| StorageError::internal(format!("invalid container name {name}")))?;
        let full_path = directory.join(name);

        let stat = fs::metadata(&full_path);
        let exists = stat.is_ok();
        if let Err(e) = &stat {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(std::io::Error::from(e.kind()).into());
            }
        }

        let mut index = match index {
            Some(i) => Some(i),
            None => match ContainerIndex::find(directory, &parts.node, parts.number, current_node) {
                Ok(i) => Some(Arc::new(i)),
                Err(StorageError::NotFound(_)) => None,
                Err(e) => return Err(e),
            },
        };

        let size = if !exists && index.is_none() {
            if parts.node == current_node {
                File::create(&full_path)?;
                // Absent container, absent index, local node: create both
                // empty so the container comes up writeable immediately.
                let new_index = ContainerIndex::open_or_create(
                    directory,
                    &parts.shard,
                    &parts.node,
                    parts.number,
                    current_node,
                )?;
                index = Some(Arc::new(new_index));
                tracing::debug!(container = %name, "created new empty container and index");
                0
            } else {
                return Err(StorageError::not_found(name));
            }
        } else if exists {
            fs::metadata(&full_path)?.len() as i64
        } else {
            index.as_ref().map(|i| i.estimated_container_size()).unwrap_or(0)
        };

        Ok(Container {
            name: name.to_string(),
            node: parts.node,
            shard: parts.shard,
            version: parts.version,
            number: parts.number,
            path: full_path,
            size: AtomicI64::new(size),
            write: Mutex::new(None),
            index,
        })
    }

    pub fn size(&self) -> i64 {
        self.size.load(Ordering::SeqCst)
    }

    pub fn is_writeable(&self, current_node: &str, max_container_size: i64) -> bool {
        if self.node != current_node || self.index.is_none() {
            return false;
        }
        let size = {
            let write = self.write.lock().expect("container write mutex poisoned");
            if write.is_some() {
                self.size()
            } else {
                match fs::metadata(&self.path) {
                    Ok(m) => m.len() as i64,
                    Err(_) => return false,
                }
            }
        };
        size < max_container_size
    }

    pub fn get_regular_file(self: &Arc<Self>, name: &str) -> Result<FileInfo, StorageError> {
        let mut fi = if let Some(index) = &self.index {
            index.get(name)?
        } else {
            self.scan_for_file(name)?
        };

        let container = Arc::clone(self);
        let container_name = self.name.clone();
        let locator_address = fi.address();
        fi.update_source(DataSource {
            node: self.node.clone(),
            shard: self.shard.clone(),
            container: container_name,
            address: locator_address,
            data: Some(make_data_fn(container, fi.clone())),
        });
        Ok(fi)
    }

    fn scan_for_file(&self, name: &str) -> Result<FileInfo, StorageError> {
        let mut f = File::open(&self.path)?;
        let mut address: u64 = 0;
        loop {
            let header = match read_header(&mut f)? {
                Some(h) => h,
                None => break,
            };
            if header.name == name {
                return Ok(header_to_file_info(&header, address as i64, &self.node, &self.shard));
            }
            address = f.stream_position()?;
            address = round_up_block(address + header.size);
            f.seek(SeekFrom::Start(address))?;
        }
        Err(StorageError::not_found(name))
    }

    /// Read the payload for a located entry, by seeking straight to its
    /// address (the common case) or, if no address is known, scanning.
    pub fn get_regular_file_data(&self, fi: &FileInfo) -> Result<Vec<u8>, StorageError> {
        if !fi.container().is_empty() && fi.container() != self.name {
            return Err(StorageError::internal(format!(
                "asked for file data in wrong container ({} != {})",
                fi.container(),
                self.name
            )));
        }

        let mut f = File::open(&self.path)?;
        f.seek(SeekFrom::Start(fi.address() as u64))?;
        let header = read_header(&mut f)?.ok_or_else(|| StorageError::not_found(fi.name()))?;
        let mut buffer = vec![0u8; header.size as usize];
        f.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Append a new regular file's header and payload. Never closes the
    /// write file descriptor's tar stream with a finalizing call - the
    /// archive must remain open for the next append.
    pub fn create_regular_file(
        &self,
        current_node: &str,
        name: &str,
        mode: FileMode,
        data: &[u8],
    ) -> Result<FileInfo, StorageError> {
        if self.node != current_node {
            return Err(StorageError::internal(format!(
                "tried to write file in container of another node {}",
                self.name
            )));
        }
        flocons_core::path::validate_filename(name)?;

        let mut write = self.write.lock().expect("container write mutex poisoned");
        if write.is_none() {
            let mut fd = OpenOptions::new().read(true).write(true).create(true).open(&self.path)?;
            fd.seek(SeekFrom::End(0))?;
            *write = Some(WriteState { fd });
        }
        let state = write.as_mut().expect("just initialized");

        let address = state.fd.stream_position()?;

        let mut header = tar::Header::new_gnu();
        header.set_path(name).map_err(|e| StorageError::internal(e.to_string()))?;
        header.set_size(data.len() as u64);
        header.set_mode(mode.permission_bits());
        header.set_mtime(now_unix());
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();

        state.fd.write_all(header.as_bytes())?;
        state.fd.write_all(data)?;
        let padded = round_up_block(data.len() as u64) - data.len() as u64;
        if padded > 0 {
            state.fd.write_all(&vec![0u8; padded as usize])?;
        }
        state.fd.flush()?;

        let new_size = state.fd.stream_position()? as i64;
        self.size.store(new_size, Ordering::SeqCst);

        let fi = FileInfo::new(
            name,
            mode,
            data.len() as i64,
            std::time::UNIX_EPOCH + std::time::Duration::from_secs(now_unix()),
            DataSource {
                node: self.node.clone(),
                shard: self.shard.clone(),
                container: self.name.clone(),
                address: address as i64,
                data: None,
            },
        );

        if let Some(index) = &self.index {
            index.add(&fi)?;
        }

        Ok(fi)
    }

    pub fn list_files(&self) -> Result<Vec<FileInfo>, StorageError> {
        if let Some(index) = &self.index {
            return index.list_files();
        }

        let mut f = File::open(&self.path)?;
        let mut files = Vec::new();
        let mut address: u64 = 0;
        loop {
            let header = match read_header(&mut f)? {
                Some(h) => h,
                None => break,
            };
            files.push(header_to_file_info(&header, address as i64, &self.node, &self.shard));
            address = f.stream_position()?;
            address = round_up_block(address + header.size);
            f.seek(SeekFrom::Start(address))?;
        }
        Ok(files)
    }

    /// Close the write file descriptor. Deliberately never calls any
    /// "finish"/close on a tar writer abstraction - doing so would write
    /// the two zero blocks that terminate an archive, after which no
    /// further entry could ever be appended.
    pub fn close(&self) {
        let mut write = self.write.lock().expect("container write mutex poisoned");
        *write = None;
        if let Some(index) = &self.index {
            index.close();
        }
    }
}

fn make_data_fn(container: Arc<Container>, fi: FileInfo) -> DataFn {
    Arc::new(move || container.get_regular_file_data(&fi))
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

struct RawHeader {
    name: String,
    size: u64,
    mode: u32,
    mtime: u64,
}

/// Read one tar header at the current position. Returns `None` at a
/// zero-filled block (the would-be end-of-archive marker) or true EOF -
/// both mean "nothing more has been written here yet", which for a
/// never-finalized archive is the normal way to detect its current end.
fn read_header(f: &mut File) -> Result<Option<RawHeader>, StorageError> {
    let mut buf = [0u8; 512];
    let n = read_fill(f, &mut buf)?;
    if n < 512 || buf.iter().all(|b| *b == 0) {
        return Ok(None);
    }
    let header = tar::Header::from_byte_slice(&buf);
    let name = header
        .path()
        .map_err(|e| StorageError::internal(e.to_string()))?
        .to_string_lossy()
        .into_owned();
    let size = header.size().map_err(|e| StorageError::internal(e.to_string()))?;
    let mode = header.mode().unwrap_or(0o644);
    let mtime = header.mtime().unwrap_or(0);
    Ok(Some(RawHeader { name, size, mode, mtime }))
}

fn read_fill(f: &mut File, buf: &mut [u8]) -> Result<usize, StorageError> {
    let mut total = 0;
    while total < buf.len() {
        let n = f.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

fn header_to_file_info(header: &RawHeader, address: i64, node: &str, shard: &str) -> FileInfo {
    FileInfo::new(
        header.name.clone(),
        FileMode::from_bits(header.mode, false),
        header.size as i64,
        std::time::UNIX_EPOCH + std::time::Duration::from_secs(header.mtime),
        DataSource {
            node: node.to_string(),
            shard: shard.to_string(),
            address,
            ..Default::default()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::index_name;

    #[test]
    fn name_round_trips() {
        let name = container_name("shard-1", "node-a", 2);
        assert_eq!(name, "files_shard-1_node-a_v1_2.tar");
        assert!(is_container(&name));
        let parts = parse_container_name(&name).unwrap();
        assert_eq!(parts.shard, "shard-1");
        assert_eq!(parts.node, "node-a");
        assert_eq!(parts.number, 2);
    }

    #[test]
    fn create_then_read_back_round_trips_through_index() {
        let dir = tempfile::tempdir().unwrap();
        let index_name = index_name("shard-1", "node-a", 1);
        let index = Arc::new(ContainerIndex::open(dir.path(), &index_name, "node-a").unwrap());
        let name = container_name("shard-1", "node-a", 1);
        let container = Arc::new(Container::open(dir.path(), &name, "node-a", Some(index)).unwrap());

        let fi = container
            .create_regular_file("node-a", "a.txt", FileMode::from_bits(0o644, false), b"hello")
            .unwrap();
        assert_eq!(fi.size(), 5);

        let fetched = container.get_regular_file("a.txt").unwrap();
        let data = fetched.data().unwrap();
        assert_eq!(data, b"hello");
    }

    #[test]
    fn never_writes_terminating_blocks_so_append_after_reopen_works() {
        let dir = tempfile::tempdir().unwrap();
        let idx_name = index_name("shard-1", "node-a", 1);
        let index = Arc::new(ContainerIndex::open(dir.path(), &idx_name, "node-a").unwrap());
        let name = container_name("shard-1", "node-a", 1);
        let container = Container::open(dir.path(), &name, "node-a", Some(index)).unwrap();
        container
            .create_regular_file("node-a", "a.txt", FileMode::from_bits(0o644, false), b"one")
            .unwrap();
        container.close();

        let reopened_index = Arc::new(ContainerIndex::open(dir.path(), &idx_name, "node-a").unwrap());
        let reopened = Container::open(dir.path(), &name, "node-a", Some(reopened_index)).unwrap();
        reopened
            .create_regular_file("node-a", "b.txt", FileMode::from_bits(0o644, false), b"two")
            .unwrap();

        let files = reopened.list_files().unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn foreign_container_without_index_scans_tar_directly() {
        let dir = tempfile::tempdir().unwrap();
        let idx_name = index_name("shard-1", "node-a", 1);
        let index = Arc::new(ContainerIndex::open(dir.path(), &idx_name, "node-a").unwrap());
        let name = container_name("shard-1", "node-a", 1);
        let writer = Container::open(dir.path(), &name, "node-a", Some(index)).unwrap();
        writer
            .create_regular_file("node-a", "a.txt", FileMode::from_bits(0o644, false), b"payload")
            .unwrap();
        writer.close();

        fs::remove_file(dir.path().join(&idx_name)).unwrap();
        let reader = Container::open(dir.path(), &name, "node-a", None).unwrap();
        assert!(reader.index.is_none());
        let fi = reader.get_regular_file("a.txt").unwrap();
        assert_eq!(fi.data().unwrap(), b"payload");
    }
}
