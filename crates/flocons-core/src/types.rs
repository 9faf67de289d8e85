//! File metadata and the data source that locates a file's bytes.

use crate::error::StorageError;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

pub const DIRECTORY_MIME_TYPE: &str = "application/x-directory";
pub const DEFAULT_FILE_MIME_TYPE: &str = "application/octet-stream";

/// Unix-style permission bits plus the directory flag, kept OS-independent
/// so a `FileInfo` can cross the wire and still mean the same thing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct FileMode(u32);

const DIR_BIT: u32 = 1 << 31;

impl FileMode {
    pub fn from_bits(bits: u32, is_dir: bool) -> Self {
        let mut v = bits & !DIR_BIT;
        if is_dir {
            v |= DIR_BIT;
        }
        FileMode(v)
    }

    pub fn is_dir(&self) -> bool {
        self.0 & DIR_BIT != 0
    }

    pub fn is_regular(&self) -> bool {
        !self.is_dir()
    }

    /// Permission bits only, with the directory marker masked out - this
    /// is what travels over the wire, since the type is carried
    /// separately in the Content-Type header.
    pub fn permission_bits(&self) -> u32 {
        self.0 & !DIR_BIT
    }
}

impl fmt::Octal for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Octal::fmt(&self.permission_bits(), f)
    }
}

/// A thunk producing a file's bytes, either by seeking into a local
/// container or by issuing an HTTP GET to the owning node.
pub type DataFn = Arc<dyn Fn() -> Result<Vec<u8>, StorageError> + Send + Sync>;

/// Locator for where a regular file's bytes actually live.
///
/// Mirrors the original `FileDataSource`: the zero value of every field
/// means "unknown", and `merge_from` only overwrites fields the incoming
/// locator actually specifies.
#[derive(Clone, Default)]
pub struct DataSource {
    pub node: String,
    pub shard: String,
    pub container: String,
    pub address: i64,
    pub data: Option<DataFn>,
}

impl DataSource {
    pub fn is_data_available(&self) -> bool {
        self.data.is_some()
    }
}

impl fmt::Debug for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSource")
            .field("node", &self.node)
            .field("shard", &self.shard)
            .field("container", &self.container)
            .field("address", &self.address)
            .field("data", &self.data.is_some())
            .finish()
    }
}

/// Metadata for a file or directory entry, with a lazily resolved data
/// source. The name, mode, size and modification time are always known;
/// the data source is attached once the entry has been located in a
/// container (or on a remote node).
#[derive(Clone, Debug)]
pub struct FileInfo {
    name: String,
    mode: FileMode,
    size: i64,
    mod_time: SystemTime,
    source: DataSource,
}

impl FileInfo {
    pub fn new(
        name: impl Into<String>,
        mode: FileMode,
        size: i64,
        mod_time: SystemTime,
        source: DataSource,
    ) -> Self {
        FileInfo {
            name: name.into(),
            mode,
            size,
            mod_time,
            source,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    pub fn mod_time(&self) -> SystemTime {
        self.mod_time
    }

    pub fn is_dir(&self) -> bool {
        self.mode.is_dir()
    }

    pub fn source(&self) -> &DataSource {
        &self.source
    }

    pub fn attach_source(&mut self, source: DataSource) {
        self.source = source;
    }

    /// Merge a newly discovered locator into this entry, field by field,
    /// never blanking a field the existing record already had.
    pub fn update_source(&mut self, incoming: DataSource) {
        if !incoming.node.is_empty() {
            self.source.node = incoming.node;
        }
        if !incoming.shard.is_empty() {
            self.source.shard = incoming.shard;
        }
        if !incoming.container.is_empty() {
            self.source.container = incoming.container;
        }
        if incoming.address != 0 {
            self.source.address = incoming.address;
        }
        if incoming.data.is_some() {
            self.source.data = incoming.data;
        }
    }

    pub fn address(&self) -> i64 {
        self.source.address
    }

    pub fn node(&self) -> &str {
        &self.source.node
    }

    pub fn shard(&self) -> &str {
        &self.source.shard
    }

    pub fn container(&self) -> &str {
        &self.source.container
    }

    pub fn is_data_available(&self) -> bool {
        self.source.is_data_available()
    }

    pub fn data(&self) -> Result<Vec<u8>, StorageError> {
        match &self.source.data {
            Some(f) => f(),
            None => Err(StorageError::internal("data source not attached")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(source: DataSource) -> FileInfo {
        FileInfo::new(
            "a.txt",
            FileMode::from_bits(0o644, false),
            4,
            SystemTime::UNIX_EPOCH,
            source,
        )
    }

    #[test]
    fn update_source_only_overwrites_present_fields() {
        let mut fi = info(DataSource {
            node: "node-a".into(),
            shard: "shard-1".into(),
            container: "files_shard-1_node-a_v1_1.tar".into(),
            address: 512,
            data: None,
        });

        fi.update_source(DataSource {
            node: String::new(),
            shard: String::new(),
            container: "files_shard-1_node-a_v1_2.tar".into(),
            address: 0,
            data: None,
        });

        assert_eq!(fi.node(), "node-a");
        assert_eq!(fi.shard(), "shard-1");
        assert_eq!(fi.container(), "files_shard-1_node-a_v1_2.tar");
        assert_eq!(fi.address(), 512);
    }

    #[test]
    fn mode_masks_directory_bit_from_permission_bits() {
        let m = FileMode::from_bits(0o755, true);
        assert!(m.is_dir());
        assert_eq!(m.permission_bits(), 0o755);
    }
}
