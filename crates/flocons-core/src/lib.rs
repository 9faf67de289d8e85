//! Error taxonomy, file metadata, and configuration shared by every
//! flocons crate. Has no dependency on networking or on-disk container
//! formats.

pub mod config;
pub mod error;
pub mod path;
pub mod types;

pub use config::{Config, ConfigError};
pub use error::StorageError;
pub use types::{DataFn, DataSource, FileInfo, FileMode, DEFAULT_FILE_MIME_TYPE, DIRECTORY_MIME_TYPE};

/// Maximum path length in bytes accepted from a client.
pub const MAX_PATH_LEN: usize = 4096;

/// Maximum filename length in bytes accepted from a client.
pub const MAX_FILENAME_LEN: usize = 255;
